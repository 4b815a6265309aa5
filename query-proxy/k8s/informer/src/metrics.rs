use crate::Informer;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(Informer);

pub fn register(reg: &mut Registry, informer: Informer) {
    reg.register_collector(Box::new(Instrumented(informer)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let clusters = self.0.clusters().read().len();
        let (labels, ignored) = {
            let list = self.0.allowlist().read();
            (list.enabled_labels().count(), list.ignore_list.len())
        };

        let clusters_encoder = encoder.encode_descriptor(
            "managed_clusters",
            "The number of managed clusters known to the informer",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(clusters as u32).encode(clusters_encoder)?;

        let labels_encoder = encoder.encode_descriptor(
            "allowlist_labels",
            "The number of enabled labels in the managed cluster label allowlist",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(labels as u32).encode(labels_encoder)?;

        let ignored_encoder = encoder.encode_descriptor(
            "allowlist_ignored_labels",
            "The number of ignored labels in the managed cluster label allowlist",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(ignored as u32).encode(ignored_encoder)?;

        Ok(())
    }
}
