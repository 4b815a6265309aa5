use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ReloadMetrics {
    reloads: Family<ReloadLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReloadLabels {
    result: &'static str,
}

// === impl ReloadMetrics ===

impl ReloadMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reloads = Family::<ReloadLabels, Counter>::default();
        reg.register(
            "tls_reloads",
            "Count of attempts to reload rotated upstream TLS credentials",
            reloads.clone(),
        );
        Self { reloads }
    }

    pub(crate) fn succeeded(&self) {
        self.reloads
            .get_or_create(&ReloadLabels { result: "success" })
            .inc();
    }

    pub(crate) fn failed(&self) {
        self.reloads
            .get_or_create(&ReloadLabels { result: "failure" })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, result: &'static str) -> u64 {
        self.reloads.get_or_create(&ReloadLabels { result }).get()
    }
}
