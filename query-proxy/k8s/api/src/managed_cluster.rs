use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A cluster registered with the hub.
///
/// Only the object's labels are consumed; the spec is modeled loosely so that fields added by newer
/// hub versions do not break decoding.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default)]
    pub hub_accepts_client: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
}

// === impl ManagedCluster ===

impl ManagedCluster {
    /// The set of label keys set on the cluster object.
    pub fn label_keys(&self) -> BTreeSet<String> {
        self.metadata
            .labels
            .iter()
            .flat_map(|labels| labels.keys().cloned())
            .collect()
    }
}
