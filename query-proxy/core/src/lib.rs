//! Core types for the RBAC query proxy.
//!
//! The proxy sits in front of a multi-tenant metrics store that aggregates data from many managed
//! clusters. For every inbound query it determines which clusters and namespaces the caller may see
//! and rewrites the query so that the store only returns that data:
//!
//! - [`rewrite`] injects label matchers into every selector of a PromQL expression.
//! - [`access`] turns an access-review result into a per-cluster namespace allow-set and answers
//!   questions about it (is the caller unrestricted? which namespaces are common to a set of
//!   clusters? which clusters does a query reference?).
//! - [`allowlist`] models the managed-cluster label allowlist that backs the synthetic
//!   label-discovery metric.
//!
//! Nothing in this crate performs I/O. The collaborators that do are described by the
//! [`AccessReviewer`] and [`ManagedClusterInformable`] traits.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod allowlist;
pub mod rewrite;

pub use self::{
    access::AccessControlMap,
    allowlist::{ManagedClusterLabelAllowList, CLUSTERSET_LABEL, NAME_LABEL},
};
use std::collections::BTreeMap;

/// The label that identifies the managed cluster a series originated from.
pub const CLUSTER_LABEL: &str = "cluster";

/// The label that identifies the namespace a series originated from.
pub const NAMESPACE_LABEL: &str = "namespace";

/// A synthetic metric whose series describe the labels of each managed cluster. Its series carry
/// the cluster's identity in the `name` label rather than `cluster`.
pub const MANAGED_CLUSTER_LABEL_METRIC: &str = "acm_managed_cluster_labels";

/// Namespace (or cluster) wildcard in access-review results.
pub const WILDCARD: &str = "*";

/// Reviews a bearer token's access to metrics.
#[async_trait::async_trait]
pub trait AccessReviewer {
    /// Returns the namespaces the token may read, keyed by cluster name.
    ///
    /// A `"*"` cluster key applies its namespaces to every cluster; a `"*"` namespace (or an empty
    /// namespace list) grants every namespace on that cluster.
    async fn get_metrics_access(&self, token: &str) -> anyhow::Result<BTreeMap<String, Vec<String>>>;
}

/// Read access to the informer's view of the managed-cluster fleet.
pub trait ManagedClusterInformable {
    /// Indicates whether the initial list of clusters and of the allowlist ConfigMap completed.
    fn has_synced(&self) -> bool;

    /// Returns the names of all known managed clusters, keyed by name.
    fn managed_cluster_names(&self) -> BTreeMap<String, String>;

    /// Returns a snapshot of the current label allowlist.
    fn managed_cluster_label_list(&self) -> ManagedClusterLabelAllowList;
}
