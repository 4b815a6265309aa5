//! Managed-cluster informer
//!
//! The informer watches two kinds of resources and keeps an in-memory view of them for the request
//! path:
//!
//! - Each `ManagedCluster` contributes its name and the set of its label keys. The union of all
//!   label keys is the set of labels that may be exposed by the synthetic label-discovery metric.
//! - A single ConfigMap persists the label allowlist. Administrators edit it to suppress labels;
//!   the informer folds those edits into its in-memory copy.
//!
//! A reconcile loop recomputes the allowlist whenever the set of distinct cluster labels changes,
//! when the ConfigMap changes, and periodically, writing the ConfigMap back only when it differs
//! from the computed list. Reconciliation does nothing until both watches have completed their
//! initial list so that a partial view never overwrites a correct allowlist.
//!
//! Watch events request a reconcile through a single-slot signal, so a burst of events collapses
//! into one pass.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_index;
pub mod metrics;
mod reconcile;
mod store;
mod watch;


pub use self::{
    cluster_index::ClusterIndex,
    reconcile::{run, sync_allowlist},
    store::{AllowlistStore, KubeStore},
    watch::{index_allowlist, index_clusters},
};
use parking_lot::RwLock;
use rbac_query_proxy_core::{ManagedClusterInformable, ManagedClusterLabelAllowList};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

/// A handle to the informer's state. Clones share the same state.
#[derive(Clone, Debug)]
pub struct Informer(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    clusters: RwLock<ClusterIndex>,
    allowlist: RwLock<ManagedClusterLabelAllowList>,
    clusters_synced: AtomicBool,
    allowlist_synced: AtomicBool,
    resync: Notify,
}

// === impl Informer ===

impl Informer {
    /// Creates an informer whose allowlist starts out holding only the required labels.
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            allowlist: RwLock::new(ManagedClusterLabelAllowList::minimal()),
            ..Inner::default()
        }))
    }

    /// Requests a reconcile. Requests made before the reconcile loop observes them are merged.
    pub fn request_resync(&self) {
        self.0.resync.notify_one();
    }

    pub(crate) async fn resync_requested(&self) {
        self.0.resync.notified().await
    }

    pub fn clusters(&self) -> &RwLock<ClusterIndex> {
        &self.0.clusters
    }

    pub(crate) fn allowlist(&self) -> &RwLock<ManagedClusterLabelAllowList> {
        &self.0.allowlist
    }

    pub(crate) fn mark_clusters_synced(&self) {
        self.0.clusters_synced.store(true, Ordering::Release);
    }

    pub(crate) fn mark_allowlist_synced(&self) {
        self.0.allowlist_synced.store(true, Ordering::Release);
    }
}

impl Default for Informer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedClusterInformable for Informer {
    fn has_synced(&self) -> bool {
        self.0.clusters_synced.load(Ordering::Acquire)
            && self.0.allowlist_synced.load(Ordering::Acquire)
    }

    fn managed_cluster_names(&self) -> BTreeMap<String, String> {
        self.0
            .clusters
            .read()
            .cluster_names()
            .map(|name| (name.to_string(), name.to_string()))
            .collect()
    }

    fn managed_cluster_label_list(&self) -> ManagedClusterLabelAllowList {
        self.0.allowlist.read().clone()
    }
}
