use crate::Informer;
use futures::prelude::*;
use kube::runtime::watcher::Event;
use rbac_query_proxy_k8s_api::{allowlist, ConfigMap, ManagedCluster, ResourceExt};

/// Indexes managed-cluster watch events until the stream ends.
pub async fn index_clusters(informer: Informer, events: impl Stream<Item = Event<ManagedCluster>>) {
    tokio::pin!(events);

    let mut initial = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            Event::Apply(cluster) => {
                let name = cluster.name_unchecked();
                let labels = cluster.label_keys();
                tracing::debug!(%name, labels = labels.len(), "Managed cluster updated");
                if informer.clusters().write().apply(name, labels) {
                    informer.request_resync();
                }
            }

            Event::Delete(cluster) => {
                let name = cluster.name_unchecked();
                tracing::debug!(%name, "Managed cluster deleted");
                if informer.clusters().write().delete(&name) {
                    informer.request_resync();
                }
            }

            Event::Init => initial.clear(),
            Event::InitApply(cluster) => {
                let labels = cluster.label_keys();
                initial.push((cluster.name_unchecked(), labels));
            }
            Event::InitDone => {
                let clusters = std::mem::take(&mut initial);
                let count = clusters.len();
                informer.clusters().write().reset(clusters);
                tracing::info!(clusters = count, "Managed clusters listed");
                informer.mark_clusters_synced();
                informer.request_resync();
            }
        }
    }
}

/// Folds allowlist ConfigMap watch events into the in-memory allowlist until the stream ends.
///
/// The stream must be scoped to the allowlist ConfigMap.
pub async fn index_allowlist(informer: Informer, events: impl Stream<Item = Event<ConfigMap>>) {
    tokio::pin!(events);

    let mut initial = None;
    while let Some(event) = events.next().await {
        match event {
            Event::Apply(cm) => {
                merge(&informer, &cm);
                informer.request_resync();
            }

            Event::Delete(cm) => {
                tracing::info!(name = %cm.name_unchecked(), "Allowlist deleted; it will be recreated");
                informer.request_resync();
            }

            Event::Init => initial = None,
            Event::InitApply(cm) => initial = Some(cm),
            Event::InitDone => {
                match initial.take() {
                    Some(cm) => merge(&informer, &cm),
                    None => tracing::info!("Allowlist not found; it will be created"),
                }
                informer.mark_allowlist_synced();
                informer.request_resync();
            }
        }
    }
}

fn merge(informer: &Informer, cm: &ConfigMap) {
    match allowlist::decode(cm) {
        Ok(edited) => {
            let mut list = informer.allowlist().write();
            list.merge_edits(&edited);
            tracing::debug!(
                labels = list.label_list.len(),
                ignored = list.ignore_list.len(),
                "Allowlist updated"
            );
        }
        Err(error) => {
            tracing::warn!(%error, name = %cm.name_unchecked(), "Ignoring invalid allowlist");
        }
    }
}
