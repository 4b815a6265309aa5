use crate::{AllowlistStore, Informer};
use anyhow::{Context, Result};
use rbac_query_proxy_core::{
    allowlist::generate_allowlist, ManagedClusterInformable, ManagedClusterLabelAllowList,
};
use rbac_query_proxy_k8s_api::allowlist;
use tokio::time;

/// Recomputes the allowlist and persists it if it differs from the ConfigMap.
///
/// Returns true if the ConfigMap was written. Does nothing until the informer has synced.
pub async fn sync_allowlist<S>(informer: &Informer, store: &S) -> Result<bool>
where
    S: AllowlistStore + ?Sized,
{
    if !informer.has_synced() {
        tracing::debug!("Informer not synced; skipping reconcile");
        return Ok(false);
    }

    let label_sets = informer.clusters().read().label_sets().clone();
    let last_known = informer.allowlist().read().clone();

    let on_cluster = store.get().await.context("failed to read allowlist")?;
    let current = match on_cluster.as_ref().map(allowlist::decode) {
        Some(Ok(list)) => list,
        Some(Err(error)) => {
            tracing::warn!(%error, "Allowlist is invalid; it will be overwritten");
            ManagedClusterLabelAllowList::minimal()
        }
        None => ManagedClusterLabelAllowList::minimal(),
    };

    let updated = generate_allowlist(&current, &last_known, &label_sets);

    let written = match on_cluster {
        None => {
            let cm = allowlist::encode(store.namespace(), store.name(), &updated)?;
            store.create(&cm).await.context("failed to create allowlist")?;
            tracing::info!(labels = updated.label_list.len(), "Created allowlist");
            true
        }
        Some(mut cm) if !updated.equivalent(&current) => {
            allowlist::set(&mut cm, &updated)?;
            store.replace(&cm).await.context("failed to update allowlist")?;
            tracing::info!(
                labels = updated.label_list.len(),
                ignored = updated.ignore_list.len(),
                "Updated allowlist"
            );
            true
        }
        Some(_) => false,
    };

    *informer.allowlist().write() = updated;
    Ok(written)
}

/// Reconciles the allowlist whenever a resync is requested and at least once every `period`.
///
/// Failures are logged and retried on the next trigger.
pub async fn run<S: AllowlistStore>(informer: Informer, store: S, period: time::Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = informer.resync_requested() => {}
        }

        if let Err(error) = sync_allowlist(&informer, &store).await {
            tracing::warn!(error = %format_args!("{error:#}"), "Failed to reconcile allowlist");
        }
    }
}
