use crate::{cache::UserProjectCache, legacy::LegacyApi};
use anyhow::{Context, Result};
use rbac_query_proxy_core::{
    access::{self, AccessControlMap},
    AccessReviewer, ManagedClusterInformable,
};
use std::sync::Arc;

/// Computes the clusters and namespaces a caller may read.
#[derive(Clone)]
pub struct AccessResolver {
    reviewer: Arc<dyn AccessReviewer + Send + Sync>,
    legacy: Arc<dyn LegacyApi>,
    informer: Arc<dyn ManagedClusterInformable + Send + Sync>,
    cache: UserProjectCache,
}

// === impl AccessResolver ===

impl AccessResolver {
    pub fn new(
        reviewer: Arc<dyn AccessReviewer + Send + Sync>,
        legacy: Arc<dyn LegacyApi>,
        informer: Arc<dyn ManagedClusterInformable + Send + Sync>,
        cache: UserProjectCache,
    ) -> Self {
        Self {
            reviewer,
            legacy,
            informer,
            cache,
        }
    }

    pub fn informer(&self) -> &(dyn ManagedClusterInformable + Send + Sync) {
        &*self.informer
    }

    pub fn legacy(&self) -> &dyn LegacyApi {
        &*self.legacy
    }

    /// Resolves the caller's access map.
    ///
    /// Fails only if the access review fails. Legacy projects that name a known managed cluster
    /// grant every namespace on that cluster unless the review already lists it.
    pub async fn resolve(&self, username: &str, token: &str) -> Result<AccessControlMap> {
        let projects = self.projects(username, token).await;
        self.resolve_with_projects(username, token, projects).await
    }

    /// Resolves the caller's access map from an already looked-up project list.
    pub async fn resolve_with_projects(
        &self,
        username: &str,
        token: &str,
        projects: Vec<String>,
    ) -> Result<AccessControlMap> {
        let raw = self
            .reviewer
            .get_metrics_access(token)
            .await
            .context("access review failed")?;

        let clusters = self.informer.managed_cluster_names();
        let mut access = access::merge_wildcard(raw, clusters.keys().map(String::as_str));

        access::grant_clusters(
            &mut access,
            projects
                .into_iter()
                .filter(|project| clusters.contains_key(project)),
        );

        tracing::debug!(%username, clusters = access.len(), "Resolved access");
        Ok(access)
    }

    /// Returns the token's legacy projects, fetching and caching them on a miss.
    ///
    /// Fetch failures yield no projects and are not cached.
    pub async fn projects(&self, username: &str, token: &str) -> Vec<String> {
        if let Some(projects) = self.cache.get(token) {
            return projects;
        }
        match self.legacy.projects(token).await {
            Ok(projects) => {
                self.cache
                    .put(username.to_string(), token.to_string(), projects.clone());
                projects
            }
            Err(error) => {
                tracing::warn!(%username, error = %format_args!("{error:#}"), "Failed to list projects");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for AccessResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
