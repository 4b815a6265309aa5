use crate::client::{self, HttpClient};
use anyhow::Result;
use rbac_query_proxy_core::AccessReviewer;
use std::collections::BTreeMap;

/// Reviews access by calling an HTTP endpoint that returns a `{cluster: [namespace]}` object.
#[derive(Clone, Debug)]
pub struct HttpAccessReviewer {
    client: HttpClient,
    url: String,
}

/// Grants nothing, so that access derives from legacy projects alone.
#[derive(Clone, Debug, Default)]
pub struct NoAccessReviewer(());

// === impl HttpAccessReviewer ===

impl HttpAccessReviewer {
    pub fn new(client: HttpClient, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait::async_trait]
impl AccessReviewer for HttpAccessReviewer {
    async fn get_metrics_access(&self, token: &str) -> Result<BTreeMap<String, Vec<String>>> {
        client::get_json(&self.client, &self.url, token).await
    }
}

#[async_trait::async_trait]
impl AccessReviewer for NoAccessReviewer {
    async fn get_metrics_access(&self, _: &str) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(BTreeMap::new())
    }
}
