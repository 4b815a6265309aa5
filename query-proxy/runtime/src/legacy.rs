use crate::client::{self, HttpClient};
use anyhow::Result;
use serde::Deserialize;

/// The user-info and project APIs of the hub's API server.
#[async_trait::async_trait]
pub trait LegacyApi: Send + Sync {
    /// Resolves the user a bearer token belongs to.
    async fn username(&self, token: &str) -> Result<String>;

    /// Lists the names of the projects a bearer token may access.
    async fn projects(&self, token: &str) -> Result<Vec<String>>;
}

#[derive(Clone, Debug)]
pub struct OpenShiftApi {
    client: HttpClient,
    base: String,
}

#[derive(Debug, Deserialize)]
struct User {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    #[serde(default)]
    items: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

// === impl OpenShiftApi ===

impl OpenShiftApi {
    pub fn new(client: HttpClient, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn users_uri(&self) -> String {
        format!("{}/apis/user.openshift.io/v1/users/~", self.base)
    }

    fn projects_uri(&self) -> String {
        format!("{}/apis/project.openshift.io/v1/projects", self.base)
    }
}

#[async_trait::async_trait]
impl LegacyApi for OpenShiftApi {
    async fn username(&self, token: &str) -> Result<String> {
        let user = client::get_json::<User>(&self.client, &self.users_uri(), token).await?;
        Ok(user.metadata.name)
    }

    async fn projects(&self, token: &str) -> Result<Vec<String>> {
        let list = client::get_json::<ProjectList>(&self.client, &self.projects_uri(), token).await?;
        Ok(list.items.into_iter().map(|p| p.metadata.name).collect())
    }
}
