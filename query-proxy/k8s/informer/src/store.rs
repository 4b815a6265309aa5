use anyhow::Result;
use rbac_query_proxy_k8s_api::{Api, Client, ConfigMap, PostParams};

/// Reads and writes the allowlist ConfigMap.
#[async_trait::async_trait]
pub trait AllowlistStore: Send + Sync {
    fn namespace(&self) -> &str;

    fn name(&self) -> &str;

    async fn get(&self) -> Result<Option<ConfigMap>>;

    async fn create(&self, cm: &ConfigMap) -> Result<()>;

    /// Replaces the ConfigMap. The object's resource version guards against lost updates.
    async fn replace(&self, cm: &ConfigMap) -> Result<()>;
}

/// Stores the allowlist through the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client, namespace: String, name: String) -> Self {
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name,
        }
    }
}

#[async_trait::async_trait]
impl AllowlistStore for KubeStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<ConfigMap>> {
        Ok(self.api.get_opt(&self.name).await?)
    }

    async fn create(&self, cm: &ConfigMap) -> Result<()> {
        self.api.create(&PostParams::default(), cm).await?;
        Ok(())
    }

    async fn replace(&self, cm: &ConfigMap) -> Result<()> {
        self.api
            .replace(&self.name, &PostParams::default(), cm)
            .await?;
        Ok(())
    }
}
