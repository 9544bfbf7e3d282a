use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};

use crate::resources::clusters::Cluster;
use crate::{Error, Result};

pub static ADMIN_KUBECONFIG_SECRET: &str = "admin-kubeconfig";
pub static KUBECONFIG_KEY: &str = "kubeconfig";

/// Hands out clients talking to the API server of a user cluster
#[async_trait]
pub trait ClusterClientProvider: Send + Sync {
    async fn get_client(&self, cluster: &Cluster) -> Result<Client>;
}

/// Builds clients from the admin kubeconfig stored in the cluster namespace
pub struct KubeconfigClientProvider {
    client: Client,
}

impl KubeconfigClientProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClientProvider for KubeconfigClientProvider {
    async fn get_client(&self, cluster: &Cluster) -> Result<Client> {
        let unavailable =
            |reason: String| Error::UserClusterUnavailable(format!("{}: {reason}", cluster.name_any()));

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &cluster.namespace_name());
        let secret = secrets
            .get_opt(ADMIN_KUBECONFIG_SECRET)
            .await?
            .ok_or_else(|| unavailable(format!("secret {ADMIN_KUBECONFIG_SECRET} not found")))?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .ok_or_else(|| {
                unavailable(format!(
                    "secret {ADMIN_KUBECONFIG_SECRET} has no {KUBECONFIG_KEY} key"
                ))
            })?;
        let yaml = std::str::from_utf8(&raw.0)
            .map_err(|e| unavailable(format!("kubeconfig is not utf-8: {e}")))?;

        let kubeconfig =
            Kubeconfig::from_yaml(yaml).map_err(|e| unavailable(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| unavailable(format!("invalid kubeconfig: {e}")))?;

        Client::try_from(config).map_err(|e| unavailable(e.to_string()))
    }
}
