use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::*;

use crate::cloud::{resolve_credentials, validate_cluster_spec, KubeSecretLookup};
use crate::resources::clusters::Cluster;
use crate::resources::datacenters::DatacenterRegistry;
use crate::{Error, Result};

use super::object_meta;

/// Result of a convergence step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConvergeOutcome {
    /// The observed state matches the spec
    pub complete: bool,
    /// When to check on outstanding work
    pub requeue_after: Option<Duration>,
}

/// Drives a cluster's resources towards its spec
#[async_trait]
pub trait Converger: Send + Sync {
    async fn converge(&self, cluster: &Cluster) -> Result<ConvergeOutcome>;
}

pub struct KubeConverger {
    client: Client,
    datacenters: Arc<DatacenterRegistry>,
    secrets: KubeSecretLookup,
}

impl KubeConverger {
    pub fn new(client: Client, datacenters: Arc<DatacenterRegistry>) -> Self {
        Self {
            secrets: KubeSecretLookup::new(client.clone()),
            client,
            datacenters,
        }
    }
}

#[async_trait]
impl Converger for KubeConverger {
    async fn converge(&self, cluster: &Cluster) -> Result<ConvergeOutcome> {
        let dc = self.datacenters.get(&cluster.spec.cloud.datacenter_name)?;
        validate_cluster_spec(&cluster.spec, dc)?;

        // fail early on unreadable credentials, before anything is created
        let credentials = resolve_credentials(cluster, &self.secrets).await?;
        debug!(
            "Resolved {} credentials for Cluster {}",
            credentials.provider_name(),
            cluster.name_any()
        );

        let nss: Api<Namespace> = Api::all(self.client.clone());
        let name = cluster.namespace_name();
        if let Some(ns) = nss.get_metadata_opt(&name).await? {
            let oref = cluster.controller_owner_ref(&());
            let owned = match (&ns.metadata.owner_references, &oref) {
                (Some(orefs), Some(oref)) => orefs.contains(oref),
                _ => false,
            };
            if !owned {
                return Err(Error::InvalidClusterSpec(format!(
                    "namespace {name} already exists and is not owned by Cluster {}",
                    cluster.name_any()
                )));
            }
        }

        apply_namespace(
            &nss,
            Namespace {
                metadata: object_meta(cluster, name),
                ..Default::default()
            },
        )
        .await?;

        let healthy = cluster
            .status
            .as_ref()
            .and_then(|s| s.extended_health.as_ref())
            .is_some_and(|h| h.all_healthy());

        Ok(if healthy {
            ConvergeOutcome {
                complete: true,
                requeue_after: None,
            }
        } else {
            debug!(
                "Cluster {} is not healthy yet, checking again later",
                cluster.name_any()
            );
            ConvergeOutcome {
                complete: false,
                requeue_after: Some(Duration::from_secs(30)),
            }
        })
    }
}

async fn apply_namespace(nss: &Api<Namespace>, ns: Namespace) -> Result<()> {
    let name = ns.name_any();
    let params = PatchParams::apply("fleet-operator").force();
    debug!("Applying Namespace {}", name);
    nss.patch(&name, &params, &Patch::Apply(&ns)).await?;
    Ok(())
}
