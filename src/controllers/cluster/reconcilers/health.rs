use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::{Api, Client};

use crate::resources::clusters::{Cluster, ExtendedClusterHealth, HealthStatus};
use crate::Result;

/// Observes the control plane components of a cluster
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn sync_health(&self, cluster: &Cluster) -> Result<ExtendedClusterHealth>;
}

/// Derives health from the control plane workloads in the cluster namespace
pub struct KubeHealthChecker {
    client: Client,
}

impl KubeHealthChecker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthChecker for KubeHealthChecker {
    async fn sync_health(&self, cluster: &Cluster) -> Result<ExtendedClusterHealth> {
        let ns = cluster.namespace_name();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &ns);
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);

        let deployment = |name: &'static str| {
            let deployments = deployments.clone();
            async move {
                let d = deployments.get_opt(name).await?;
                Ok::<_, kube::Error>(match d {
                    Some(d) => replicas_health(
                        d.spec.and_then(|s| s.replicas),
                        d.status.and_then(|s| s.ready_replicas),
                        false,
                    ),
                    None => HealthStatus::Down,
                })
            }
        };

        let etcd = match statefulsets.get_opt("etcd").await? {
            Some(ss) => replicas_health(
                ss.spec.and_then(|s| s.replicas),
                ss.status.and_then(|s| s.ready_replicas),
                true,
            ),
            None => HealthStatus::Down,
        };

        Ok(ExtendedClusterHealth {
            etcd,
            apiserver: deployment("apiserver").await?,
            scheduler: deployment("scheduler").await?,
            controller: deployment("controller-manager").await?,
            machine_controller: deployment("machine-controller").await?,
        })
    }
}

/// A component is up once all desired replicas are ready, or a majority when it needs a quorum
fn replicas_health(desired: Option<i32>, ready: Option<i32>, quorum: bool) -> HealthStatus {
    let desired = desired.unwrap_or(1);
    let ready = ready.unwrap_or(0);
    if desired <= 0 {
        return HealthStatus::Down;
    }
    let needed = if quorum { desired / 2 + 1 } else { desired };
    if ready >= needed {
        HealthStatus::Up
    } else {
        HealthStatus::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_replicas_must_be_ready() {
        assert_eq!(replicas_health(Some(2), Some(2), false), HealthStatus::Up);
        assert_eq!(replicas_health(Some(2), Some(1), false), HealthStatus::Down);
        assert_eq!(replicas_health(None, Some(1), false), HealthStatus::Up);
        assert_eq!(replicas_health(Some(0), Some(0), false), HealthStatus::Down);
    }

    #[test]
    fn etcd_needs_quorum() {
        assert_eq!(replicas_health(Some(3), Some(2), true), HealthStatus::Up);
        assert_eq!(replicas_health(Some(3), Some(1), true), HealthStatus::Down);
        assert_eq!(replicas_health(Some(5), None, true), HealthStatus::Down);
    }
}
