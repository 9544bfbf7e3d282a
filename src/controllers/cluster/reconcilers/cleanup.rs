//! The teardown phases of a cluster, in the order they have to run.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Service};
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::*;

use crate::controllers::cluster::deletion::{CleanupPhase, PhaseContext, PhaseOutcome};
use crate::resources::clusters::{
    Cluster, BACKUP_CLEANUP_FINALIZER, FINAL_BACKUP_FINALIZER, IN_CLUSTER_LB_CLEANUP_FINALIZER,
    IN_CLUSTER_PV_CLEANUP_FINALIZER, NAMESPACE_CLEANUP_FINALIZER, NODE_DELETION_FINALIZER,
};
use crate::{Error, Result};

use super::object_meta;

pub static FINAL_BACKUP_NAME: &str = "final-backup";
static MACHINE_NAMESPACE: &str = "kube-system";

/// All phases, in teardown order
pub fn phases(client: Client, backup_before_deletion: bool) -> Vec<Arc<dyn CleanupPhase>> {
    let mut phases: Vec<Arc<dyn CleanupPhase>> = Vec::new();
    if backup_before_deletion {
        phases.push(Arc::new(FinalBackupPhase {
            client: client.clone(),
        }));
    }
    phases.push(Arc::new(LoadBalancerPhase));
    phases.push(Arc::new(VolumePhase));
    phases.push(Arc::new(NodePhase));
    phases.push(Arc::new(BackupConfigPhase {
        client: client.clone(),
    }));
    phases.push(Arc::new(NamespacePhase { client }));
    phases
}

fn backup_config_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("fleet.dev", "v1", "EtcdBackupConfig"))
}

fn backup_configs(client: Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client, namespace, &backup_config_resource())
}

fn machine_api(client: Client, kind: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("cluster.k8s.io", "v1alpha1", kind);
    Api::namespaced_with(client, MACHINE_NAMESPACE, &ApiResource::from_gvk(&gvk))
}

/// Delete the given objects, tolerating ones that are already gone
async fn delete_all<K>(api: &Api<K>, names: Vec<String>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    for name in names {
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Takes one last etcd backup before anything is torn down
struct FinalBackupPhase {
    client: Client,
}

#[async_trait]
impl CleanupPhase for FinalBackupPhase {
    fn name(&self) -> &'static str {
        "final-backup"
    }

    fn finalizer(&self) -> &'static str {
        FINAL_BACKUP_FINALIZER
    }

    async fn run(&self, cluster: &Cluster, _ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let api = backup_configs(self.client.clone(), &cluster.namespace_name());

        let Some(backup) = api.get_opt(FINAL_BACKUP_NAME).await? else {
            let mut backup = DynamicObject::new(FINAL_BACKUP_NAME, &backup_config_resource());
            backup.metadata = object_meta(cluster, FINAL_BACKUP_NAME);
            backup.data = json!({ "spec": { "cluster": cluster.name_any() } });
            info!("Creating final backup for Cluster {}", cluster.name_any());
            api.create(&PostParams::default(), &backup).await?;
            return Ok(PhaseOutcome::Pending);
        };

        match backup.data["status"]["phase"].as_str() {
            Some("Completed") => Ok(PhaseOutcome::Complete),
            Some("Failed") => Err(Error::BackupFailed(
                backup.data["status"]["message"]
                    .as_str()
                    .unwrap_or("no reason given")
                    .into(),
            )),
            _ => Ok(PhaseOutcome::Pending),
        }
    }
}

/// LoadBalancer services inside the user cluster hold cloud load balancers
struct LoadBalancerPhase;

#[async_trait]
impl CleanupPhase for LoadBalancerPhase {
    fn name(&self) -> &'static str {
        "in-cluster-load-balancers"
    }

    fn finalizer(&self) -> &'static str {
        IN_CLUSTER_LB_CLEANUP_FINALIZER
    }

    async fn run(&self, cluster: &Cluster, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let client = ctx.user_cluster_client().await?;
        let services: Api<Service> = Api::all(client.clone());

        let lbs: Vec<Service> = services
            .list(&ListParams::default())
            .await?
            .into_iter()
            .filter(|svc| {
                svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
            })
            .collect();
        if lbs.is_empty() {
            return Ok(PhaseOutcome::Complete);
        }

        info!(
            "Deleting {} LoadBalancer services in Cluster {}",
            lbs.len(),
            cluster.name_any()
        );
        for svc in lbs {
            let namespace = svc.namespace().unwrap_or_default();
            delete_all(
                &Api::<Service>::namespaced(client.clone(), &namespace),
                vec![svc.name_any()],
            )
            .await?;
        }
        Ok(PhaseOutcome::Pending)
    }
}

/// PersistentVolumeClaims inside the user cluster hold cloud volumes
struct VolumePhase;

#[async_trait]
impl CleanupPhase for VolumePhase {
    fn name(&self) -> &'static str {
        "in-cluster-volumes"
    }

    fn finalizer(&self) -> &'static str {
        IN_CLUSTER_PV_CLEANUP_FINALIZER
    }

    async fn run(&self, cluster: &Cluster, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let client = ctx.user_cluster_client().await?;
        let pvcs = Api::<PersistentVolumeClaim>::all(client.clone())
            .list_metadata(&ListParams::default())
            .await?;
        if pvcs.items.is_empty() {
            return Ok(PhaseOutcome::Complete);
        }

        info!(
            "Deleting {} PersistentVolumeClaims in Cluster {}",
            pvcs.items.len(),
            cluster.name_any()
        );
        for pvc in pvcs {
            let namespace = pvc.namespace().unwrap_or_default();
            delete_all(
                &Api::<PersistentVolumeClaim>::namespaced(client.clone(), &namespace),
                vec![pvc.name_any()],
            )
            .await?;
        }
        Ok(PhaseOutcome::Pending)
    }
}

/// Machine deployments, and with them the nodes, are removed through the machine controller
struct NodePhase;

#[async_trait]
impl CleanupPhase for NodePhase {
    fn name(&self) -> &'static str {
        "nodes"
    }

    fn finalizer(&self) -> &'static str {
        NODE_DELETION_FINALIZER
    }

    async fn run(&self, cluster: &Cluster, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let client = ctx.user_cluster_client().await?;
        let deployments = machine_api(client.clone(), "MachineDeployment");
        let machines = machine_api(client, "Machine");

        let names: Vec<String> = deployments
            .list_metadata(&ListParams::default())
            .await?
            .into_iter()
            .map(|md| md.name_any())
            .collect();
        if !names.is_empty() {
            info!(
                "Deleting {} machine deployments of Cluster {}",
                names.len(),
                cluster.name_any()
            );
            delete_all(&deployments, names).await?;
            return Ok(PhaseOutcome::Pending);
        }

        // machines outlive their deployment until the node is drained and gone
        let remaining = machines.list_metadata(&ListParams::default().limit(1)).await?;
        if remaining.items.is_empty() {
            Ok(PhaseOutcome::Complete)
        } else {
            debug!("Waiting for machines of Cluster {} to go away", cluster.name_any());
            Ok(PhaseOutcome::Pending)
        }
    }
}

/// Removes the etcd backup configurations of the cluster
struct BackupConfigPhase {
    client: Client,
}

#[async_trait]
impl CleanupPhase for BackupConfigPhase {
    fn name(&self) -> &'static str {
        "backup-configs"
    }

    fn finalizer(&self) -> &'static str {
        BACKUP_CLEANUP_FINALIZER
    }

    async fn run(&self, cluster: &Cluster, _ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let api = backup_configs(self.client.clone(), &cluster.namespace_name());
        let names: Vec<String> = match api.list_metadata(&ListParams::default()).await {
            Ok(list) => list.into_iter().map(|b| b.name_any()).collect(),
            // the backup CRD is optional
            Err(kube::Error::Api(err)) if err.code == 404 => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if names.is_empty() {
            return Ok(PhaseOutcome::Complete);
        }

        delete_all(&api, names).await?;
        Ok(PhaseOutcome::Pending)
    }
}

/// The seed namespace holding the control plane goes last
struct NamespacePhase {
    client: Client,
}

#[async_trait]
impl CleanupPhase for NamespacePhase {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn finalizer(&self) -> &'static str {
        NAMESPACE_CLEANUP_FINALIZER
    }

    async fn run(&self, cluster: &Cluster, _ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let nss: Api<Namespace> = Api::all(self.client.clone());
        let name = cluster.namespace_name();

        match nss.get_metadata_opt(&name).await? {
            None => Ok(PhaseOutcome::Complete),
            Some(ns) if ns.metadata.deletion_timestamp.is_some() => Ok(PhaseOutcome::Pending),
            Some(_) => {
                info!("Deleting Namespace {name} of Cluster {}", cluster.name_any());
                delete_all(&nss, vec![name]).await?;
                Ok(PhaseOutcome::Pending)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::try_from(kube::Config::new("http://127.0.0.1:6443".parse().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn phases_run_in_teardown_order() {
        let finalizers: Vec<_> = phases(client(), true)
            .iter()
            .map(|p| p.finalizer())
            .collect();
        assert_eq!(
            finalizers,
            vec![
                FINAL_BACKUP_FINALIZER,
                IN_CLUSTER_LB_CLEANUP_FINALIZER,
                IN_CLUSTER_PV_CLEANUP_FINALIZER,
                NODE_DELETION_FINALIZER,
                BACKUP_CLEANUP_FINALIZER,
                NAMESPACE_CLEANUP_FINALIZER,
            ]
        );
    }

    #[tokio::test]
    async fn final_backup_is_optional() {
        assert!(!phases(client(), false)
            .iter()
            .any(|p| p.finalizer() == FINAL_BACKUP_FINALIZER));
    }
}
