use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Removed once a final etcd backup has been taken; only added when backups before deletion are enabled
pub static FINAL_BACKUP_FINALIZER: &str = "fleet.dev/final-backup";
/// Removed once all LoadBalancer Services inside the user cluster are gone
pub static IN_CLUSTER_LB_CLEANUP_FINALIZER: &str = "fleet.dev/cleanup-in-cluster-lb";
/// Removed once all PersistentVolumeClaims inside the user cluster are gone
pub static IN_CLUSTER_PV_CLEANUP_FINALIZER: &str = "fleet.dev/cleanup-in-cluster-pv";
/// Removed once all machine deployments (and with them the nodes) are gone
pub static NODE_DELETION_FINALIZER: &str = "fleet.dev/delete-nodes";
/// Removed once the etcd backup configurations of the cluster are gone
pub static BACKUP_CLEANUP_FINALIZER: &str = "fleet.dev/backup-cleanup";
/// Removed once the cluster namespace in the seed is gone
pub static NAMESPACE_CLEANUP_FINALIZER: &str = "fleet.dev/delete-namespace";

/// Clusters are only handled by the operator instance with a matching worker name
pub static WORKER_NAME_LABEL: &str = "fleet.dev/worker-name";

/// The condition set after every reconcile of the cluster controller
pub static RECONCILING_SUCCESS_CONDITION: &str = "ReconcilingSuccess";

/// Represents a tenant cluster managed by the operator
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Cluster",
    group = "fleet.dev",
    version = "v1",
    derive = "PartialEq",
    printcolumn = r#"{"name":"HumanReadableName", "type":"string", "jsonPath":".spec.humanReadableName"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Error", "priority": 1, "type":"string", "jsonPath":".status.errorMessage"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ClusterStatus", shortname = "fc")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// humanReadableName is the name shown to the tenant; it has no uniqueness requirements
    pub human_readable_name: String,
    /// cloud selects the provider and datacenter the cluster runs in
    pub cloud: CloudSpec,
    #[serde(default)]
    pub cluster_network: ClusterNetwork,
    /// version is the Kubernetes version of the control plane, as semver
    pub version: String,
    /// Optional feature flags, keyed by feature name
    pub features: Option<BTreeMap<String, bool>>,
    /// Overrides for the control plane components
    pub components_override: Option<ComponentSettings>,
    /// If set, the operator does not touch this cluster at all
    #[serde(default)]
    pub pause: bool,
}

/// CloudSpec selects a datacenter and carries the provider specific configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpec {
    pub datacenter_name: String,
    pub provider: CloudProvider,
}

/// Exactly one provider must be configured
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CloudProvider {
    Fake(FakeCloudSpec),
    Aws(AwsCloudSpec),
    Azure(AzureCloudSpec),
    Digitalocean(DigitaloceanCloudSpec),
    Gcp(GcpCloudSpec),
    Hetzner(HetznerCloudSpec),
    Openstack(OpenstackCloudSpec),
    BringYourOwn(BringYourOwnCloudSpec),
}

impl Default for CloudProvider {
    fn default() -> Self {
        CloudProvider::Fake(FakeCloudSpec::default())
    }
}

impl CloudProvider {
    pub fn name(&self) -> &'static str {
        match self {
            CloudProvider::Fake(_) => "fake",
            CloudProvider::Aws(_) => "aws",
            CloudProvider::Azure(_) => "azure",
            CloudProvider::Digitalocean(_) => "digitalocean",
            CloudProvider::Gcp(_) => "gcp",
            CloudProvider::Hetzner(_) => "hetzner",
            CloudProvider::Openstack(_) => "openstack",
            CloudProvider::BringYourOwn(_) => "bringyourown",
        }
    }
}

/// A reference to a Secret holding provider credentials, one key per credential field
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FakeCloudSpec {
    pub token: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsCloudSpec {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Optional role to assume; allowed to be empty
    pub assume_role_arn: Option<String>,
    pub assume_role_external_id: Option<String>,
    pub credentials_reference: Option<SecretReference>,
    /// CIDR allowed to reach node ports
    pub node_ports_allowed_ip_range: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureCloudSpec {
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub credentials_reference: Option<SecretReference>,
    /// One of `standard`, `basic`; empty defaults to `basic`
    pub load_balancer_sku: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DigitaloceanCloudSpec {
    pub token: Option<String>,
    pub credentials_reference: Option<SecretReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpCloudSpec {
    pub service_account: Option<String>,
    pub credentials_reference: Option<SecretReference>,
    pub node_ports_allowed_ip_range: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HetznerCloudSpec {
    pub token: Option<String>,
    pub credentials_reference: Option<SecretReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackCloudSpec {
    pub username: Option<String>,
    pub password: Option<String>,
    pub project: Option<String>,
    pub project_id: Option<String>,
    pub domain: Option<String>,
    /// Application credentials replace username, password and project when both are set
    pub application_credential_id: Option<String>,
    pub application_credential_secret: Option<String>,
    pub credentials_reference: Option<SecretReference>,
    pub floating_ip_pool: Option<String>,
    pub node_ports_allowed_ip_range: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BringYourOwnCloudSpec {}

/// Network configuration of the user cluster
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    #[serde(default)]
    pub pods: NetworkRanges,
    #[serde(default)]
    pub services: NetworkRanges,
    /// Must be `cluster.local` if set
    pub dns_domain: Option<String>,
    /// One of `ipvs`, `iptables`, `ebpf`
    pub proxy_mode: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    /// Only the first block is used
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSettings {
    pub apiserver: Option<ApiServerSettings>,
    pub controller_manager: Option<DeploymentSettings>,
    pub scheduler: Option<DeploymentSettings>,
    pub etcd: Option<EtcdSettings>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerSettings {
    pub replicas: Option<i32>,
    /// Range of ports available to NodePort services, as `base-max`
    pub node_port_range: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSettings {
    pub replicas: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSettings {
    pub cluster_size: Option<i32>,
    pub disk_size: Option<String>,
}

/// Status of the Cluster.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub phase: Option<ClusterPhase>,
    /// The namespace in the seed holding the control plane of this cluster
    pub namespace_name: Option<String>,
    pub extended_health: Option<ExtendedClusterHealth>,
    /// Set while the latest reconcile failed, cleared on the next success
    pub error_reason: Option<ClusterStatusError>,
    pub error_message: Option<String>,
    /// The last generation that was successfully reconciled
    pub observed_generation: Option<i64>,
    pub conditions: Option<Vec<ClusterCondition>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// An update was admitted and has not yet converged
    Updating,
    Running,
    Terminating,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterStatusError {
    ReconcileClusterError,
    HealthSyncError,
    DeletionError,
}

impl std::fmt::Display for ClusterStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClusterStatusError::ReconcileClusterError => "ReconcileClusterError",
            ClusterStatusError::HealthSyncError => "HealthSyncError",
            ClusterStatusError::DeletionError => "DeletionError",
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum HealthStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

/// Health of the control plane components of a cluster
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedClusterHealth {
    pub etcd: HealthStatus,
    pub apiserver: HealthStatus,
    pub scheduler: HealthStatus,
    pub controller: HealthStatus,
    pub machine_controller: HealthStatus,
}

impl ExtendedClusterHealth {
    pub fn all_healthy(&self) -> bool {
        [
            self.etcd,
            self.apiserver,
            self.scheduler,
            self.controller,
            self.machine_controller,
        ]
        .iter()
        .all(|s| *s == HealthStatus::Up)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,

    /// Human-readable message indicating details about last transition.
    pub message: Option<String>,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: Option<String>,

    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: ConditionStatus,

    /// Type of the condition, known values are (`ReconcilingSuccess`).
    pub r#type: String,
}

impl ClusterStatus {
    pub fn condition(&self, r#type: &str) -> Option<&ClusterCondition> {
        self.conditions
            .as_ref()
            .and_then(|c| c.iter().find(|cond| cond.r#type == r#type))
    }

    /// Sets a condition, keeping its transition time unless the status changes
    pub fn set_condition(
        &mut self,
        r#type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: Time,
    ) {
        let existing = self.condition(r#type);

        let last_transition_time = match existing {
            Some(existing) if existing.status == status => existing
                .last_transition_time
                .clone()
                .unwrap_or_else(|| now.clone()),
            _ => now,
        };

        let condition = ClusterCondition {
            last_transition_time: Some(last_transition_time),
            message: Some(message.into()).filter(|m: &String| !m.is_empty()),
            reason: Some(reason.into()).filter(|r: &String| !r.is_empty()),
            status,
            r#type: r#type.into(),
        };

        let conditions = self.conditions.get_or_insert_with(Vec::new);
        match conditions.iter_mut().find(|c| c.r#type == r#type) {
            Some(c) => *c = condition,
            None => conditions.push(condition),
        }
    }
}

impl Cluster {
    /// The namespace in the seed holding the control plane of this cluster
    pub fn namespace_name(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.namespace_name.clone())
            .unwrap_or_else(|| format!("cluster-{}", self.name_any()))
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    pub fn error_reason(&self) -> Option<ClusterStatusError> {
        self.status.as_ref().and_then(|s| s.error_reason)
    }

    pub fn phase(&self) -> Option<ClusterPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Whether the last observed generation lags behind the spec
    pub fn generation_outdated(&self) -> bool {
        self.metadata.generation != self.status.as_ref().and_then(|s| s.observed_generation)
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.labels().get(WORKER_NAME_LABEL).map(String::as_str)
    }
}
