use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::resources::clusters::Cluster;

pub mod cleanup;
pub mod client;
pub mod convergence;
pub mod health;

pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static MANAGED_BY_VALUE: &str = "fleet-operator";
pub static CLUSTER_LABEL: &str = "fleet.dev/cluster";

/// Selects every object the operator creates in the seed
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

// labels applied to all created resources on top of the Cluster labels
pub fn mandatory_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (MANAGED_BY_LABEL.into(), MANAGED_BY_VALUE.into()),
        (CLUSTER_LABEL.into(), cluster.name_any()),
    ])
}

/// Metadata for an object owned by the cluster
pub fn object_meta(cluster: &Cluster, name: impl Into<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        labels: Some(mandatory_labels(cluster)),
        owner_references: cluster.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..Default::default()
    }
}
