use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::Store;
use kube::{Api, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::*;

use crate::resources::clusters::Cluster;
use crate::{Error, Result};

/// Where Cluster records are read from and written to
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the latest version of a cluster; None once it has been removed
    async fn get(&self, name: &str) -> Result<Option<Cluster>>;

    /// All known clusters, as seen by the local cache
    fn list(&self) -> Vec<Arc<Cluster>>;

    /// Persist the metadata and status changes between `old` and `new`, guarded by the resource
    /// version of `old`. Returns the stored object.
    async fn patch(&self, old: &Cluster, new: &Cluster) -> Result<Cluster>;
}

pub struct KubeClusterStore {
    api: Api<Cluster>,
    cache: Store<Cluster>,
}

impl KubeClusterStore {
    pub fn new(api: Api<Cluster>, cache: Store<Cluster>) -> Self {
        Self { api, cache }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.api.get_opt(name).await?)
    }

    fn list(&self) -> Vec<Arc<Cluster>> {
        self.cache.state()
    }

    async fn patch(&self, old: &Cluster, new: &Cluster) -> Result<Cluster> {
        let name = old.name_any();
        let old_json = serde_json::to_value(old)?;
        let new_json = serde_json::to_value(new)?;
        let params = PatchParams::default();

        let mut latest: Option<Cluster> = None;

        if let Some(metadata) = merge_patch(&old_json["metadata"], &new_json["metadata"]) {
            let patch = locked(metadata, old.resource_version());
            debug!("Patching metadata of Cluster {name}");
            latest = Some(
                self.api
                    .patch(&name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| conflict_aware(e, &name))?,
            );
        }

        if let Some(status) = merge_patch(&old_json["status"], &new_json["status"]) {
            let resource_version = match &latest {
                Some(latest) => latest.resource_version(),
                None => old.resource_version(),
            };
            let mut patch = locked(Value::Object(Map::new()), resource_version);
            patch["status"] = status;
            debug!("Patching status of Cluster {name}");
            latest = Some(
                self.api
                    .patch_status(&name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| conflict_aware(e, &name))?,
            );
        }

        Ok(latest.unwrap_or_else(|| new.clone()))
    }
}

/// Wrap a metadata patch so the write fails with a conflict if the object changed since it was read
fn locked(metadata: Value, resource_version: Option<String>) -> Value {
    let mut metadata = match metadata {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(rv) = resource_version {
        metadata.insert("resourceVersion".into(), Value::String(rv));
    }
    json!({ "metadata": metadata })
}

fn conflict_aware(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict(name.into()),
        err => Error::KubeError(err),
    }
}

/// Compute the JSON merge patch (RFC 7386) turning `old` into `new`; None if they are equal.
/// Arrays are replaced as a whole.
pub fn merge_patch(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }

    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) => {
                        if let Some(diff) = merge_patch(previous, value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None if value.is_null() => {}
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) && !old[key].is_null() {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ => Some(new.clone()),
    }
}
