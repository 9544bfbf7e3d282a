//! The watch streams driving the cluster controller.
//!
//! Cluster changes trigger themselves. Changes to objects the operator created in the seed map to
//! the cluster owning them, so drift of a child object triggers a pass of its cluster.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Config};
use kube::runtime::{metadata_watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::resources::clusters::Cluster;

use super::reconcilers::{managed_selector, CLUSTER_LABEL};

/// Cluster changes, written through to the cache the controller reads from
pub fn cluster_events(
    api: Api<Cluster>,
    writer: Writer<Cluster>,
) -> BoxStream<'static, Result<Cluster, watcher::Error>> {
    // status writes don't change the hash, so our own patches don't retrigger passes
    reflector::reflector(writer, watcher::watcher(api, Config::default()))
        .map(ensure_deletion_change)
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate)
        .boxed()
}

/// Trigger the owning cluster on changes to any of the objects we create in the seed
pub fn watch_children(
    controller: Controller<Cluster>,
    client: Client,
    cache: Store<Cluster>,
) -> Controller<Cluster> {
    let controller = watch::<Namespace>(controller, &client, &cache);
    let controller = watch::<Service>(controller, &client, &cache);
    let controller = watch::<ServiceAccount>(controller, &client, &cache);
    let controller = watch::<ConfigMap>(controller, &client, &cache);
    let controller = watch::<Secret>(controller, &client, &cache);
    let controller = watch::<StatefulSet>(controller, &client, &cache);
    let controller = watch::<Deployment>(controller, &client, &cache);
    let controller = watch::<PodDisruptionBudget>(controller, &client, &cache);
    let controller = watch::<Role>(controller, &client, &cache);
    let controller = watch::<RoleBinding>(controller, &client, &cache);
    watch::<NetworkPolicy>(controller, &client, &cache)
}

fn watch<K>(
    controller: Controller<Cluster>,
    client: &Client,
    cache: &Store<Cluster>,
) -> Controller<Cluster>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    // all resources we create have this label
    let cfg = Config::default().labels(&managed_selector());
    let events = metadata_watcher(Api::<K>::all(client.clone()), cfg)
        .map(ensure_deletion_change)
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let cache = cache.clone();
    controller.watches_stream(events, move |obj| {
        owning_cluster(&cache.state(), &obj).map(|name| ObjectRef::new(&name))
    })
}

/// The cluster a child object belongs to: by label if present, otherwise by the namespace it
/// lives in. Namespaces map by their own name.
pub fn owning_cluster<K: Resource>(clusters: &[Arc<Cluster>], obj: &K) -> Option<String> {
    if let Some(name) = obj.labels().get(CLUSTER_LABEL) {
        return Some(name.clone());
    }

    let namespace = obj.namespace().unwrap_or_else(|| obj.name_any());
    clusters
        .iter()
        .find(|c| c.namespace_name() == namespace)
        .map(|c| c.name_any())
}

// deletion doesn't otherwise change the metadata we hash, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.meta()
        .deletion_timestamp
        .as_ref()
        .map(|t| t.0)
        .hash(&mut hasher);
    Some(hasher.finish())
}
