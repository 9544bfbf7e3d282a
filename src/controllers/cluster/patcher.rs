use std::sync::Arc;

use kube::ResourceExt;
use tracing::*;

use crate::resources::clusters::Cluster;
use crate::Result;

use super::store::ClusterStore;
use super::ReconcileResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The mutation changed nothing, so nothing was written
    Unchanged,
    Patched,
}

/// Applies mutations of a cluster's status and finalizers with optimistic locking
#[derive(Clone)]
pub struct StatePatcher {
    store: Arc<dyn ClusterStore>,
}

impl StatePatcher {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// Mutate the cluster and persist the difference.
    ///
    /// On success `cluster` holds the stored object, carrying the new resource version. On failure
    /// it is reset to what it was before the mutation.
    pub async fn apply_mutation<F>(&self, cluster: &mut Cluster, mutate: F) -> Result<PatchOutcome>
    where
        F: FnOnce(&mut Cluster) + Send,
    {
        let snapshot = cluster.clone();
        mutate(cluster);
        if *cluster == snapshot {
            return Ok(PatchOutcome::Unchanged);
        }

        match self.store.patch(&snapshot, cluster).await {
            Ok(stored) => {
                *cluster = stored;
                Ok(PatchOutcome::Patched)
            }
            Err(err) => {
                *cluster = snapshot;
                Err(err)
            }
        }
    }

    /// Add finalizers; losing a concurrent write is not an error but an immediate requeue
    pub async fn add_finalizers(
        &self,
        cluster: &mut Cluster,
        finalizers: &[&str],
    ) -> Result<ReconcileResult> {
        let result = self
            .apply_mutation(cluster, |c| {
                let existing = c.finalizers_mut();
                for finalizer in finalizers {
                    if !existing.iter().any(|f| f == finalizer) {
                        existing.push(finalizer.to_string());
                    }
                }
            })
            .await;
        finalizer_result(cluster, result, "add", finalizers)
    }

    /// Remove finalizers; losing a concurrent write is not an error but an immediate requeue
    pub async fn remove_finalizers(
        &self,
        cluster: &mut Cluster,
        finalizers: &[&str],
    ) -> Result<ReconcileResult> {
        let result = self
            .apply_mutation(cluster, |c| {
                c.finalizers_mut()
                    .retain(|f| !finalizers.contains(&f.as_str()));
            })
            .await;
        finalizer_result(cluster, result, "remove", finalizers)
    }
}

fn finalizer_result(
    cluster: &Cluster,
    result: Result<PatchOutcome>,
    action: &str,
    finalizers: &[&str],
) -> Result<ReconcileResult> {
    match result {
        Ok(_) => Ok(ReconcileResult::default()),
        Err(err) if err.is_conflict() => {
            info!(
                "Failed to {action} finalizers {finalizers:?} on Cluster {}: {err}",
                cluster.name_any()
            );
            Ok(ReconcileResult::requeue_now())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::cluster::fixtures::{cluster, MemoryStore};
    use crate::resources::clusters::{
        ClusterPhase, NAMESPACE_CLEANUP_FINALIZER, NODE_DELETION_FINALIZER,
    };
    use crate::Error;

    fn patcher(store: &Arc<MemoryStore>) -> StatePatcher {
        StatePatcher::new(store.clone())
    }

    #[tokio::test]
    async fn equivalent_mutations_write_once() {
        let store = Arc::new(MemoryStore::with([cluster("c1")]));
        let patcher = patcher(&store);
        let mut c1 = store.fetch("c1");

        let set_running = |c: &mut Cluster| {
            c.status.get_or_insert_with(Default::default).phase = Some(ClusterPhase::Running);
        };

        assert_eq!(
            patcher.apply_mutation(&mut c1, set_running).await.unwrap(),
            PatchOutcome::Patched
        );
        assert_eq!(
            patcher.apply_mutation(&mut c1, set_running).await.unwrap(),
            PatchOutcome::Unchanged
        );
        assert_eq!(store.writes(), 1);
        assert_eq!(store.fetch("c1").phase(), Some(ClusterPhase::Running));
    }

    #[tokio::test]
    async fn successive_writes_carry_the_fresh_version() {
        let store = Arc::new(MemoryStore::with([cluster("c1")]));
        let patcher = patcher(&store);
        let mut c1 = store.fetch("c1");

        patcher
            .add_finalizers(&mut c1, &[NODE_DELETION_FINALIZER])
            .await
            .unwrap();
        patcher
            .apply_mutation(&mut c1, |c| {
                c.status.get_or_insert_with(Default::default).phase = Some(ClusterPhase::Updating)
            })
            .await
            .unwrap();

        assert_eq!(store.writes(), 2);
        assert_eq!(c1, store.fetch("c1"));
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = Arc::new(MemoryStore::with([cluster("c1")]));
        let patcher = patcher(&store);
        let mut stale = store.fetch("c1");
        let mut fresh = store.fetch("c1");

        patcher
            .apply_mutation(&mut fresh, |c| {
                c.status.get_or_insert_with(Default::default).phase = Some(ClusterPhase::Running)
            })
            .await
            .unwrap();

        let err = patcher
            .apply_mutation(&mut stale, |c| {
                c.status.get_or_insert_with(Default::default).phase = Some(ClusterPhase::Updating)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // reset to the snapshot taken before the mutation
        assert_eq!(stale.phase(), None);
    }

    #[tokio::test]
    async fn finalizer_conflicts_requeue_without_error() {
        let store = Arc::new(MemoryStore::with([cluster("c1")]));
        let patcher = patcher(&store);
        let mut c1 = store.fetch("c1");
        store.inject_conflicts(1);

        let result = patcher
            .add_finalizers(&mut c1, &[NODE_DELETION_FINALIZER])
            .await
            .unwrap();
        assert!(result.requeue_now);
        assert_eq!(store.writes(), 0);

        let result = patcher
            .add_finalizers(&mut c1, &[NODE_DELETION_FINALIZER])
            .await
            .unwrap();
        assert_eq!(result, ReconcileResult::default());
        assert!(store.fetch("c1").has_finalizer(NODE_DELETION_FINALIZER));
    }

    #[tokio::test]
    async fn adding_present_finalizers_is_a_no_op() {
        let mut c = cluster("c1");
        c.metadata.finalizers = Some(vec![NAMESPACE_CLEANUP_FINALIZER.into()]);
        let store = Arc::new(MemoryStore::with([c]));
        let patcher = patcher(&store);
        let mut c1 = store.fetch("c1");

        patcher
            .add_finalizers(&mut c1, &[NAMESPACE_CLEANUP_FINALIZER])
            .await
            .unwrap();
        patcher
            .remove_finalizers(&mut c1, &[NODE_DELETION_FINALIZER])
            .await
            .unwrap();
        assert_eq!(store.writes(), 0);
    }
}
