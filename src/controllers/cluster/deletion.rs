//! Teardown of clusters marked for deletion.
//!
//! Every cleanup phase owns one finalizer. A phase only runs while its finalizer is present, and
//! the finalizer is only removed once the phase reports it is complete, so a pass can be repeated
//! any number of times without repeating finished work.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use tokio::sync::OnceCell;
use tracing::*;

use crate::resources::clusters::Cluster;
use crate::{Error, Result};

use super::patcher::StatePatcher;
use super::reconcilers::client::ClusterClientProvider;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Nothing left to do; the phase's finalizer may be removed
    Complete,
    /// Work was started or is still in flight; later phases must wait
    Pending,
}

#[async_trait]
pub trait CleanupPhase: Send + Sync {
    fn name(&self) -> &'static str;

    /// The finalizer guarding this phase
    fn finalizer(&self) -> &'static str;

    async fn run(&self, cluster: &Cluster, ctx: &PhaseContext) -> Result<PhaseOutcome>;
}

/// Shared by all phases of a single cleanup pass
pub struct PhaseContext {
    cluster: Cluster,
    clients: Arc<dyn ClusterClientProvider>,
    user_cluster_client: OnceCell<Client>,
}

impl PhaseContext {
    fn new(cluster: Cluster, clients: Arc<dyn ClusterClientProvider>) -> Self {
        Self {
            cluster,
            clients,
            user_cluster_client: OnceCell::new(),
        }
    }

    /// A client for the user cluster, resolved on first use
    pub async fn user_cluster_client(&self) -> Result<Client> {
        self.user_cluster_client
            .get_or_try_init(|| self.clients.get_client(&self.cluster))
            .await
            .cloned()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Every phase completed and removed its finalizer
    pub complete: bool,
    /// A finalizer could not be removed because the cluster changed concurrently
    pub requeue_now: bool,
}

pub struct DeletionOrchestrator {
    phases: Vec<Arc<dyn CleanupPhase>>,
    patcher: StatePatcher,
    clients: Arc<dyn ClusterClientProvider>,
}

impl DeletionOrchestrator {
    /// Phases run in the given order
    pub fn new(
        phases: Vec<Arc<dyn CleanupPhase>>,
        patcher: StatePatcher,
        clients: Arc<dyn ClusterClientProvider>,
    ) -> Self {
        Self {
            phases,
            patcher,
            clients,
        }
    }

    /// The finalizers a live cluster must carry so that it can be cleaned up later
    pub fn finalizers(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.finalizer()).collect()
    }

    /// Make as much progress on the teardown as possible
    pub async fn cleanup(&self, cluster: &mut Cluster) -> Result<CleanupOutcome> {
        let ctx = PhaseContext::new(cluster.clone(), self.clients.clone());

        for phase in &self.phases {
            if !cluster.has_finalizer(phase.finalizer()) {
                continue;
            }

            debug!(
                "Running cleanup phase {} for Cluster {}",
                phase.name(),
                cluster.name_any()
            );
            let outcome = phase
                .run(cluster, &ctx)
                .await
                .map_err(|e| Error::CleanupPhaseFailed {
                    phase: phase.name(),
                    message: e.to_string(),
                })?;

            match outcome {
                PhaseOutcome::Pending => {
                    info!(
                        "Cleanup phase {} for Cluster {} is still in progress",
                        phase.name(),
                        cluster.name_any()
                    );
                    return Ok(CleanupOutcome::default());
                }
                PhaseOutcome::Complete => {
                    let result = self
                        .patcher
                        .remove_finalizers(cluster, &[phase.finalizer()])
                        .await?;
                    if result.requeue_now {
                        return Ok(CleanupOutcome {
                            complete: false,
                            requeue_now: true,
                        });
                    }
                }
            }
        }

        Ok(CleanupOutcome {
            complete: true,
            requeue_now: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::controllers::cluster::fixtures::{
        deleting_cluster, CountingPhase, FakeClientProvider, MemoryStore,
    };
    use crate::resources::clusters::{
        BACKUP_CLEANUP_FINALIZER, IN_CLUSTER_LB_CLEANUP_FINALIZER, NAMESPACE_CLEANUP_FINALIZER,
        NODE_DELETION_FINALIZER,
    };

    fn orchestrator(
        store: &Arc<MemoryStore>,
        phases: &[Arc<CountingPhase>],
        clients: &Arc<FakeClientProvider>,
    ) -> DeletionOrchestrator {
        DeletionOrchestrator::new(
            phases
                .iter()
                .map(|p| p.clone() as Arc<dyn CleanupPhase>)
                .collect(),
            StatePatcher::new(store.clone()),
            clients.clone(),
        )
    }

    #[tokio::test]
    async fn completed_phases_are_not_rerun() {
        let store = Arc::new(MemoryStore::with([deleting_cluster(
            "c1",
            &[NODE_DELETION_FINALIZER, NAMESPACE_CLEANUP_FINALIZER],
        )]));
        let nodes = Arc::new(CountingPhase::complete(NODE_DELETION_FINALIZER));
        let namespace = Arc::new(CountingPhase::pending(NAMESPACE_CLEANUP_FINALIZER));
        let clients = Arc::new(FakeClientProvider::default());
        let orchestrator = orchestrator(&store, &[nodes.clone(), namespace.clone()], &clients);

        let mut c1 = store.fetch("c1");
        let outcome = orchestrator.cleanup(&mut c1).await.unwrap();
        assert!(!outcome.complete);
        assert!(!store.fetch("c1").has_finalizer(NODE_DELETION_FINALIZER));

        let mut c1 = store.fetch("c1");
        orchestrator.cleanup(&mut c1).await.unwrap();

        assert_eq!(nodes.runs(), 1);
        assert_eq!(namespace.runs(), 2);
        assert!(store.fetch("c1").has_finalizer(NAMESPACE_CLEANUP_FINALIZER));
    }

    #[tokio::test]
    async fn pending_phase_halts_later_phases() {
        let store = Arc::new(MemoryStore::with([deleting_cluster(
            "c1",
            &[IN_CLUSTER_LB_CLEANUP_FINALIZER, NAMESPACE_CLEANUP_FINALIZER],
        )]));
        let lbs = Arc::new(CountingPhase::pending(IN_CLUSTER_LB_CLEANUP_FINALIZER));
        let namespace = Arc::new(CountingPhase::complete(NAMESPACE_CLEANUP_FINALIZER));
        let clients = Arc::new(FakeClientProvider::default());
        let orchestrator = orchestrator(&store, &[lbs.clone(), namespace.clone()], &clients);

        let mut c1 = store.fetch("c1");
        orchestrator.cleanup(&mut c1).await.unwrap();

        assert_eq!(lbs.runs(), 1);
        assert_eq!(namespace.runs(), 0);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn failing_phase_keeps_its_finalizer() {
        let store = Arc::new(MemoryStore::with([deleting_cluster(
            "c1",
            &[BACKUP_CLEANUP_FINALIZER],
        )]));
        let backups = Arc::new(CountingPhase::failing(BACKUP_CLEANUP_FINALIZER));
        let clients = Arc::new(FakeClientProvider::default());
        let orchestrator = orchestrator(&store, &[backups.clone()], &clients);

        let mut c1 = store.fetch("c1");
        let err = orchestrator.cleanup(&mut c1).await.unwrap_err();
        assert!(matches!(err, Error::CleanupPhaseFailed { .. }));
        assert!(store.fetch("c1").has_finalizer(BACKUP_CLEANUP_FINALIZER));
    }

    #[tokio::test]
    async fn user_cluster_client_is_resolved_lazily_and_once() {
        let store = Arc::new(MemoryStore::with([deleting_cluster(
            "c1",
            &[
                IN_CLUSTER_LB_CLEANUP_FINALIZER,
                NODE_DELETION_FINALIZER,
                NAMESPACE_CLEANUP_FINALIZER,
            ],
        )]));
        let clients = Arc::new(FakeClientProvider::default());

        // a pass that never needs the user cluster does not connect to it
        let namespace_only = orchestrator(
            &store,
            &[Arc::new(CountingPhase::pending(NAMESPACE_CLEANUP_FINALIZER))],
            &clients,
        );
        let mut c1 = store.fetch("c1");
        namespace_only.cleanup(&mut c1).await.unwrap();
        assert_eq!(clients.calls.load(Ordering::SeqCst), 0);

        let lbs = Arc::new(CountingPhase::complete(IN_CLUSTER_LB_CLEANUP_FINALIZER).using_client());
        let nodes = Arc::new(CountingPhase::pending(NODE_DELETION_FINALIZER).using_client());
        let orchestrator = orchestrator(&store, &[lbs.clone(), nodes.clone()], &clients);
        let mut c1 = store.fetch("c1");
        orchestrator.cleanup(&mut c1).await.unwrap();

        assert_eq!(lbs.runs(), 1);
        assert_eq!(nodes.runs(), 1);
        assert_eq!(clients.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalizer_conflict_stops_the_pass() {
        let store = Arc::new(MemoryStore::with([deleting_cluster(
            "c1",
            &[NODE_DELETION_FINALIZER, NAMESPACE_CLEANUP_FINALIZER],
        )]));
        let nodes = Arc::new(CountingPhase::complete(NODE_DELETION_FINALIZER));
        let namespace = Arc::new(CountingPhase::complete(NAMESPACE_CLEANUP_FINALIZER));
        let clients = Arc::new(FakeClientProvider::default());
        let orchestrator = orchestrator(&store, &[nodes.clone(), namespace.clone()], &clients);
        store.inject_conflicts(1);

        let mut c1 = store.fetch("c1");
        let outcome = orchestrator.cleanup(&mut c1).await.unwrap();

        assert!(outcome.requeue_now);
        assert_eq!(namespace.runs(), 0);
        assert!(store.fetch("c1").has_finalizer(NODE_DELETION_FINALIZER));
    }
}
