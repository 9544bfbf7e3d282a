use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action};
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{self, Store};
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use crate::config::OperatorConfig;
use crate::controllers::{Diagnostics, State};
use crate::resources::clusters::{Cluster, ClusterPhase, ClusterStatusError};
use crate::{telemetry, Error, Metrics, Result};

use super::admission::{Admission, AdmissionGate};
use super::deletion::{CleanupOutcome, DeletionOrchestrator};
use super::feed::{cluster_events, watch_children};
use super::patcher::StatePatcher;
use super::reconcilers::cleanup;
use super::reconcilers::client::KubeconfigClientProvider;
use super::reconcilers::convergence::{ConvergeOutcome, Converger, KubeConverger};
use super::reconcilers::health::{HealthChecker, KubeHealthChecker};
use super::recorder::{ConditionRecorder, KubeEventSink};
use super::store::{ClusterStore, KubeClusterStore};
use super::ReconcileResult;

// Context for our reconciler
pub struct Context {
    /// Cluster reads and optimistic writes
    pub store: Arc<dyn ClusterStore>,
    pub patcher: StatePatcher,
    /// Persists errors and successes to the status, and publishes events
    pub recorder: ConditionRecorder,
    pub admission: AdmissionGate,
    pub deletion: DeletionOrchestrator,
    pub health: Arc<dyn HealthChecker>,
    pub converger: Arc<dyn Converger>,
    pub config: OperatorConfig,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Consecutive failures per cluster, reset by the next successful pass
    pub(super) failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State, cache: Store<Cluster>) -> Self {
        let config = state.config().clone();
        let store: Arc<dyn ClusterStore> =
            Arc::new(KubeClusterStore::new(Api::all(client.clone()), cache));
        let patcher = StatePatcher::new(store.clone());
        let events = Arc::new(KubeEventSink::new(Recorder::new(
            client.clone(),
            "fleet-operator".into(),
        )));
        let clients = Arc::new(KubeconfigClientProvider::new(client.clone()));

        Self {
            recorder: ConditionRecorder::new(patcher.clone(), events),
            admission: AdmissionGate::new(
                store.clone(),
                config.concurrent_cluster_updates,
                Arc::new(config.update_predicate),
            ),
            deletion: DeletionOrchestrator::new(
                cleanup::phases(client.clone(), config.backup_before_deletion),
                patcher.clone(),
                clients,
            ),
            health: Arc::new(KubeHealthChecker::new(client.clone())),
            converger: Arc::new(KubeConverger::new(client, state.datacenters())),
            store,
            patcher,
            config,
            diagnostics: state.diagnostics.clone(),
            metrics,
            failures: Mutex::default(),
        }
    }

    /// Count another failure of the cluster and return how long to back off
    fn backoff(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(name.to_string()).or_default();
        *count = count.saturating_add(1);
        let delay = backoff(self.config.backoff_base, self.config.backoff_max, *count);
        self.metrics.backing_off.set(failures.len() as i64);
        delay
    }

    fn forget_failures(&self, name: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if failures.remove(name).is_some() {
            self.metrics.backing_off.set(failures.len() as i64);
        }
    }
}

/// base * 2^(failures - 1), capped at max
fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1 << exp).unwrap_or(max).min(max)
}

/// A single pass over one cluster
#[instrument(skip(ctx), fields(trace_id))]
pub async fn reconcile(name: &str, ctx: Arc<Context>) -> Result<ReconcileResult> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Cluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let Some(mut cluster) = ctx.store.get(name).await? else {
        debug!("Cluster \"{name}\" is gone");
        return Ok(ReconcileResult::default());
    };

    if cluster.worker_name().unwrap_or_default() != ctx.config.worker_name {
        debug!("Skipping Cluster \"{name}\" handled by another worker");
        return Ok(ReconcileResult::default());
    }
    if cluster.spec.pause {
        debug!("Skipping paused Cluster \"{name}\"");
        return Ok(ReconcileResult::default());
    }

    info!("Reconciling Cluster \"{name}\"");

    if let Err(err) = sync_health(&ctx, &mut cluster).await {
        return Err(fail(
            &ctx,
            &mut cluster,
            ClusterStatusError::HealthSyncError,
            err,
            Error::HealthSyncFailed,
        )
        .await);
    }

    if cluster.is_being_deleted() {
        return delete(&ctx, &mut cluster).await;
    }

    if let Admission::Refused { in_progress } = ctx.admission.admit(&cluster)? {
        info!(
            "Deferring Cluster \"{name}\": {in_progress} clusters are updating, limit is {}",
            ctx.admission.limit()
        );
        ctx.metrics.admission_refusals.inc();
        return Ok(ReconcileResult::requeue_after(ctx.config.requeue_interval));
    }

    let finalizers = ctx.deletion.finalizers();
    match ctx.patcher.add_finalizers(&mut cluster, &finalizers).await {
        Ok(result) if result.requeue_now => return Ok(result),
        Ok(_) => {}
        Err(err) => {
            return Err(fail(
                &ctx,
                &mut cluster,
                ClusterStatusError::ReconcileClusterError,
                err,
                Error::ReconcileFailed,
            )
            .await)
        }
    }

    let outcome = match converge(&ctx, &mut cluster).await {
        Ok(outcome) => outcome,
        Err(err) => {
            return Err(fail(
                &ctx,
                &mut cluster,
                ClusterStatusError::ReconcileClusterError,
                err,
                Error::ReconcileFailed,
            )
            .await)
        }
    };

    ctx.recorder.clear_error(&mut cluster).await?;
    ctx.recorder.record_success(&mut cluster, &outcome).await?;

    if outcome.complete {
        Ok(ReconcileResult::default())
    } else {
        Ok(ReconcileResult::requeue_after(
            outcome.requeue_after.unwrap_or(ctx.config.requeue_interval),
        ))
    }
}

async fn sync_health(ctx: &Context, cluster: &mut Cluster) -> Result<()> {
    let health = ctx.health.sync_health(cluster).await?;
    ctx.patcher
        .apply_mutation(cluster, |c| {
            c.status.get_or_insert_with(Default::default).extended_health = Some(health);
        })
        .await?;
    Ok(())
}

/// Mark the cluster as mid-update when its spec moved on, then converge it
async fn converge(ctx: &Context, cluster: &mut Cluster) -> Result<ConvergeOutcome> {
    let namespace = cluster.namespace_name();
    let outdated = cluster.generation_outdated();
    ctx.patcher
        .apply_mutation(cluster, |c| {
            let status = c.status.get_or_insert_with(Default::default);
            status.namespace_name.get_or_insert(namespace);
            if outdated {
                status.phase = Some(ClusterPhase::Updating);
            }
        })
        .await?;

    ctx.converger.converge(cluster).await
}

async fn teardown(ctx: &Context, cluster: &mut Cluster) -> Result<CleanupOutcome> {
    ctx.patcher
        .apply_mutation(cluster, |c| {
            c.status.get_or_insert_with(Default::default).phase = Some(ClusterPhase::Terminating);
        })
        .await?;
    ctx.deletion.cleanup(cluster).await
}

async fn delete(ctx: &Context, cluster: &mut Cluster) -> Result<ReconcileResult> {
    let outcome = match teardown(ctx, cluster).await {
        Ok(outcome) => outcome,
        Err(err) => {
            return Err(fail(
                ctx,
                cluster,
                ClusterStatusError::DeletionError,
                err,
                Error::CleanupFailed,
            )
            .await)
        }
    };

    // the object is gone once its last finalizer was removed
    if !cluster.finalizers().is_empty() {
        ctx.recorder.clear_error(cluster).await?;
    }
    if outcome.complete {
        info!("Cleanup of Cluster \"{}\" is complete", cluster.name_any());
    }

    Ok(ReconcileResult {
        requeue_after: Some(ctx.config.requeue_interval),
        requeue_now: outcome.requeue_now,
    })
}

/// Persist a failure on the cluster and wrap it for the caller. If even that write fails, the
/// recording error is returned instead. Conflicts are returned as they are, to be retried against
/// fresh state.
async fn fail(
    ctx: &Context,
    cluster: &mut Cluster,
    reason: ClusterStatusError,
    err: Error,
    wrap: fn(Box<Error>) -> Error,
) -> Error {
    if err.is_conflict() {
        debug!("Cluster \"{}\" changed during the pass: {err}", cluster.name_any());
        return err;
    }
    warn!("{reason} for Cluster \"{}\": {err}", cluster.name_any());
    match ctx
        .recorder
        .record_error(cluster, reason, &err.to_string())
        .await
    {
        Ok(()) => wrap(Box::new(err)),
        Err(record_err) => Error::RecordErrorFailed(Box::new(record_err)),
    }
}

/// One pass of the controller: the reconcile under its deadline, mapped to an action
async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let timeout = ctx.config.reconcile_timeout;
    let result = match tokio::time::timeout(timeout, reconcile(&name, ctx.clone())).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::Timeout(timeout)),
    };
    ctx.forget_failures(&name);
    Ok(action(result))
}

fn action(result: ReconcileResult) -> Action {
    match result {
        ReconcileResult {
            requeue_now: true, ..
        } => Action::requeue(Duration::ZERO),
        ReconcileResult {
            requeue_after: Some(delay),
            ..
        } => Action::requeue(delay),
        _ => Action::await_change(),
    }
}

fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    warn!("reconcile of Cluster \"{name}\" failed: {error}");
    ctx.metrics.reconcile_failure::<Cluster>(&name, error);
    Action::requeue(ctx.backoff(&name))
}

/// Initialize the cluster controller and run it until a shutdown signal arrives
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let clusters = Api::<Cluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("Cluster is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let workers = state.config().workers;
    let (cache, writer) = reflector::store();
    let controller = Controller::for_stream(cluster_events(clusters, writer), cache.clone())
        .with_config(
            controller::Config::default().concurrency(u16::try_from(workers).unwrap_or(u16::MAX)),
        )
        .shutdown_on_signal();
    let controller = watch_children(controller, client.clone(), cache.clone());

    info!("Starting the Cluster controller with {workers} workers");
    controller
        .run(
            reconcile_cluster,
            error_policy,
            Arc::new(Context::new(client, metrics, &state, cache)),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
