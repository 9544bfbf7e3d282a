//! In-memory stand-ins for the API server and the external collaborators of the engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::runtime::events::Event;
use kube::{Client, ResourceExt};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::config::OperatorConfig;
use crate::controllers::Diagnostics;
use crate::resources::clusters::{
    Cluster, ClusterSpec, ClusterStatus, ExtendedClusterHealth, HealthStatus,
};
use crate::{Error, Metrics, Result};

use super::admission::AdmissionGate;
use super::controller::Context;
use super::deletion::{CleanupPhase, DeletionOrchestrator, PhaseContext, PhaseOutcome};
use super::patcher::StatePatcher;
use super::reconcilers::client::ClusterClientProvider;
use super::reconcilers::convergence::{ConvergeOutcome, Converger};
use super::reconcilers::health::HealthChecker;
use super::recorder::{ConditionRecorder, EventSink};
use super::store::{merge_patch, ClusterStore};

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: reason.into(),
        reason: reason.into(),
        code,
    }))
}

pub fn healthy() -> ExtendedClusterHealth {
    ExtendedClusterHealth {
        etcd: HealthStatus::Up,
        apiserver: HealthStatus::Up,
        scheduler: HealthStatus::Up,
        controller: HealthStatus::Up,
        machine_controller: HealthStatus::Up,
    }
}

/// A live cluster at generation 1 whose stored health matches [`FakeHealth`]
pub fn cluster(name: &str) -> Cluster {
    let mut c = Cluster::new(
        name,
        ClusterSpec {
            human_readable_name: name.into(),
            version: "1.30.2".into(),
            ..Default::default()
        },
    );
    c.metadata.generation = Some(1);
    c.status = Some(ClusterStatus {
        extended_health: Some(healthy()),
        ..Default::default()
    });
    c
}

pub fn deleting_cluster(name: &str, finalizers: &[&str]) -> Cluster {
    let mut c = cluster(name);
    c.metadata.deletion_timestamp = Some(Time(Utc::now()));
    c.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    c
}

/// Models the parts of the API server the engine relies on: resource version checks, merge
/// patches of metadata and status, and removal once a deleted object has no finalizers left
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Cluster>>,
    writes: Mutex<BTreeMap<String, usize>>,
    conflicts: AtomicUsize,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn with(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let store = Self::default();
        for c in clusters {
            store.insert(c);
        }
        store
    }

    /// Create or replace a cluster, as another writer would
    pub fn insert(&self, mut cluster: Cluster) {
        cluster.metadata.resource_version = Some(self.next_version());
        self.objects
            .lock()
            .unwrap()
            .insert(cluster.name_any(), cluster);
    }

    pub fn fetch(&self, name: &str) -> Cluster {
        self.objects.lock().unwrap()[name].clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }

    pub fn writes(&self) -> usize {
        self.writes.lock().unwrap().values().sum()
    }

    pub fn writes_for(&self, name: &str) -> usize {
        self.writes
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Fail the next `n` writes as if another writer got there first
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.objects.lock().unwrap().get(name).cloned())
    }

    fn list(&self) -> Vec<Arc<Cluster>> {
        self.objects
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(Arc::new)
            .collect()
    }

    async fn patch(&self, old: &Cluster, new: &Cluster) -> Result<Cluster> {
        let name = old.name_any();
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&name) else {
            return Err(api_error(404, "NotFound"));
        };

        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || current.resource_version() != old.resource_version() {
            return Err(Error::Conflict(name));
        }

        let old_json = serde_json::to_value(old)?;
        let new_json = serde_json::to_value(new)?;
        let mut doc = serde_json::to_value(current)?;
        for key in ["metadata", "status"] {
            if let Some(patch) = merge_patch(&old_json[key], &new_json[key]) {
                apply_merge_patch(&mut doc[key], &patch);
            }
        }

        let mut stored: Cluster = serde_json::from_value(doc)?;
        stored.metadata.resource_version = Some(self.next_version());
        *self.writes.lock().unwrap().entry(name.clone()).or_default() += 1;

        if stored.is_being_deleted() && stored.finalizers().is_empty() {
            objects.remove(&name);
        } else {
            objects.insert(name, stored.clone());
        }
        Ok(stored)
    }
}

fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let object = target.as_object_mut().unwrap();
            for (key, value) in fields {
                if value.is_null() {
                    object.remove(key);
                } else {
                    apply_merge_patch(object.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

pub struct FakeHealth {
    pub health: Mutex<ExtendedClusterHealth>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl Default for FakeHealth {
    fn default() -> Self {
        Self {
            health: Mutex::new(healthy()),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HealthChecker for FakeHealth {
    async fn sync_health(&self, _cluster: &Cluster) -> Result<ExtendedClusterHealth> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        Ok(self.health.lock().unwrap().clone())
    }
}

pub struct FakeConverger {
    pub outcome: Mutex<ConvergeOutcome>,
    pub failure: Mutex<Option<String>>,
    /// Never return, like a provider API that stopped answering
    pub hang: AtomicBool,
    pub calls: AtomicUsize,
}

impl Default for FakeConverger {
    fn default() -> Self {
        Self {
            outcome: Mutex::new(ConvergeOutcome {
                complete: true,
                requeue_after: None,
            }),
            failure: Mutex::new(None),
            hang: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeConverger {
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    pub fn succeed(&self, outcome: ConvergeOutcome) {
        *self.failure.lock().unwrap() = None;
        *self.outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl Converger for FakeConverger {
    async fn converge(&self, _cluster: &Cluster) -> Result<ConvergeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(Error::InvalidCloudSpec(message));
        }
        Ok(*self.outcome.lock().unwrap())
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    reasons: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingEvents {
    pub fn failing() -> Self {
        Self {
            reasons: Mutex::default(),
            fail: true,
        }
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, _cluster: &Cluster, event: Event) -> Result<()> {
        if self.fail {
            return Err(api_error(500, "InternalError"));
        }
        self.reasons.lock().unwrap().push(event.reason);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeClientProvider {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ClusterClientProvider for FakeClientProvider {
    async fn get_client(&self, _cluster: &Cluster) -> Result<Client> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        Ok(Client::try_from(config)?)
    }
}

/// A cleanup phase that counts how often it ran
pub struct CountingPhase {
    finalizer: &'static str,
    outcome: Option<PhaseOutcome>,
    uses_client: bool,
    runs: AtomicUsize,
}

impl CountingPhase {
    pub fn complete(finalizer: &'static str) -> Self {
        Self::new(finalizer, Some(PhaseOutcome::Complete))
    }

    pub fn pending(finalizer: &'static str) -> Self {
        Self::new(finalizer, Some(PhaseOutcome::Pending))
    }

    pub fn failing(finalizer: &'static str) -> Self {
        Self::new(finalizer, None)
    }

    fn new(finalizer: &'static str, outcome: Option<PhaseOutcome>) -> Self {
        Self {
            finalizer,
            outcome,
            uses_client: false,
            runs: AtomicUsize::new(0),
        }
    }

    /// Ask for the user cluster client on every run
    pub fn using_client(mut self) -> Self {
        self.uses_client = true;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CleanupPhase for CountingPhase {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn finalizer(&self) -> &'static str {
        self.finalizer
    }

    async fn run(&self, _cluster: &Cluster, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.uses_client {
            ctx.user_cluster_client().await?;
        }
        self.outcome
            .ok_or_else(|| Error::UserClusterUnavailable("phase failed".into()))
    }
}

/// A reconcile context wired to in-memory collaborators
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub health: Arc<FakeHealth>,
    pub converger: Arc<FakeConverger>,
    pub events: Arc<RecordingEvents>,
    pub clients: Arc<FakeClientProvider>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(
        clusters: impl IntoIterator<Item = Cluster>,
        phases: Vec<Arc<dyn CleanupPhase>>,
        config: OperatorConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::with(clusters));
        let health = Arc::new(FakeHealth::default());
        let converger = Arc::new(FakeConverger::default());
        let events = Arc::new(RecordingEvents::default());
        let clients = Arc::new(FakeClientProvider::default());

        let patcher = StatePatcher::new(store.clone());
        let ctx = Arc::new(Context {
            store: store.clone(),
            patcher: patcher.clone(),
            recorder: ConditionRecorder::new(patcher.clone(), events.clone()),
            admission: AdmissionGate::new(
                store.clone(),
                config.concurrent_cluster_updates,
                Arc::new(config.update_predicate),
            ),
            deletion: DeletionOrchestrator::new(phases, patcher, clients.clone()),
            health: health.clone(),
            converger: converger.clone(),
            config,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
            failures: Default::default(),
        });

        Self {
            store,
            health,
            converger,
            events,
            clients,
            ctx,
        }
    }
}
