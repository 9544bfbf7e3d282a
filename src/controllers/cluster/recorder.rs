use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::resources::clusters::{
    Cluster, ClusterPhase, ClusterStatusError, ConditionStatus, RECONCILING_SUCCESS_CONDITION,
};
use crate::Result;

use super::patcher::{PatchOutcome, StatePatcher};
use super::reconcilers::convergence::ConvergeOutcome;

/// Publishes Kubernetes events about a cluster
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, cluster: &Cluster, event: Event) -> Result<()>;
}

pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, cluster: &Cluster, event: Event) -> Result<()> {
        self.recorder
            .publish(&event, &cluster.object_ref(&()))
            .await?;
        Ok(())
    }
}

/// Maps reconcile outcomes onto the cluster status
#[derive(Clone)]
pub struct ConditionRecorder {
    patcher: StatePatcher,
    events: Arc<dyn EventSink>,
}

impl ConditionRecorder {
    pub fn new(patcher: StatePatcher, events: Arc<dyn EventSink>) -> Self {
        Self { patcher, events }
    }

    /// Persist a failure. The status is left alone if it already carries the same reason.
    pub async fn record_error(
        &self,
        cluster: &mut Cluster,
        reason: ClusterStatusError,
        message: &str,
    ) -> Result<()> {
        self.publish(
            cluster,
            Event {
                type_: EventType::Warning,
                reason: "ReconcilingError".into(),
                note: Some(message.into()),
                action: "Reconcile".into(),
                secondary: None,
            },
        )
        .await;

        if cluster.error_reason() == Some(reason) {
            return Ok(());
        }

        let now = Time(Utc::now());
        self.patcher
            .apply_mutation(cluster, |c| {
                let status = c.status.get_or_insert_with(Default::default);
                status.error_reason = Some(reason);
                status.error_message = Some(message.into());
                status.set_condition(
                    RECONCILING_SUCCESS_CONDITION,
                    ConditionStatus::False,
                    &reason.to_string(),
                    message,
                    now,
                );
            })
            .await?;
        Ok(())
    }

    /// Remove a previously recorded failure
    pub async fn clear_error(&self, cluster: &mut Cluster) -> Result<()> {
        let Some(status) = cluster.status.as_ref() else {
            return Ok(());
        };
        if status.error_reason.is_none() && status.error_message.is_none() {
            return Ok(());
        }
        let previous = status.error_reason;

        self.patcher
            .apply_mutation(cluster, |c| {
                if let Some(status) = c.status.as_mut() {
                    status.error_reason = None;
                    status.error_message = None;
                }
            })
            .await?;

        self.publish(
            cluster,
            Event {
                type_: EventType::Normal,
                reason: "ErrorCleared".into(),
                note: previous.map(|r| format!("Recovered from {r}")),
                action: "Reconcile".into(),
                secondary: None,
            },
        )
        .await;
        Ok(())
    }

    /// Record a successful pass. A complete convergence moves the cluster to Running and marks
    /// its generation as observed; otherwise the phase is left alone.
    pub async fn record_success(
        &self,
        cluster: &mut Cluster,
        outcome: &ConvergeOutcome,
    ) -> Result<PatchOutcome> {
        let now = Time(Utc::now());
        let generation = cluster.meta().generation;
        let complete = outcome.complete;

        self.patcher
            .apply_mutation(cluster, |c| {
                let status = c.status.get_or_insert_with(Default::default);
                if complete {
                    status.phase = Some(ClusterPhase::Running);
                    status.observed_generation = generation;
                }
                status.set_condition(
                    RECONCILING_SUCCESS_CONDITION,
                    ConditionStatus::True,
                    "",
                    "",
                    now,
                );
            })
            .await
    }

    /// Events are informational; failing to publish one only gets logged
    async fn publish(&self, cluster: &Cluster, event: Event) {
        let reason = event.reason.clone();
        if let Err(err) = self.events.publish(cluster, event).await {
            warn!(
                "Failed to publish {reason} event for Cluster {}: {err}",
                cluster.name_any()
            );
        }
    }
}
