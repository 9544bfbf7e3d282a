use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Conflicting write to Cluster {0}; it was modified concurrently")]
    Conflict(String),

    #[error("failed to sync health: {0}")]
    HealthSyncFailed(#[source] Box<Error>),

    #[error("failed to reconcile cluster: {0}")]
    ReconcileFailed(#[source] Box<Error>),

    #[error("failed to clean up cluster: {0}")]
    CleanupFailed(#[source] Box<Error>),

    #[error("failed to set the cluster error: {0}")]
    RecordErrorFailed(#[source] Box<Error>),

    #[error("Invalid cluster spec: {0}")]
    InvalidClusterSpec(String),

    #[error("Invalid cloud spec: {0}")]
    InvalidCloudSpec(String),

    #[error("The datacenter {0} does not exist")]
    DatacenterNotFound(String),

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),
    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error("Failed to get user cluster client: {0}")]
    UserClusterUnavailable(String),

    #[error("Final backup failed: {0}")]
    BackupFailed(String),

    #[error("Cleanup phase {phase} failed: {message}")]
    CleanupPhaseFailed { phase: &'static str, message: String },

    #[error("Reconcile did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Invalid operator configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Conflict(_) => "Conflict",
            Error::HealthSyncFailed(_) => "HealthSyncFailed",
            Error::ReconcileFailed(_) => "ReconcileFailed",
            Error::CleanupFailed(_) => "CleanupFailed",
            Error::RecordErrorFailed(_) => "RecordErrorFailed",
            Error::InvalidClusterSpec(_) => "InvalidClusterSpec",
            Error::InvalidCloudSpec(_) => "InvalidCloudSpec",
            Error::DatacenterNotFound(_) => "DatacenterNotFound",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::UserClusterUnavailable(_) => "UserClusterUnavailable",
            Error::BackupFailed(_) => "BackupFailed",
            Error::CleanupPhaseFailed { .. } => "CleanupPhaseFailed",
            Error::Timeout(_) => "Timeout",
            Error::InvalidConfig(_) => "InvalidConfig",
        }
    }

    /// Whether this is an optimistic concurrency rejection from the API server
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(err)) => err.code == 409,
            _ => false,
        }
    }
}

/// Cloud spec validation and credential resolution
pub mod cloud;

/// Operator configuration
pub mod config;

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::State;
pub use metrics::Metrics;

/// Cluster and datacenter resources
pub mod resources;

/// Start the Cluster controller with a client inferred from the environment
pub async fn run(state: State) {
    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to create kube Client: {e:?}");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            tracing::error!("Failed to register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    controllers::cluster::run(client, metrics, state).await
}
