use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::OperatorConfig;
use crate::resources::datacenters::DatacenterRegistry;

pub mod cluster;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Settings of the cluster controller
    config: OperatorConfig,
    /// Datacenters clusters may be placed in
    datacenters: Arc<DatacenterRegistry>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: OperatorConfig, datacenters: DatacenterRegistry) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            config,
            datacenters: Arc::new(datacenters),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn datacenters(&self) -> Arc<DatacenterRegistry> {
        self.datacenters.clone()
    }
}
