use std::sync::Arc;

use kube::ResourceExt;

use crate::config::UpdatePredicate;
use crate::resources::clusters::{Cluster, ClusterPhase};
use crate::Result;

use super::store::ClusterStore;

/// Decides whether a cluster counts as mid-update
pub trait InProgressPredicate: Send + Sync {
    fn in_progress(&self, cluster: &Cluster) -> bool;
}

impl InProgressPredicate for UpdatePredicate {
    fn in_progress(&self, cluster: &Cluster) -> bool {
        let updating = cluster.phase() == Some(ClusterPhase::Updating);
        match self {
            UpdatePredicate::Phase => updating,
            UpdatePredicate::Generation => updating || cluster.generation_outdated(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Too many other clusters are mid-update
    Refused { in_progress: usize },
}

/// Bounds the number of clusters converging at the same time
pub struct AdmissionGate {
    store: Arc<dyn ClusterStore>,
    limit: usize,
    predicate: Arc<dyn InProgressPredicate>,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        limit: usize,
        predicate: Arc<dyn InProgressPredicate>,
    ) -> Self {
        Self {
            store,
            limit,
            predicate,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn admit(&self, cluster: &Cluster) -> Result<Admission> {
        // admitted earlier and not done yet, so it already holds a slot
        if cluster.phase() == Some(ClusterPhase::Updating) {
            return Ok(Admission::Admitted);
        }

        let name = cluster.name_any();
        let in_progress = self
            .store
            .list()
            .iter()
            .filter(|c| c.name_any() != name)
            .filter(|c| self.predicate.in_progress(c))
            .count();

        if in_progress >= self.limit {
            Ok(Admission::Refused { in_progress })
        } else {
            Ok(Admission::Admitted)
        }
    }
}
