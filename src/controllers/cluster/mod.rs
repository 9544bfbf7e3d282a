use std::time::Duration;

pub mod admission;
pub mod controller;
pub mod deletion;
pub mod feed;
pub mod patcher;
pub mod reconcilers;
pub mod recorder;
pub mod store;

#[cfg(test)]
mod fixtures;

pub use controller::{reconcile, run, Context};

/// When to run the next pass of a cluster after a successful one
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Option<Duration>,
    /// Re-run immediately, used after losing an optimistic concurrency race
    pub requeue_now: bool,
}

impl ReconcileResult {
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            requeue_now: false,
        }
    }

    pub fn requeue_now() -> Self {
        Self {
            requeue_after: None,
            requeue_now: true,
        }
    }
}
