use std::path::PathBuf;
use std::time::Duration;

use crate::resources::datacenters::DatacenterRegistry;
use crate::{Error, Result};

/// How the admission gate decides whether a cluster is mid-update
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum UpdatePredicate {
    /// Only clusters in the Updating phase
    #[default]
    Phase,
    /// Clusters in the Updating phase, or whose observed generation lags behind
    Generation,
}

#[derive(Debug, clap::Parser)]
#[command(version, about)]
pub struct Arguments {
    /// Only clusters whose worker-name label matches are reconciled
    #[arg(long = "worker-name", env = "WORKER_NAME", default_value = "")]
    pub worker_name: String,

    /// Number of clusters reconciled in parallel
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Maximum number of clusters converging at the same time
    #[arg(
        long = "concurrent-cluster-updates",
        env = "CONCURRENT_CLUSTER_UPDATES",
        default_value_t = 10
    )]
    pub concurrent_cluster_updates: usize,

    #[arg(
        long = "update-predicate",
        env = "UPDATE_PREDICATE",
        value_enum,
        default_value_t = UpdatePredicate::Phase
    )]
    pub update_predicate: UpdatePredicate,

    /// Take a final etcd backup before tearing a cluster down
    #[arg(long = "backup-before-deletion", env = "BACKUP_BEFORE_DELETION")]
    pub backup_before_deletion: bool,

    /// Path to the datacenters YAML file
    #[arg(long, env = "DATACENTERS", value_name = "FILE")]
    pub datacenters: Option<PathBuf>,

    /// Seconds to wait before checking a refused or deleting cluster again
    #[arg(long = "requeue-interval", env = "REQUEUE_INTERVAL", default_value_t = 10)]
    pub requeue_interval: u64,

    /// Seconds a single reconcile may take
    #[arg(long = "reconcile-timeout", env = "RECONCILE_TIMEOUT", default_value_t = 300)]
    pub reconcile_timeout: u64,

    /// Milliseconds of backoff after the first failure
    #[arg(long = "backoff-base", env = "BACKOFF_BASE", default_value_t = 500)]
    pub backoff_base: u64,

    /// Seconds the failure backoff is capped at
    #[arg(long = "backoff-max", env = "BACKOFF_MAX", default_value_t = 300)]
    pub backoff_max: u64,
}

/// Settings of the cluster controller, built once at startup
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub worker_name: String,
    pub workers: usize,
    pub concurrent_cluster_updates: usize,
    pub update_predicate: UpdatePredicate,
    pub backup_before_deletion: bool,
    pub requeue_interval: Duration,
    pub reconcile_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            worker_name: String::new(),
            workers: 4,
            concurrent_cluster_updates: 10,
            update_predicate: UpdatePredicate::Phase,
            backup_before_deletion: false,
            requeue_interval: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl TryFrom<&Arguments> for OperatorConfig {
    type Error = Error;

    fn try_from(args: &Arguments) -> Result<Self> {
        if args.workers == 0 {
            return Err(Error::InvalidConfig("--workers must be at least 1".into()));
        }
        if args.concurrent_cluster_updates == 0 {
            return Err(Error::InvalidConfig(
                "--concurrent-cluster-updates must be at least 1".into(),
            ));
        }
        if Duration::from_millis(args.backoff_base) > Duration::from_secs(args.backoff_max) {
            return Err(Error::InvalidConfig(
                "--backoff-base must not exceed --backoff-max".into(),
            ));
        }

        Ok(Self {
            worker_name: args.worker_name.clone(),
            workers: args.workers,
            concurrent_cluster_updates: args.concurrent_cluster_updates,
            update_predicate: args.update_predicate,
            backup_before_deletion: args.backup_before_deletion,
            requeue_interval: Duration::from_secs(args.requeue_interval),
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout),
            backoff_base: Duration::from_millis(args.backoff_base),
            backoff_max: Duration::from_secs(args.backoff_max),
        })
    }
}

impl Arguments {
    /// Load the datacenter registry; an operator without a datacenters file knows no datacenters
    pub fn datacenter_registry(&self) -> Result<DatacenterRegistry> {
        match &self.datacenters {
            Some(path) => {
                let yaml = std::fs::read_to_string(path).map_err(|e| {
                    Error::InvalidConfig(format!("reading {}: {e}", path.display()))
                })?;
                DatacenterRegistry::from_yaml(&yaml)
            }
            None => Ok(DatacenterRegistry::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults() {
        let args = Arguments::try_parse_from(["fleet-operator"]).unwrap();
        let config = OperatorConfig::try_from(&args).unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.concurrent_cluster_updates, 10);
        assert_eq!(config.update_predicate, UpdatePredicate::Phase);
        assert!(!config.backup_before_deletion);
        assert_eq!(config.requeue_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_base, Duration::from_millis(500));
        assert!(args.datacenter_registry().unwrap().is_empty());
    }

    #[test]
    fn parses_flags() {
        let args = Arguments::try_parse_from([
            "fleet-operator",
            "--worker-name",
            "dev",
            "--concurrent-cluster-updates",
            "2",
            "--update-predicate",
            "generation",
            "--backup-before-deletion",
        ])
        .unwrap();
        let config = OperatorConfig::try_from(&args).unwrap();

        assert_eq!(config.worker_name, "dev");
        assert_eq!(config.concurrent_cluster_updates, 2);
        assert_eq!(config.update_predicate, UpdatePredicate::Generation);
        assert!(config.backup_before_deletion);
    }

    #[test]
    fn rejects_zero_workers() {
        let args = Arguments::try_parse_from(["fleet-operator", "--workers", "0"]).unwrap();
        assert!(matches!(
            OperatorConfig::try_from(&args),
            Err(Error::InvalidConfig(_))
        ));
    }
}
