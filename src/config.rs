//! Command line and environment configuration.

use std::time::Duration;

use clap::Parser;

use crate::manager::DEFAULT_CONCURRENCY;

pub mod env {
    pub const WATCH_NAMESPACE: &str = "WATCH_NAMESPACE";
    pub const CONCURRENCY: &str = "CONCURRENCY";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";
    pub const LEADER_ELECTION: &str = "LEADER_ELECTION";
    pub const LEASE_NAME: &str = "LEASE_NAME";
    pub const LEASE_DURATION_SECS: &str = "LEASE_DURATION_SECS";
    pub const POD_NAME: &str = "POD_NAME";
    pub const POD_NAMESPACE: &str = "POD_NAMESPACE";
    pub const MANAGEMENT_CLUSTER_NAME: &str = "MANAGEMENT_CLUSTER_NAME";
    pub const SHUTDOWN_GRACE_PERIOD_SECS: &str = "SHUTDOWN_GRACE_PERIOD_SECS";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "inplace-upgrade-operator",
    version,
    about = "Drives in-place node upgrades for Cluster API control planes and machine deployments"
)]
pub struct Config {
    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = env::WATCH_NAMESPACE)]
    pub watch_namespace: Option<String>,

    /// Concurrent reconciles per controller
    #[arg(long, env = env::CONCURRENCY, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: u16,

    /// Health and metrics server port
    #[arg(long, env = env::HEALTH_PORT, default_value = "8080")]
    pub health_port: u16,

    /// Run leader election before starting the controllers
    #[arg(
        long,
        env = env::LEADER_ELECTION,
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub leader_election: bool,

    /// Name of the leader election Lease
    #[arg(long, env = env::LEASE_NAME, default_value = "inplace-upgrade-operator-leader")]
    pub lease_name: String,

    /// Lease validity in seconds
    #[arg(long, env = env::LEASE_DURATION_SECS, default_value = "15")]
    pub lease_duration_secs: u64,

    /// Identity of this replica (hostname when unset)
    #[arg(long, env = env::POD_NAME)]
    pub pod_name: Option<String>,

    /// Namespace holding the leader election Lease
    #[arg(long, env = env::POD_NAMESPACE, default_value = "eksa-system")]
    pub pod_namespace: String,

    /// Name of the management cluster. Workload clusters with the same name
    /// are reached through the in-cluster client.
    #[arg(long, env = env::MANAGEMENT_CLUSTER_NAME)]
    pub management_cluster_name: Option<String>,

    /// Seconds to let in-flight reconciles finish on shutdown
    #[arg(long, env = env::SHUTDOWN_GRACE_PERIOD_SECS, default_value = "5")]
    pub shutdown_grace_period_secs: u64,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> Self {
        Config::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("CONCURRENCY must be at least 1".to_string());
        }
        if self.lease_duration_secs < 3 {
            return Err("LEASE_DURATION_SECS must be at least 3".to_string());
        }
        if self.lease_name.is_empty() {
            return Err("LEASE_NAME must not be empty".to_string());
        }
        Ok(())
    }

    /// Pod identity used as the lease holder.
    pub fn identity(&self) -> String {
        self.pod_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Filter directives for the tracing subscriber.
    pub fn log_directives(&self) -> String {
        format!(
            "inplace_upgrade_operator={level},kube={level}",
            level = self.log_level
        )
    }
}
