//! inplace-upgrade-operator - drives in-place node upgrades for Cluster API
//! control planes and machine deployments.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Creates the Kubernetes client
//! - Runs leader election (required for HA deployments)
//! - Starts the controllers and the health server

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};

use inplace_upgrade_operator::client::{KubeObjectClient, KubeconfigSecretRegistry};
use inplace_upgrade_operator::config::Config;
use inplace_upgrade_operator::controller::{
    ControlPlaneUpgradeReconciler, KubeadmControlPlaneReconciler, MachineDeploymentReconciler,
    MachineDeploymentUpgradeReconciler, NodeUpgradeReconciler,
};
use inplace_upgrade_operator::health::{HealthState, run_health_server};
use inplace_upgrade_operator::leader::LeaderElector;
use inplace_upgrade_operator::resources::DefaultPodBuilder;
use inplace_upgrade_operator::{Manager, Reconciler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();
    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {e}");
    }

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_directives())),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.watch_namespace.as_deref().unwrap_or("all"),
        concurrency = config.concurrency,
        "Starting inplace-upgrade-operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes must answer while waiting for leadership
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server error");
            }
        })
    };

    let mut leader = if config.leader_election {
        let identity = config.identity();
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &config.lease_name,
            &config.pod_namespace,
            &identity,
            config.lease_duration(),
        ));
        Some(elector.acquire().await)
    } else {
        warn!("Leader election disabled");
        None
    };

    let mut manager = Manager::new(client.clone(), Some(health_state.clone()))
        .with_namespace(config.watch_namespace.clone())
        .with_concurrency(config.concurrency);

    let management = KubeObjectClient::new(client.clone());
    let registry = KubeconfigSecretRegistry::new(
        management.clone(),
        config.management_cluster_name.clone(),
    );

    KubeadmControlPlaneReconciler::new(management.clone()).setup_with_manager(&mut manager);
    MachineDeploymentReconciler::new(management.clone()).setup_with_manager(&mut manager);
    ControlPlaneUpgradeReconciler::new(management.clone())
        .with_health_state(health_state.clone())
        .setup_with_manager(&mut manager);
    MachineDeploymentUpgradeReconciler::new(management.clone())
        .with_health_state(health_state.clone())
        .setup_with_manager(&mut manager);
    NodeUpgradeReconciler::new(management, registry, DefaultPodBuilder)
        .setup_with_manager(&mut manager);

    let controller_handle = tokio::spawn(manager.run());

    let leadership_lost = async {
        match leader.as_mut() {
            Some(guard) => guard.lost().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        _ = leadership_lost => {
            error!("Lost leadership, shutting down");
            // Exit so Kubernetes restarts us and we re-enter election
            #[allow(clippy::exit)]
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown");
            health_state.set_ready(false).await;

            let grace = config.shutdown_grace_period();
            info!(grace_secs = grace.as_secs(), "Waiting for in-flight reconciliations");
            tokio::time::sleep(grace).await;
        }
    }

    if let Some(guard) = leader {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release lease");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; the operator cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
