//! Failure, deletion and restart scenarios spanning several controllers.

use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::controller::Action;

use inplace_upgrade_operator::Reconciler;
use inplace_upgrade_operator::client::ObjectClient;
use inplace_upgrade_operator::client::memory::Verb;
use inplace_upgrade_operator::controller::ControlPlaneUpgradeReconciler;
use inplace_upgrade_operator::controller::node_upgrade::UPGRADER_CONFIG_MAP;
use inplace_upgrade_operator::crd::capi::Machine;
use inplace_upgrade_operator::crd::{ControlPlaneUpgrade, NODE_UPGRADE_FINALIZER, NodeUpgrade};

use crate::harness::*;

fn single_control_plane() -> Harness {
    let h = Harness::new();
    h.add_kcp(1, 0);
    h.add_cp_machine("machine01", "node01", "2024-01-01T00:00:00Z");
    h
}

#[tokio::test]
async fn test_failed_stage_blocks_group() {
    let h = single_control_plane();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    h.reconcile_nodes().await;

    h.fail_pod("node01").await;
    let results = h.reconcile_nodes().await;
    assert_eq!(
        results[0].as_ref().unwrap(),
        &Action::requeue(Duration::from_secs(10))
    );

    let status = h.node_upgrade("machine01").await.status.unwrap();
    assert!(!status.completed);
    let failure = status.failure_message.unwrap();
    assert!(failure.contains("non-zero exit code"), "{failure}");

    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    let group: ControlPlaneUpgrade = h.management.get(&cp_upgrade_key()).await.unwrap();
    let status = group.status.unwrap();
    assert_eq!((status.upgraded, status.require_upgrade, status.ready), (0, 1, false));
    assert_eq!(h.machine_version("machine01").await.as_deref(), Some(OLD_VERSION));
}

#[tokio::test]
async fn test_deleting_group_mid_upgrade_cleans_up() {
    let h = Harness::new();
    h.add_kcp(2, 0);
    h.add_cp_machine("machine01", "node01", "2024-01-01T00:00:00Z");
    h.add_cp_machine("machine02", "node02", "2024-01-01T00:05:00Z");

    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    let group: ControlPlaneUpgrade = h.management.get(&cp_upgrade_key()).await.unwrap();
    let status = group.status.unwrap();
    assert_eq!((status.upgraded, status.require_upgrade, status.ready), (0, 2, false));
    h.reconcile_nodes().await;
    assert!(h.workload.contains::<Pod>(&pod_key("node01")));

    h.management
        .delete::<ControlPlaneUpgrade>(&cp_upgrade_key())
        .await
        .unwrap();

    // machine02 never got a node upgrade; its absence is not an error.
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.management.count::<ControlPlaneUpgrade>(), 0);

    for result in h.reconcile_nodes().await {
        result.unwrap();
    }
    assert_eq!(h.management.count::<NodeUpgrade>(), 0);
    assert!(!h.workload.contains::<Pod>(&pod_key("node01")));
}

#[tokio::test]
async fn test_machine_removed_mid_upgrade_does_not_block_cleanup() {
    let h = single_control_plane();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    h.reconcile_nodes().await;
    assert!(h.workload.contains::<Pod>(&pod_key("node01")));

    // CAPI replaced the machine while its node was being upgraded.
    h.management.delete::<Machine>(&key("machine01")).await.unwrap();
    let results = h.reconcile_nodes().await;
    let err = results[0].as_ref().unwrap_err();
    assert!(err.is_not_found(), "{err}");

    h.management
        .delete::<ControlPlaneUpgrade>(&cp_upgrade_key())
        .await
        .unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(h.management.count::<ControlPlaneUpgrade>(), 0);

    for result in h.reconcile_nodes().await {
        assert_eq!(result.unwrap(), Action::await_change());
    }
    assert_eq!(h.management.count::<NodeUpgrade>(), 0);
}

#[tokio::test]
async fn test_missing_upgrader_config_map() {
    let h = single_control_plane();
    h.management
        .delete::<ConfigMap>(&key(UPGRADER_CONFIG_MAP))
        .await
        .unwrap();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();

    let results = h.reconcile_nodes().await;
    let err = results[0].as_ref().unwrap_err();
    assert!(err.to_string().contains(UPGRADER_CONFIG_MAP), "{err}");
    assert_eq!(h.workload.count::<Pod>(), 0);

    // The finalizer is in place before any work on the workload cluster.
    let nu = h.node_upgrade("machine01").await;
    assert!(
        nu.metadata
            .finalizers
            .unwrap_or_default()
            .contains(&NODE_UPGRADE_FINALIZER.to_string())
    );
}

#[tokio::test]
async fn test_pod_create_failure_is_retried() {
    let h = single_control_plane();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();

    h.workload.fail::<Pod>(Verb::Create, "admission webhook denied the request");
    let results = h.reconcile_nodes().await;
    let err = results[0].as_ref().unwrap_err();
    assert!(err.to_string().contains("admission webhook denied"), "{err}");
    assert_eq!(h.workload.count::<Pod>(), 0);

    h.workload.clear_failures();
    let results = h.reconcile_nodes().await;
    assert_eq!(
        results[0].as_ref().unwrap(),
        &Action::requeue(Duration::from_secs(10))
    );
    assert!(h.workload.contains::<Pod>(&pod_key("node01")));
}

#[tokio::test]
async fn test_restarted_controller_resumes_from_cluster_state() {
    let h = single_control_plane();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    h.reconcile_nodes().await;
    h.complete_pod("node01").await;
    h.reconcile_nodes().await;

    // A fresh reconciler has no memory of earlier passes.
    let restarted = ControlPlaneUpgradeReconciler::new(h.management.clone());
    let action = restarted.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.machine_version("machine01").await.as_deref(), Some(K8S_VERSION));
    assert_eq!(h.management.count::<NodeUpgrade>(), 1);
}

#[tokio::test]
async fn test_reconciling_deleted_group_reports_not_found() {
    let h = single_control_plane();
    let err = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        err.to_string(),
        format!(
            "controlplaneupgrades.anywhere.eks.amazonaws.com \"{}\" not found",
            cp_upgrade_key().name
        )
    );
}
