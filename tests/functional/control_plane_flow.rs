//! KubeadmControlPlane in-place upgrades from annotation to annotation
//! removal.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::controller::Action;

use inplace_upgrade_operator::Reconciler;
use inplace_upgrade_operator::client::ObjectClient;
use inplace_upgrade_operator::controller::detector::KCP_IN_PLACE_UPGRADE_ANNOTATION;
use inplace_upgrade_operator::crd::capi::{
    CLONED_FROM_NAME_ANNOTATION, KUBEADM_CLUSTER_CONFIGURATION_ANNOTATION, KubeadmControlPlane,
};
use inplace_upgrade_operator::crd::{ControlPlaneUpgrade, NodeUpgrade};

use crate::harness::*;

fn requeue() -> Action {
    Action::requeue(std::time::Duration::from_secs(10))
}

fn fixture() -> Harness {
    let h = Harness::new();
    h.add_kcp(2, 0);
    h.add_cp_machine("machine02", "node02", "2024-01-01T00:05:00Z");
    h.add_cp_machine("machine01", "node01", "2024-01-01T00:00:00Z");
    h
}

async fn cp_upgrade(h: &Harness) -> ControlPlaneUpgrade {
    h.management.get(&cp_upgrade_key()).await.unwrap()
}

async fn status_counts(h: &Harness) -> (i64, i64, bool) {
    let status = cp_upgrade(h).await.status.unwrap();
    (status.upgraded, status.require_upgrade, status.ready)
}

/// The Machine, its KubeadmConfig and its infrastructure machine carry the
/// control plane's configuration.
async fn assert_control_plane_machine_synced(h: &Harness, machine: &str) {
    let annotation = h
        .machine(machine)
        .await
        .annotations()
        .get(KUBEADM_CLUSTER_CONFIGURATION_ANNOTATION)
        .cloned()
        .unwrap();
    let cluster_configuration: serde_json::Value = serde_json::from_str(&annotation).unwrap();
    assert_eq!(
        cluster_configuration.pointer("/etcd/local/imageTag"),
        Some(&serde_json::json!(ETCD_VERSION))
    );

    let config = h.kubeadm_config(machine).await;
    assert!(config.spec.init_configuration.is_none());
    assert_eq!(
        config
            .spec
            .join_configuration
            .as_ref()
            .and_then(|j| j.pointer("/nodeRegistration/kubeletExtraArgs/node-labels")),
        Some(&serde_json::json!("role=cp"))
    );

    let infra = h.infra_machine(machine);
    assert_eq!(
        infra.pointer("/metadata/annotations").and_then(|a| a.get(CLONED_FROM_NAME_ANNOTATION)),
        Some(&serde_json::json!(CP_TEMPLATE))
    );
    assert_eq!(
        infra.pointer("/spec/customImage"),
        Some(&serde_json::json!("kindest/node:v1.27.8"))
    );
}

#[tokio::test]
async fn test_control_plane_upgrade_end_to_end() {
    let h = fixture();

    // Detector creates the group with machines oldest first.
    let action = h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    assert_eq!(action, requeue());
    let group = cp_upgrade(&h).await;
    let machines: Vec<_> = group
        .spec
        .machines_require_upgrade
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(machines, ["machine01", "machine02"]);
    assert_eq!(group.spec.etcd_version, ETCD_VERSION);
    assert!(h.health_check_paused(KCP_HEALTH_CHECK).await);

    // First group pass creates only the first child; machine02 counts as
    // not upgraded until its turn.
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, requeue());
    assert_eq!(status_counts(&h).await, (0, 2, false));
    assert_eq!(h.node_upgrades().await.len(), 1);
    let first = h.node_upgrade("machine01").await;
    assert!(first.spec.first_node_to_be_upgraded);
    assert_eq!(first.spec.etcd_version.as_deref(), Some(ETCD_VERSION));

    // Node upgrade creates the upgrader Pod on the workload cluster.
    let results = h.reconcile_nodes().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap(), &requeue());
    let pod: Pod = h.workload.get(&pod_key("node01")).await.unwrap();
    assert_eq!(
        pod.spec.as_ref().and_then(|s| s.node_name.as_deref()),
        Some("node01")
    );

    // While machine01 runs, machine02 is held back.
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, requeue());
    assert_eq!(status_counts(&h).await, (0, 2, false));
    assert_eq!(h.node_upgrades().await.len(), 1);

    h.complete_pod("node01").await;
    let results = h.reconcile_nodes().await;
    assert_eq!(results[0].as_ref().unwrap(), &Action::await_change());
    assert!(h.node_upgrade("machine01").await.is_completed());

    // machine01 is done: the group bumps its version and rolls on.
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, requeue());
    assert_eq!(h.machine_version("machine01").await.as_deref(), Some(K8S_VERSION));
    assert_eq!(h.machine_version("machine02").await.as_deref(), Some(OLD_VERSION));
    let second = h.node_upgrade("machine02").await;
    assert!(!second.spec.first_node_to_be_upgraded);
    assert_eq!(second.spec.etcd_version, None);
    assert_eq!(status_counts(&h).await, (1, 2, false));
    assert_control_plane_machine_synced(&h, "machine01").await;
    assert!(
        !h.machine("machine02")
            .await
            .annotations()
            .contains_key(KUBEADM_CLUSTER_CONFIGURATION_ANNOTATION)
    );

    h.reconcile_nodes().await;
    h.complete_pod("node02").await;
    h.reconcile_nodes().await;

    // Every child is complete: the group marks itself ready and deletes itself.
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.machine_version("machine02").await.as_deref(), Some(K8S_VERSION));
    assert_control_plane_machine_synced(&h, "machine02").await;
    let group = cp_upgrade(&h).await;
    assert!(group.metadata.deletion_timestamp.is_some());
    assert!(group.status.unwrap().ready);

    // The deletion pass removes the children, then the finalizer.
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert!(!h.management.contains::<ControlPlaneUpgrade>(&cp_upgrade_key()));
    assert!(
        h.node_upgrades()
            .await
            .iter()
            .all(|nu| nu.metadata.deletion_timestamp.is_some())
    );

    // Node upgrades clean up their Pods and go away.
    for result in h.reconcile_nodes().await {
        result.unwrap();
    }
    assert_eq!(h.management.count::<NodeUpgrade>(), 0);
    assert_eq!(h.workload.count::<Pod>(), 0);

    // All machines are current, so no new group; the annotation stays until
    // the control plane reports every replica updated.
    assert_eq!(h.kcp.reconcile(&key(CLUSTER)).await.unwrap(), requeue());
    assert_eq!(h.management.count::<ControlPlaneUpgrade>(), 0);
    assert!(h.health_check_paused(KCP_HEALTH_CHECK).await);

    h.set_kcp_updated_replicas(2).await;
    assert_eq!(
        h.kcp.reconcile(&key(CLUSTER)).await.unwrap(),
        Action::await_change()
    );
    let kcp: KubeadmControlPlane = h.management.get(&key(CLUSTER)).await.unwrap();
    assert!(!kcp.annotations().contains_key(KCP_IN_PLACE_UPGRADE_ANNOTATION));
    assert!(!h.health_check_paused(KCP_HEALTH_CHECK).await);
}

#[tokio::test]
async fn test_detector_is_idempotent_while_group_runs() {
    let h = fixture();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    let before = cp_upgrade(&h).await;

    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();

    assert_eq!(h.management.count::<ControlPlaneUpgrade>(), 1);
    let after = cp_upgrade(&h).await;
    assert_eq!(before.metadata.uid, after.metadata.uid);
    assert_eq!(
        serde_json::to_value(&before.spec).unwrap(),
        serde_json::to_value(&after.spec).unwrap()
    );
}

#[tokio::test]
async fn test_group_owned_by_control_plane() {
    let h = fixture();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();

    let owners = cp_upgrade(&h).await.owner_references().to_vec();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "KubeadmControlPlane");
    assert_eq!(owners[0].name, CLUSTER);
    assert_eq!(owners[0].controller, Some(true));
}

#[tokio::test]
async fn test_second_machine_without_node_upgrade_is_rolled_out() {
    let h = fixture();
    h.kcp.reconcile(&key(CLUSTER)).await.unwrap();
    h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    h.reconcile_nodes().await;
    h.complete_pod("node01").await;
    h.reconcile_nodes().await;
    assert_eq!(h.node_upgrades().await.len(), 1);

    // machine01 completed, machine02 has no node upgrade yet.
    let action = h.cp_upgrades.reconcile(&cp_upgrade_key()).await.unwrap();
    assert_eq!(action, requeue());
    assert_eq!(status_counts(&h).await, (1, 2, false));
    assert_eq!(h.node_upgrades().await.len(), 2);
    assert!(!h.node_upgrade("machine02").await.is_completed());
}
