//! MachineDeployment in-place upgrades.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::controller::Action;

use inplace_upgrade_operator::Reconciler;
use inplace_upgrade_operator::client::ObjectClient;
use inplace_upgrade_operator::controller::detector::MD_IN_PLACE_UPGRADE_ANNOTATION;
use inplace_upgrade_operator::client::memory::Verb;
use inplace_upgrade_operator::crd::capi::{MachineDeployment, MachineSet};
use inplace_upgrade_operator::crd::{MachineDeploymentUpgrade, NodeUpgrade};

use crate::harness::*;

#[tokio::test]
async fn test_machine_deployment_upgrade_end_to_end() {
    let h = Harness::new();
    h.add_md(1, 0);
    h.add_worker_machine("md-machine01", "worker01", "2024-01-01T00:00:00Z");

    h.md.reconcile(&key(MD_NAME)).await.unwrap();
    let group: MachineDeploymentUpgrade = h.management.get(&md_upgrade_key()).await.unwrap();
    assert_eq!(group.spec.machines_require_upgrade.len(), 1);
    assert_eq!(group.spec.kubernetes_version, K8S_VERSION);
    assert!(h.health_check_paused(MD_HEALTH_CHECK).await);

    // A single machine means the status pass finds every child right away.
    let action = h.md_upgrades.reconcile(&md_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::requeue(std::time::Duration::from_secs(10)));
    let child = h.node_upgrade("md-machine01").await;
    assert!(!child.spec.first_node_to_be_upgraded);
    assert_eq!(child.spec.etcd_version, None);
    assert_eq!(
        child.labels().get("app.kubernetes.io/component").map(String::as_str),
        Some("node-upgrade")
    );

    h.reconcile_nodes().await;
    let pod: Pod = h.workload.get(&pod_key("worker01")).await.unwrap();
    assert_eq!(
        pod.spec.as_ref().and_then(|s| s.node_name.as_deref()),
        Some("worker01")
    );
    h.complete_pod("worker01").await;
    h.reconcile_nodes().await;

    let action = h.md_upgrades.reconcile(&md_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(
        h.machine_version("md-machine01").await.as_deref(),
        Some(K8S_VERSION)
    );

    // The current MachineSet now carries the deployment's template, so CAPI
    // does not roll the upgraded machine.
    let machine_set = h.machine_set().await;
    assert_eq!(
        serde_json::to_value(&machine_set.spec.template.spec).unwrap(),
        serde_json::to_value(desired_worker_template()).unwrap()
    );

    h.md_upgrades.reconcile(&md_upgrade_key()).await.unwrap();
    assert_eq!(h.management.count::<MachineDeploymentUpgrade>(), 0);
    h.reconcile_nodes().await;
    assert_eq!(h.management.count::<NodeUpgrade>(), 0);
    assert_eq!(h.workload.count::<Pod>(), 0);

    h.set_md_updated_replicas(1).await;
    h.md.reconcile(&key(MD_NAME)).await.unwrap();
    let md: MachineDeployment = h.management.get(&key(MD_NAME)).await.unwrap();
    assert!(!md.annotations().contains_key(MD_IN_PLACE_UPGRADE_ANNOTATION));
    assert!(!h.health_check_paused(MD_HEALTH_CHECK).await);
}

#[tokio::test]
async fn test_machine_set_failure_holds_group_back() {
    let h = Harness::new();
    h.add_md(1, 0);
    h.add_worker_machine("md-machine01", "worker01", "2024-01-01T00:00:00Z");
    h.md.reconcile(&key(MD_NAME)).await.unwrap();
    h.md_upgrades.reconcile(&md_upgrade_key()).await.unwrap();
    h.reconcile_nodes().await;
    h.complete_pod("worker01").await;
    h.reconcile_nodes().await;

    h.management.fail::<MachineSet>(Verb::Patch, "the object has been modified");
    let err = h.md_upgrades.reconcile(&md_upgrade_key()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("updating spec for machineset {MACHINE_SET}: the object has been modified")
    );
    let group: MachineDeploymentUpgrade = h.management.get(&md_upgrade_key()).await.unwrap();
    assert!(!group.status.is_some_and(|s| s.ready));
    assert!(group.metadata.deletion_timestamp.is_none());

    h.management.clear_failures();
    let action = h.md_upgrades.reconcile(&md_upgrade_key()).await.unwrap();
    assert_eq!(action, Action::await_change());
}

#[tokio::test]
async fn test_only_machines_of_the_deployment_are_selected() {
    let h = Harness::new();
    h.add_md(2, 0);
    h.add_worker_machine("md-machine01", "worker01", "2024-01-01T00:00:00Z");
    // Control plane machine in the same namespace must be ignored.
    h.add_cp_machine("cp-machine01", "cp01", "2023-12-31T00:00:00Z");

    h.md.reconcile(&key(MD_NAME)).await.unwrap();
    let group: MachineDeploymentUpgrade = h.management.get(&md_upgrade_key()).await.unwrap();
    let names: Vec<_> = group
        .spec
        .machines_require_upgrade
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(names, ["md-machine01"]);
}
