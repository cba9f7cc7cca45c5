//! Common resource generation utilities.
//!
//! Labels, owner references and deterministic names shared by the objects
//! the controllers create.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Value of `app.kubernetes.io/managed-by` on created objects
pub const MANAGED_BY: &str = "inplace-upgrade-operator";

/// Label carrying the node name on upgrader Pods
pub const NODE_UPGRADER_LABEL: &str = "anywhere.eks.amazonaws.com/node-upgrader";

/// Name of the ControlPlaneUpgrade for a KubeadmControlPlane.
pub fn control_plane_upgrade_name(kcp_name: &str) -> String {
    format!("{kcp_name}-cp-upgrade")
}

/// Name of the MachineDeploymentUpgrade for a MachineDeployment.
pub fn machine_deployment_upgrade_name(md_name: &str) -> String {
    format!("{md_name}-md-upgrade")
}

/// Name of the NodeUpgrade for a Machine.
pub fn node_upgrade_name(machine_name: &str) -> String {
    format!("{machine_name}-node-upgrader")
}

/// Name of the MachineHealthCheck EKS-A creates for a KubeadmControlPlane.
pub fn control_plane_health_check_name(kcp_name: &str) -> String {
    format!("{kcp_name}-kcp-unhealthy")
}

/// Name of the MachineHealthCheck EKS-A creates for a MachineDeployment.
pub fn machine_deployment_health_check_name(md_name: &str) -> String {
    format!("{md_name}-worker-unhealthy")
}

/// Name of the upgrader Pod for a node.
pub fn upgrader_pod_name(node_name: &str) -> String {
    format!("{node_name}-node-upgrader")
}

/// Standard labels applied to all created objects
pub fn standard_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
    ])
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
