//! NodeUpgrade Custom Resource Definition.
//!
//! One `NodeUpgrade` exists per machine being upgraded. Its controller runs
//! the upgrader Pod on the machine's node (possibly on a remote workload
//! cluster) and folds the Pod's init container states into `status`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, ObjectReference};

/// Finalizer guarding the deletion of the upgrader Pod.
pub const NODE_UPGRADE_FINALIZER: &str = "nodeupgrades.anywhere.eks.amazonaws.com/finalizer";

// ============================================================================
// NodeUpgrade CRD
// ============================================================================

/// NodeUpgrade upgrades the components of a single node in place.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "anywhere.eks.amazonaws.com",
    version = "v1alpha1",
    kind = "NodeUpgrade",
    plural = "nodeupgrades",
    shortname = "nu",
    status = "NodeUpgradeStatus",
    namespaced,
    printcolumn = r#"{"name":"Machine","type":"string","jsonPath":".spec.machine.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Completed","type":"boolean","jsonPath":".status.completed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpgradeSpec {
    /// The CAPI Machine whose node is upgraded.
    pub machine: ObjectReference,

    /// Target Kubernetes version.
    pub kubernetes_version: String,

    /// Target etcd version. Only set for control-plane machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_version: Option<String>,

    /// True for the first control-plane node, which runs `kubeadm upgrade apply`.
    #[serde(default)]
    pub first_node_to_be_upgraded: bool,
}

/// Observed state of a node upgrade.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpgradeStatus {
    /// True once every upgrader stage exited successfully.
    #[serde(default)]
    pub completed: bool,

    /// Per-stage conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Message of the last failed upgrader stage, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Observed generation of the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl NodeUpgrade {
    /// Whether the upgrade finished.
    pub fn is_completed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed)
    }
}
