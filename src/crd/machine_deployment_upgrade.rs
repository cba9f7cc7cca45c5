//! MachineDeploymentUpgrade Custom Resource Definition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ObjectReference;

/// Finalizer guarding the teardown of child `NodeUpgrade` resources.
pub const MACHINE_DEPLOYMENT_UPGRADE_FINALIZER: &str =
    "machinedeploymentupgrades.anywhere.eks.amazonaws.com/finalizer";

// ============================================================================
// MachineDeploymentUpgrade CRD
// ============================================================================

/// MachineDeploymentUpgrade upgrades the worker machines of one
/// MachineDeployment in place, one node at a time.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "anywhere.eks.amazonaws.com",
    version = "v1alpha1",
    kind = "MachineDeploymentUpgrade",
    plural = "machinedeploymentupgrades",
    shortname = "mdu",
    status = "MachineDeploymentUpgradeStatus",
    namespaced,
    printcolumn = r#"{"name":"Upgraded","type":"integer","jsonPath":".status.upgraded"}"#,
    printcolumn = r#"{"name":"Pending","type":"integer","jsonPath":".status.requireUpgrade"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentUpgradeSpec {
    /// The MachineDeployment this upgrade belongs to.
    pub machine_deployment: ObjectReference,

    /// Machines to upgrade, in upgrade order.
    #[serde(default)]
    pub machines_require_upgrade: Vec<ObjectReference>,

    /// Target Kubernetes version.
    pub kubernetes_version: String,

    /// Base64-encoded JSON of the MachineDeployment's machine template spec.
    /// Written to the current MachineSet once every machine is upgraded.
    #[serde(default)]
    pub machine_spec_data: String,
}

/// Aggregated progress of the worker upgrade.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentUpgradeStatus {
    /// Number of machines whose `NodeUpgrade` completed.
    #[serde(default)]
    pub upgraded: i64,

    /// Number of machines this upgrade covers.
    #[serde(default)]
    pub require_upgrade: i64,

    /// True once every machine is upgraded.
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
