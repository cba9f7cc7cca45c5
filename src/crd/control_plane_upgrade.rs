//! ControlPlaneUpgrade Custom Resource Definition.
//!
//! Created by the KubeadmControlPlane detector when the control plane is
//! annotated for an in-place upgrade. Fans out one `NodeUpgrade` per
//! control-plane machine and aggregates their completion.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ObjectReference;

/// Finalizer guarding the teardown of child `NodeUpgrade` resources.
pub const CONTROL_PLANE_UPGRADE_FINALIZER: &str =
    "controlplaneupgrades.anywhere.eks.amazonaws.com/finalizer";

// ============================================================================
// ControlPlaneUpgrade CRD
// ============================================================================

/// ControlPlaneUpgrade upgrades every listed control-plane machine in place,
/// one node at a time.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "anywhere.eks.amazonaws.com",
    version = "v1alpha1",
    kind = "ControlPlaneUpgrade",
    plural = "controlplaneupgrades",
    shortname = "cpu",
    status = "ControlPlaneUpgradeStatus",
    namespaced,
    printcolumn = r#"{"name":"Upgraded","type":"integer","jsonPath":".status.upgraded"}"#,
    printcolumn = r#"{"name":"Pending","type":"integer","jsonPath":".status.requireUpgrade"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneUpgradeSpec {
    /// The KubeadmControlPlane this upgrade belongs to.
    pub control_plane: ObjectReference,

    /// Machines to upgrade, in upgrade order. The first entry coordinates
    /// the etcd version bump.
    #[serde(default)]
    pub machines_require_upgrade: Vec<ObjectReference>,

    /// Target Kubernetes version (e.g., "v1.29.0-eks-1-29-0").
    pub kubernetes_version: String,

    /// Target etcd version (e.g., "v3.5.10-eks-1-29-0").
    pub etcd_version: String,

    /// Base64-encoded JSON of the KubeadmControlPlane spec at the time the
    /// upgrade was requested. Upgraded machines are synced from it.
    #[serde(default)]
    pub control_plane_spec_data: String,
}

/// Aggregated progress of the control-plane upgrade.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneUpgradeStatus {
    /// Number of machines whose `NodeUpgrade` completed.
    #[serde(default)]
    pub upgraded: i64,

    /// Number of machines this upgrade covers.
    #[serde(default)]
    pub require_upgrade: i64,

    /// True once every machine is upgraded.
    #[serde(default)]
    pub ready: bool,

    /// Observed generation of the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
