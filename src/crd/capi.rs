//! Partial Cluster API resource views.
//!
//! Only the fields read or patched by the upgrade controllers are modelled.
//! Writes to these objects always go through JSON merge patches, so fields
//! missing here are preserved on the server.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::common::ObjectReference;

/// Label carrying the owning KubeadmControlPlane name on control-plane machines.
pub const CONTROL_PLANE_NAME_LABEL: &str = "cluster.x-k8s.io/control-plane-name";

/// Label carrying the owning MachineDeployment name on worker machines.
pub const DEPLOYMENT_NAME_LABEL: &str = "cluster.x-k8s.io/deployment-name";

/// Node role label set on control-plane nodes.
pub const NODE_CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Annotation pausing reconciliation of a CAPI object.
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Revision of a MachineDeployment, mirrored on its current MachineSet.
pub const REVISION_ANNOTATION: &str = "machinedeployment.clusters.x-k8s.io/revision";

/// Kubeadm ClusterConfiguration a control-plane machine was created with.
pub const KUBEADM_CLUSTER_CONFIGURATION_ANNOTATION: &str =
    "controlplane.cluster.x-k8s.io/kubeadm-cluster-configuration";

/// Template an infrastructure machine was cloned from.
pub const CLONED_FROM_NAME_ANNOTATION: &str = "cluster.x-k8s.io/cloned-from-name";

/// Fields of a partial view that are not modelled. Kept so that specs
/// copied between objects round-trip unchanged.
pub type Unmodelled = BTreeMap<String, Value>;

// ============================================================================
// Machine
// ============================================================================

/// A CAPI Machine.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the CAPI Cluster this machine belongs to.
    pub cluster_name: String,

    /// Kubernetes version running on the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Provider machine backing this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// The KubeadmConfig this machine was bootstrapped from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// The node backing this machine, once it joined the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReference {
    pub name: String,
}

impl Machine {
    /// Name of the node backing this machine.
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .map(|n| n.name.as_str())
    }
}

// ============================================================================
// KubeadmControlPlane
// ============================================================================

/// A CAPI KubeadmControlPlane.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KubeadmControlPlane",
    plural = "kubeadmcontrolplanes",
    status = "KubeadmControlPlaneStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Desired Kubernetes version.
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeadm_config_spec: Option<KubeadmConfigSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_template: Option<KubeadmControlPlaneMachineTemplate>,

    #[serde(flatten)]
    pub other: Unmodelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneMachineTemplate {
    /// Infrastructure machine template new control-plane machines are cloned from.
    pub infrastructure_ref: ObjectReference,

    #[serde(flatten)]
    pub other: Unmodelled,
}

/// A CAPI KubeadmConfig. The same spec is embedded in every
/// KubeadmControlPlane.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KubeadmConfig",
    plural = "kubeadmconfigs",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_configuration: Option<ClusterConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_configuration: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_configuration: Option<Value>,

    #[serde(flatten)]
    pub other: Unmodelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<Etcd>,

    #[serde(flatten)]
    pub other: Unmodelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Etcd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalEtcd>,

    #[serde(flatten)]
    pub other: Unmodelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEtcd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    #[serde(flatten)]
    pub other: Unmodelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<i32>,
}

impl KubeadmControlPlane {
    /// Image tag of the stacked etcd, if configured.
    pub fn etcd_image_tag(&self) -> Option<&str> {
        self.spec
            .kubeadm_config_spec
            .as_ref()
            .and_then(|k| k.cluster_configuration.as_ref())
            .and_then(|c| c.etcd.as_ref())
            .and_then(|e| e.local.as_ref())
            .and_then(|l| l.image_tag.as_deref())
    }
}

// ============================================================================
// MachineDeployment
// ============================================================================

/// A CAPI MachineDeployment.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineDeployment",
    plural = "machinedeployments",
    status = "MachineDeploymentStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub template: MachineTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub spec: MachineTemplateMachineSpec,
}

/// Machine spec of a MachineDeployment or MachineSet template.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(flatten)]
    pub other: Unmodelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<i32>,
}

// ============================================================================
// MachineSet
// ============================================================================

/// A CAPI MachineSet.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineSet",
    plural = "machinesets",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    #[serde(default)]
    pub template: MachineTemplateSpec,
}

// ============================================================================
// MachineHealthCheck
// ============================================================================

/// A CAPI MachineHealthCheck. Only its annotations are written.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineHealthCheck",
    plural = "machinehealthchecks",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckSpec {
    #[serde(default)]
    pub cluster_name: String,
}
