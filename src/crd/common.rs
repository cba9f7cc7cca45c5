//! Types shared by the upgrade CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace holding upgrade resources, the upgrader config map and upgrader Pods.
pub const SYSTEM_NAMESPACE: &str = "eksa-system";

/// Reference to another object by kind, namespace and name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referenced object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referenced object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the referenced object.
    pub name: String,

    /// Namespace of the referenced object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectReference {
    /// Namespace of the reference, falling back to `default_namespace`.
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }
}

/// Condition describes the state of an upgrade at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready.as_str(), ready, reason, message, generation)
    }

    /// Whether the condition status is "True".
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Condition types reported on `NodeUpgrade` status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionType {
    /// All pipeline stages finished successfully.
    Ready,
    /// The upgrader Pod exists on the target node.
    UpgraderPodCreated,
    /// Upgrade binaries were copied onto the host.
    BinariesCopied,
    /// containerd was upgraded.
    ContainerdUpgraded,
    /// CNI plugins were upgraded.
    CniPluginsUpgraded,
    /// kubeadm ran its node upgrade.
    KubeadmUpgraded,
    /// kubelet and kubectl were upgraded.
    KubeletUpgraded,
}

impl ConditionType {
    /// Wire name of the condition type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::UpgraderPodCreated => "UpgraderPodCreated",
            ConditionType::BinariesCopied => "BinariesCopied",
            ConditionType::ContainerdUpgraded => "ContainerdUpgraded",
            ConditionType::CniPluginsUpgraded => "CNIPluginsUpgraded",
            ConditionType::KubeadmUpgraded => "KubeadmUpgraded",
            ConditionType::KubeletUpgraded => "KubeletUpgraded",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
