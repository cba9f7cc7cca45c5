//! Upgrader Pod generation.
//!
//! The upgrader Pod runs on the node being upgraded. Each init container
//! upgrades one component, in a fixed order:
//!
//! | Init container | Step |
//! |----------------|------|
//! | `components-copier` | copy upgrade binaries onto the host |
//! | `containerd-upgrader` | upgrade containerd |
//! | `cni-plugins-upgrader` | upgrade CNI plugins |
//! | `kubeadm-upgrader` | `kubeadm upgrade apply` / `node` |
//! | `kubelet-kubectl-upgrader` | upgrade kubelet and kubectl |
//!
//! Every step after the copier enters the host namespaces of PID 1 and runs
//! the upgrade script the copier installed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::common::{NODE_UPGRADER_LABEL, standard_labels, upgrader_pod_name};
use crate::crd::{ConditionType, SYSTEM_NAMESPACE};

/// Directory in the upgrader image holding the upgrade components.
pub const IMAGE_COMPONENTS_DIR: &str = "/eksa-upgrades";

/// Upgrade script on the host, once copied.
pub const UPGRADE_SCRIPT: &str = "/usr/host/eksa-upgrades/scripts/upgrade.sh";

const COMPONENTS_VOLUME: &str = "host-components";
/// Host directory the copier writes into, mounted at the same path.
const COPIER_MOUNT_PATH: &str = "/usr/host";

pub const COPIER_CONTAINER: &str = "components-copier";
pub const CONTAINERD_CONTAINER: &str = "containerd-upgrader";
pub const CNI_PLUGINS_CONTAINER: &str = "cni-plugins-upgrader";
pub const KUBEADM_CONTAINER: &str = "kubeadm-upgrader";
pub const KUBELET_CONTAINER: &str = "kubelet-kubectl-upgrader";
pub const POST_UPGRADE_CONTAINER: &str = "post-upgrade-status";

/// Init containers in execution order, with the condition each one drives.
pub const UPGRADE_PIPELINE: [(&str, ConditionType); 5] = [
    (COPIER_CONTAINER, ConditionType::BinariesCopied),
    (CONTAINERD_CONTAINER, ConditionType::ContainerdUpgraded),
    (CNI_PLUGINS_CONTAINER, ConditionType::CniPluginsUpgraded),
    (KUBEADM_CONTAINER, ConditionType::KubeadmUpgraded),
    (KUBELET_CONTAINER, ConditionType::KubeletUpgraded),
];

/// Inputs for one upgrader Pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgraderPodParams {
    /// Node the Pod is pinned to.
    pub node_name: String,
    /// Upgrader image for the target Kubernetes version.
    pub image: String,
    pub kubernetes_version: String,
    /// Only used on the first control-plane node.
    pub etcd_version: Option<String>,
    /// Whether this node runs `kubeadm upgrade apply`.
    pub first_control_plane: bool,
    pub control_plane_node: bool,
}

/// Builds the upgrader Pod for a node.
#[cfg_attr(test, mockall::automock)]
pub trait UpgraderPodBuilder: Send + Sync + 'static {
    fn build_pod(&self, params: &UpgraderPodParams) -> Pod;
}

/// Pod builder running the EKS-A upgrade script steps.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPodBuilder;

impl UpgraderPodBuilder for DefaultPodBuilder {
    fn build_pod(&self, params: &UpgraderPodParams) -> Pod {
        generate_upgrader_pod(params)
    }
}

/// kubeadm step arguments for the node's role.
fn kubeadm_step(params: &UpgraderPodParams) -> Vec<String> {
    if params.first_control_plane {
        vec![
            "kubeadm_in_first_cp".to_string(),
            params.kubernetes_version.clone(),
            params.etcd_version.clone().unwrap_or_default(),
        ]
    } else if params.control_plane_node {
        vec!["kubeadm_in_rest_cp".to_string()]
    } else {
        vec!["kubeadm_in_worker".to_string()]
    }
}

/// Container that runs one upgrade script step inside the host namespaces.
fn host_step_container(name: &str, image: &str, step: Vec<String>) -> Container {
    let mut args: Vec<String> = [
        "--target", "1", "--mount", "--uts", "--ipc", "--net", "--",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(UPGRADE_SCRIPT.to_string());
    args.extend(step);

    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["nsenter".to_string()]),
        args: Some(args),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the upgrader Pod for a node.
pub fn generate_upgrader_pod(params: &UpgraderPodParams) -> Pod {
    let mut labels: BTreeMap<String, String> = standard_labels("node-upgrader");
    labels.insert(NODE_UPGRADER_LABEL.to_string(), params.node_name.clone());
    let image = params.image.as_str();

    let copier = Container {
        name: COPIER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["cp".to_string()]),
        args: Some(vec![
            "-r".to_string(),
            IMAGE_COMPONENTS_DIR.to_string(),
            COPIER_MOUNT_PATH.to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: COMPONENTS_VOLUME.to_string(),
            mount_path: COPIER_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let init_containers = vec![
        copier,
        host_step_container(
            CONTAINERD_CONTAINER,
            image,
            vec!["upgrade_containerd".to_string()],
        ),
        host_step_container(
            CNI_PLUGINS_CONTAINER,
            image,
            vec!["cni_plugins".to_string()],
        ),
        host_step_container(KUBEADM_CONTAINER, image, kubeadm_step(params)),
        host_step_container(
            KUBELET_CONTAINER,
            image,
            vec!["kubelet_and_kubectl".to_string()],
        ),
    ];

    Pod {
        metadata: ObjectMeta {
            name: Some(upgrader_pod_name(&params.node_name)),
            namespace: Some(SYSTEM_NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(params.node_name.clone()),
            host_pid: Some(true),
            restart_policy: Some("OnFailure".to_string()),
            init_containers: Some(init_containers),
            containers: vec![host_step_container(
                POST_UPGRADE_CONTAINER,
                image,
                vec!["print_status_and_cleanup".to_string()],
            )],
            volumes: Some(vec![Volume {
                name: COMPONENTS_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: COPIER_MOUNT_PATH.to_string(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
