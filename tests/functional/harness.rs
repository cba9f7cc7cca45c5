//! In-memory management and workload clusters with every controller wired
//! up, plus helpers to seed CAPI objects and simulate upgrader Pods.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ObjectMeta, TypeMeta};
use kube::runtime::controller::Action;
use serde_json::{Value, json};

use inplace_upgrade_operator::Reconciler;
use inplace_upgrade_operator::client::{MemoryObjectClient, ObjectClient, ObjectKey, StaticRegistry};
use inplace_upgrade_operator::controller::Result;
use inplace_upgrade_operator::controller::detector::{
    KCP_IN_PLACE_UPGRADE_ANNOTATION, MD_IN_PLACE_UPGRADE_ANNOTATION,
};
use inplace_upgrade_operator::controller::node_upgrade::UPGRADER_CONFIG_MAP;
use inplace_upgrade_operator::controller::{
    ControlPlaneUpgradeReconciler, KubeadmControlPlaneReconciler, MachineDeploymentReconciler,
    MachineDeploymentUpgradeReconciler, NodeUpgradeReconciler,
};
use inplace_upgrade_operator::crd::capi::{
    Bootstrap, CONTROL_PLANE_NAME_LABEL, ClusterConfiguration, DEPLOYMENT_NAME_LABEL, Etcd,
    KubeadmConfig, KubeadmConfigSpec, KubeadmControlPlane, KubeadmControlPlaneMachineTemplate,
    KubeadmControlPlaneSpec, KubeadmControlPlaneStatus, LocalEtcd, Machine, MachineDeployment,
    MachineDeploymentSpec, MachineDeploymentStatus, MachineHealthCheck, MachineHealthCheckSpec,
    MachineSet, MachineSetSpec, MachineSpec, MachineStatus, MachineTemplateMachineSpec,
    MachineTemplateSpec, NODE_CONTROL_PLANE_LABEL, NodeReference, PAUSED_ANNOTATION,
    REVISION_ANNOTATION,
};
use inplace_upgrade_operator::crd::{NodeUpgrade, ObjectReference, SYSTEM_NAMESPACE};
use inplace_upgrade_operator::resources::DefaultPodBuilder;
use inplace_upgrade_operator::resources::upgrader_pod::UPGRADE_PIPELINE;

pub const NS: &str = SYSTEM_NAMESPACE;
pub const CLUSTER: &str = "my-cluster";
pub const MD_NAME: &str = "my-cluster-md-0";
pub const OLD_VERSION: &str = "v1.27.8-eks-1-27-18";
pub const K8S_VERSION: &str = "v1.28.3-eks-1-28-9";
pub const ETCD_VERSION: &str = "v3.5.9-eks-1-28-9";
pub const UPGRADER_IMAGE: &str = "public.ecr.aws/eks-anywhere/upgrader:v1-28-9";
pub const KCP_HEALTH_CHECK: &str = "my-cluster-kcp-unhealthy";
pub const MD_HEALTH_CHECK: &str = "my-cluster-md-0-worker-unhealthy";
pub const MACHINE_SET: &str = "my-cluster-md-0-7d9f8";
pub const CP_TEMPLATE: &str = "my-cluster-control-plane-template-1234";
pub const INFRA_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";
pub const INFRA_KIND: &str = "DockerMachine";

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NS, name)
}

pub fn cp_upgrade_key() -> ObjectKey {
    key(&format!("{CLUSTER}-cp-upgrade"))
}

pub fn md_upgrade_key() -> ObjectKey {
    key(&format!("{MD_NAME}-md-upgrade"))
}

pub fn node_upgrade_key(machine: &str) -> ObjectKey {
    key(&format!("{machine}-node-upgrader"))
}

pub fn pod_key(node: &str) -> ObjectKey {
    key(&format!("{node}-node-upgrader"))
}

pub fn bootstrap_config_name(machine: &str) -> String {
    format!("{machine}-bootstrap")
}

pub fn infra_machine_name(machine: &str) -> String {
    format!("{machine}-infra")
}

pub fn infra_type() -> TypeMeta {
    TypeMeta {
        api_version: INFRA_API_VERSION.to_string(),
        kind: INFRA_KIND.to_string(),
    }
}

type NodeReconciler =
    NodeUpgradeReconciler<MemoryObjectClient, StaticRegistry<MemoryObjectClient>, DefaultPodBuilder>;

pub struct Harness {
    pub management: MemoryObjectClient,
    pub workload: MemoryObjectClient,
    pub kcp: KubeadmControlPlaneReconciler<MemoryObjectClient>,
    pub md: MachineDeploymentReconciler<MemoryObjectClient>,
    pub cp_upgrades: ControlPlaneUpgradeReconciler<MemoryObjectClient>,
    pub md_upgrades: MachineDeploymentUpgradeReconciler<MemoryObjectClient>,
    pub nodes: NodeReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let management = MemoryObjectClient::new();
        let workload = MemoryObjectClient::new();
        management
            .insert(ConfigMap {
                metadata: ObjectMeta {
                    name: Some(UPGRADER_CONFIG_MAP.to_string()),
                    namespace: Some(NS.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    K8S_VERSION.to_string(),
                    UPGRADER_IMAGE.to_string(),
                )])),
                ..Default::default()
            })
            .unwrap();

        Self {
            kcp: KubeadmControlPlaneReconciler::new(management.clone()),
            md: MachineDeploymentReconciler::new(management.clone()),
            cp_upgrades: ControlPlaneUpgradeReconciler::new(management.clone()),
            md_upgrades: MachineDeploymentUpgradeReconciler::new(management.clone()),
            nodes: NodeUpgradeReconciler::new(
                management.clone(),
                StaticRegistry::single(workload.clone()),
                DefaultPodBuilder,
            ),
            management,
            workload,
        }
    }

    pub fn add_kcp(&self, replicas: i32, updated: i32) {
        self.management
            .insert(KubeadmControlPlane {
                metadata: ObjectMeta {
                    name: Some(CLUSTER.to_string()),
                    namespace: Some(NS.to_string()),
                    uid: Some("kcp-uid".to_string()),
                    annotations: Some(BTreeMap::from([(
                        KCP_IN_PLACE_UPGRADE_ANNOTATION.to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                },
                spec: KubeadmControlPlaneSpec {
                    replicas: Some(replicas),
                    version: K8S_VERSION.to_string(),
                    kubeadm_config_spec: Some(KubeadmConfigSpec {
                        cluster_configuration: Some(ClusterConfiguration {
                            etcd: Some(Etcd {
                                local: Some(LocalEtcd {
                                    image_tag: Some(ETCD_VERSION.to_string()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        join_configuration: Some(json!({
                            "nodeRegistration": {"kubeletExtraArgs": {"node-labels": "role=cp"}}
                        })),
                        ..Default::default()
                    }),
                    machine_template: Some(KubeadmControlPlaneMachineTemplate {
                        infrastructure_ref: ObjectReference {
                            api_version: Some(INFRA_API_VERSION.to_string()),
                            kind: Some("DockerMachineTemplate".to_string()),
                            name: CP_TEMPLATE.to_string(),
                            namespace: Some(NS.to_string()),
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                status: Some(KubeadmControlPlaneStatus {
                    updated_replicas: Some(updated),
                }),
            })
            .unwrap();
        self.add_health_check(KCP_HEALTH_CHECK);
    }

    fn add_health_check(&self, name: &str) {
        self.management
            .insert(MachineHealthCheck {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(NS.to_string()),
                    ..Default::default()
                },
                spec: MachineHealthCheckSpec {
                    cluster_name: CLUSTER.to_string(),
                },
            })
            .unwrap();
    }

    pub fn add_md(&self, replicas: i32, updated: i32) {
        self.management
            .insert(MachineDeployment {
                metadata: ObjectMeta {
                    name: Some(MD_NAME.to_string()),
                    namespace: Some(NS.to_string()),
                    uid: Some("md-uid".to_string()),
                    annotations: Some(BTreeMap::from([
                        (MD_IN_PLACE_UPGRADE_ANNOTATION.to_string(), "true".to_string()),
                        (REVISION_ANNOTATION.to_string(), "2".to_string()),
                    ])),
                    ..Default::default()
                },
                spec: MachineDeploymentSpec {
                    cluster_name: CLUSTER.to_string(),
                    replicas: Some(replicas),
                    template: MachineTemplateSpec {
                        spec: desired_worker_template(),
                    },
                },
                status: Some(MachineDeploymentStatus {
                    updated_replicas: Some(updated),
                }),
            })
            .unwrap();

        // The MachineSet of the deployment's current revision, still on the
        // old template.
        self.management
            .insert(MachineSet {
                metadata: ObjectMeta {
                    name: Some(MACHINE_SET.to_string()),
                    namespace: Some(NS.to_string()),
                    labels: Some(BTreeMap::from([(
                        DEPLOYMENT_NAME_LABEL.to_string(),
                        MD_NAME.to_string(),
                    )])),
                    annotations: Some(BTreeMap::from([(
                        REVISION_ANNOTATION.to_string(),
                        "2".to_string(),
                    )])),
                    ..Default::default()
                },
                spec: MachineSetSpec {
                    template: MachineTemplateSpec {
                        spec: MachineTemplateMachineSpec {
                            version: Some(OLD_VERSION.to_string()),
                            ..Default::default()
                        },
                    },
                },
            })
            .unwrap();
        self.add_health_check(MD_HEALTH_CHECK);
    }

    /// Seed a control plane Machine and its Node on the workload cluster.
    pub fn add_cp_machine(&self, machine: &str, node: &str, created: &str) {
        self.add_machine(machine, node, created, (CONTROL_PLANE_NAME_LABEL, CLUSTER), true);
    }

    /// Seed a worker Machine and its Node on the workload cluster.
    pub fn add_worker_machine(&self, machine: &str, node: &str, created: &str) {
        self.add_machine(machine, node, created, (DEPLOYMENT_NAME_LABEL, MD_NAME), false);
    }

    fn add_machine(
        &self,
        machine: &str,
        node: &str,
        created: &str,
        label: (&str, &str),
        control_plane: bool,
    ) {
        self.management
            .insert(Machine {
                metadata: ObjectMeta {
                    name: Some(machine.to_string()),
                    namespace: Some(NS.to_string()),
                    labels: Some(BTreeMap::from([(label.0.to_string(), label.1.to_string())])),
                    creation_timestamp: Some(Time(created.parse().unwrap())),
                    ..Default::default()
                },
                spec: MachineSpec {
                    cluster_name: CLUSTER.to_string(),
                    version: Some(OLD_VERSION.to_string()),
                    bootstrap: Bootstrap {
                        config_ref: control_plane.then(|| ObjectReference {
                            name: bootstrap_config_name(machine),
                            ..Default::default()
                        }),
                    },
                    infrastructure_ref: control_plane.then(|| ObjectReference {
                        api_version: Some(INFRA_API_VERSION.to_string()),
                        kind: Some(INFRA_KIND.to_string()),
                        name: infra_machine_name(machine),
                        namespace: Some(NS.to_string()),
                    }),
                },
                status: Some(MachineStatus {
                    node_ref: Some(NodeReference {
                        name: node.to_string(),
                    }),
                }),
            })
            .unwrap();

        if control_plane {
            self.management
                .insert(KubeadmConfig {
                    metadata: ObjectMeta {
                        name: Some(bootstrap_config_name(machine)),
                        namespace: Some(NS.to_string()),
                        ..Default::default()
                    },
                    spec: KubeadmConfigSpec {
                        join_configuration: Some(json!({"nodeRegistration": {}})),
                        ..Default::default()
                    },
                })
                .unwrap();
            self.management
                .insert_value(json!({
                    "apiVersion": INFRA_API_VERSION,
                    "kind": INFRA_KIND,
                    "metadata": {"name": infra_machine_name(machine), "namespace": NS},
                    "spec": {"customImage": "kindest/node:v1.27.8"},
                }))
                .unwrap();
        }

        let mut labels = BTreeMap::new();
        if control_plane {
            labels.insert(NODE_CONTROL_PLANE_LABEL.to_string(), String::new());
        }
        self.workload
            .insert(Node {
                metadata: ObjectMeta {
                    name: Some(node.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
    }

    pub async fn node_upgrades(&self) -> Vec<NodeUpgrade> {
        self.management
            .list::<NodeUpgrade>(NS, &BTreeMap::new())
            .await
            .unwrap()
    }

    pub async fn node_upgrade(&self, machine: &str) -> NodeUpgrade {
        self.management.get(&node_upgrade_key(machine)).await.unwrap()
    }

    pub async fn machine_version(&self, machine: &str) -> Option<String> {
        self.machine(machine).await.spec.version
    }

    pub async fn machine(&self, machine: &str) -> Machine {
        self.management.get(&key(machine)).await.unwrap()
    }

    pub async fn health_check_paused(&self, name: &str) -> bool {
        let health_check: MachineHealthCheck = self.management.get(&key(name)).await.unwrap();
        health_check
            .metadata
            .annotations
            .unwrap_or_default()
            .contains_key(PAUSED_ANNOTATION)
    }

    pub async fn machine_set(&self) -> MachineSet {
        self.management.get(&key(MACHINE_SET)).await.unwrap()
    }

    pub async fn kubeadm_config(&self, machine: &str) -> KubeadmConfig {
        self.management
            .get(&key(&bootstrap_config_name(machine)))
            .await
            .unwrap()
    }

    pub fn infra_machine(&self, machine: &str) -> Value {
        self.management
            .get_value(&infra_type(), &key(&infra_machine_name(machine)))
            .unwrap()
    }

    /// Reconcile every NodeUpgrade once, in name order.
    pub async fn reconcile_nodes(&self) -> Vec<Result<Action>> {
        let mut names: Vec<String> = self
            .node_upgrades()
            .await
            .into_iter()
            .filter_map(|nu| nu.metadata.name)
            .collect();
        names.sort();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            results.push(self.nodes.reconcile(&key(&name)).await);
        }
        results
    }

    async fn set_init_statuses(&self, node: &str, statuses: Vec<Value>) {
        self.workload
            .patch_status::<Pod>(
                &pod_key(node),
                &json!({"status": {"initContainerStatuses": statuses}}),
            )
            .await
            .unwrap();
    }

    /// Mark every upgrade step of the upgrader Pod on `node` as succeeded.
    pub async fn complete_pod(&self, node: &str) {
        let statuses = UPGRADE_PIPELINE
            .iter()
            .map(|(name, _)| terminated(name, 0, "Completed"))
            .collect();
        self.set_init_statuses(node, statuses).await;
    }

    /// Fail the containerd step of the upgrader Pod on `node`.
    pub async fn fail_pod(&self, node: &str) {
        let mut steps = UPGRADE_PIPELINE.iter();
        let mut statuses = Vec::new();
        if let Some((copier, _)) = steps.next() {
            statuses.push(terminated(copier, 0, "Completed"));
        }
        if let Some((containerd, _)) = steps.next() {
            statuses.push(terminated(containerd, 1, "Error"));
        }
        self.set_init_statuses(node, statuses).await;
    }

    pub async fn set_kcp_updated_replicas(&self, updated: i32) {
        self.management
            .patch_status::<KubeadmControlPlane>(
                &key(CLUSTER),
                &json!({"status": {"updatedReplicas": updated}}),
            )
            .await
            .unwrap();
    }

    pub async fn set_md_updated_replicas(&self, updated: i32) {
        self.management
            .patch_status::<MachineDeployment>(
                &key(MD_NAME),
                &json!({"status": {"updatedReplicas": updated}}),
            )
            .await
            .unwrap();
    }
}

/// Worker template the MachineDeployment asks for.
pub fn desired_worker_template() -> MachineTemplateMachineSpec {
    serde_json::from_value(json!({
        "clusterName": CLUSTER,
        "version": K8S_VERSION,
        "bootstrap": {"configRef": {"kind": "KubeadmConfigTemplate", "name": "md-0-template-2"}},
    }))
    .unwrap()
}

fn terminated(name: &str, exit_code: i32, reason: &str) -> Value {
    json!({
        "name": name,
        "ready": exit_code == 0,
        "restartCount": 0,
        "image": UPGRADER_IMAGE,
        "imageID": "",
        "state": {"terminated": {"exitCode": exit_code, "reason": reason}}
    })
}
