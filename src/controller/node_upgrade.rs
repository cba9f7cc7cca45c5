//! NodeUpgrade controller.
//!
//! Runs the upgrader Pod for one machine on the machine's workload cluster
//! and folds the Pod's init container states into conditions and the
//! `completed` flag. The Pod is removed before the finalizer is released.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, ContainerStatus, Namespace, Node, Pod};
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument, warn};

use crate::client::{
    ObjectClient, ObjectKey, RemoteClientRegistry, create_if_absent, delete_if_present, get_opt,
};
use crate::controller::common::{
    PatchHelper, REQUEUE_INTERVAL, add_finalizer, is_deleting, remove_finalizer,
    with_patch_result,
};
use crate::controller::error::{Error, Result, ResultExt};
use crate::controller::status::{ConditionBuilder, reason};
use crate::crd::capi::{Machine, NODE_CONTROL_PLANE_LABEL};
use crate::crd::{
    ConditionType, NODE_UPGRADE_FINALIZER, NodeUpgrade, NodeUpgradeStatus, SYSTEM_NAMESPACE,
};
use crate::manager::Reconciler;
use crate::resources::upgrader_pod::{UPGRADE_PIPELINE, UpgraderPodBuilder, UpgraderPodParams};
use crate::resources::upgrader_pod_name;

/// ConfigMap in the system namespace mapping Kubernetes versions to upgrader images.
pub const UPGRADER_CONFIG_MAP: &str = "in-place-upgrade";

/// Observed state of one upgrader init container.
#[derive(Clone, Debug, PartialEq, Eq)]
enum StageState {
    /// No status reported yet
    Pending,
    Waiting,
    Running,
    Succeeded,
    /// Exited non-zero, with the kubelet's termination reason
    Failed(String),
}

fn stage_state(status: Option<&ContainerStatus>) -> StageState {
    let Some(status) = status else {
        return StageState::Pending;
    };
    let state = status.state.as_ref();
    if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
        return if terminated.exit_code == 0 {
            StageState::Succeeded
        } else {
            StageState::Failed(terminated.reason.clone().unwrap_or_default())
        };
    }
    // restartPolicy OnFailure re-runs a failed container; the failure lives
    // in lastState until the retry succeeds.
    let last_failure = status
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .filter(|t| t.exit_code != 0);
    if let Some(terminated) = last_failure {
        return StageState::Failed(terminated.reason.clone().unwrap_or_default());
    }
    if state.and_then(|s| s.running.as_ref()).is_some() {
        StageState::Running
    } else {
        StageState::Waiting
    }
}

/// Fold the upgrader Pod's init container states into `status`.
///
/// `completed` is true only once every pipeline stage exited 0. A failed
/// stage is reported through its condition and `failure_message`; it is not
/// a reconcile error.
pub fn apply_pod_status(status: &mut NodeUpgradeStatus, pod: &Pod, generation: Option<i64>) {
    let containers: BTreeMap<&str, &ContainerStatus> = pod
        .status
        .as_ref()
        .and_then(|s| s.init_container_statuses.as_ref())
        .into_iter()
        .flatten()
        .map(|c| (c.name.as_str(), c))
        .collect();

    let mut conditions = ConditionBuilder::new(&status.conditions);
    let mut failure: Option<String> = None;
    let mut completed = true;

    for (container, condition) in UPGRADE_PIPELINE {
        let state = stage_state(containers.get(container).copied());
        if state != StageState::Succeeded {
            completed = false;
        }
        match state {
            StageState::Succeeded => {
                conditions.mark_true(condition, generation);
            }
            StageState::Failed(exit_reason) => {
                let message =
                    format!("Container exited with a non-zero exit code, reason: {exit_reason}");
                conditions.mark_false(condition, reason::CONTAINER_FAILED, &message, generation);
                failure.get_or_insert_with(|| format!("{container}: {message}"));
            }
            StageState::Running => {
                conditions.mark_false(
                    condition,
                    reason::CONTAINER_RUNNING,
                    "Container is still running",
                    generation,
                );
            }
            StageState::Waiting => {
                conditions.mark_false(
                    condition,
                    reason::CONTAINER_WAITING,
                    "Container is waiting to be initialized",
                    generation,
                );
            }
            StageState::Pending => {
                conditions.mark_false(
                    condition,
                    reason::CONTAINER_WAITING,
                    "Container status not available yet",
                    generation,
                );
            }
        }
    }

    match &failure {
        Some(message) => conditions.ready(false, reason::UPGRADE_FAILED, message, generation),
        None if completed => conditions.ready(true, reason::UPGRADE_COMPLETE, "", generation),
        None => conditions.ready(false, reason::UPGRADE_IN_PROGRESS, "", generation),
    };

    status.conditions = conditions.build();
    status.failure_message = failure;
    status.completed = completed;
    status.observed_generation = generation;
}

/// Reconciles `NodeUpgrade` objects.
pub struct NodeUpgradeReconciler<C, R, B> {
    client: C,
    registry: R,
    builder: B,
}

impl<C, R, B> NodeUpgradeReconciler<C, R, B>
where
    C: ObjectClient,
    R: RemoteClientRegistry,
    B: UpgraderPodBuilder,
{
    /// `client` talks to the management cluster, `registry` resolves the
    /// workload cluster the upgrader Pod runs on.
    pub fn new(client: C, registry: R, builder: B) -> Self {
        Self {
            client,
            registry,
            builder,
        }
    }

    async fn reconcile_delete(
        &self,
        remote: &R::Client,
        node_upgrade: &mut NodeUpgrade,
        node_name: &str,
    ) -> Result<Action> {
        let pod_key = ObjectKey::new(SYSTEM_NAMESPACE, upgrader_pod_name(node_name));
        if delete_if_present::<Pod, _>(remote, &pod_key).await? {
            info!(pod = %pod_key, "Deleted upgrader pod");
        } else {
            debug!(pod = %pod_key, "Upgrader pod already gone");
        }
        remove_finalizer(node_upgrade, NODE_UPGRADE_FINALIZER);
        Ok(Action::await_change())
    }

    async fn release_orphan(
        &self,
        mut node_upgrade: NodeUpgrade,
        machine_key: &ObjectKey,
    ) -> Result<Action> {
        let helper = PatchHelper::new(&node_upgrade)?;
        if remove_finalizer(&mut node_upgrade, NODE_UPGRADE_FINALIZER) {
            info!(machine = %machine_key, "Machine or its node is gone, releasing finalizer");
        }
        helper.patch(&self.client, &node_upgrade).await?;
        Ok(Action::await_change())
    }

    async fn reconcile_upgrade(
        &self,
        remote: &R::Client,
        node_upgrade: &mut NodeUpgrade,
        node_name: &str,
    ) -> Result<Action> {
        let generation = node_upgrade.metadata.generation;
        let pod_key = ObjectKey::new(SYSTEM_NAMESPACE, upgrader_pod_name(node_name));

        match get_opt::<Pod, _>(remote, &pod_key).await? {
            None => {
                self.create_upgrader_pod(remote, node_upgrade, node_name)
                    .await?;
                let status = node_upgrade.status.get_or_insert_with(Default::default);
                let mut conditions = ConditionBuilder::new(&status.conditions);
                conditions
                    .mark_true(ConditionType::UpgraderPodCreated, generation)
                    .ready(false, reason::UPGRADE_IN_PROGRESS, "", generation);
                status.conditions = conditions.build();
                status.observed_generation = generation;
                Ok(Action::requeue(REQUEUE_INTERVAL))
            }
            Some(pod) => {
                let status = node_upgrade.status.get_or_insert_with(Default::default);
                apply_pod_status(status, &pod, generation);
                if let Some(message) = &status.failure_message {
                    warn!(pod = %pod_key, failure = %message, "Upgrader pod stage failed");
                }
                if status.completed {
                    info!(node = %node_name, "Node upgrade completed");
                    Ok(Action::await_change())
                } else {
                    Ok(Action::requeue(REQUEUE_INTERVAL))
                }
            }
        }
    }

    async fn create_upgrader_pod(
        &self,
        remote: &R::Client,
        node_upgrade: &NodeUpgrade,
        node_name: &str,
    ) -> Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        create_if_absent(remote, &namespace)
            .await
            .with_context(|| format!("ensuring namespace {SYSTEM_NAMESPACE} on workload cluster"))?;

        let node: Node = remote.get(&ObjectKey::cluster(node_name)).await?;
        let control_plane_node = node.labels().contains_key(NODE_CONTROL_PLANE_LABEL);

        let spec = &node_upgrade.spec;
        let image = self.upgrader_image(&spec.kubernetes_version).await?;
        let params = UpgraderPodParams {
            node_name: node_name.to_string(),
            image,
            kubernetes_version: spec.kubernetes_version.clone(),
            etcd_version: spec.etcd_version.clone(),
            first_control_plane: spec.first_node_to_be_upgraded,
            control_plane_node,
        };
        let pod = self.builder.build_pod(&params);
        if create_if_absent(remote, &pod).await? {
            info!(
                node = %node_name,
                control_plane = control_plane_node,
                first = spec.first_node_to_be_upgraded,
                "Created upgrader pod"
            );
        }
        Ok(())
    }

    /// Upgrader image for `kubernetes_version` from the upgrader ConfigMap.
    async fn upgrader_image(&self, kubernetes_version: &str) -> Result<String> {
        let config_map: ConfigMap = self
            .client
            .get(&ObjectKey::new(SYSTEM_NAMESPACE, UPGRADER_CONFIG_MAP))
            .await?;
        let data = config_map.data.unwrap_or_default();
        if data.is_empty() {
            return Err(Error::Validation(format!(
                "upgrader config map {UPGRADER_CONFIG_MAP} is empty"
            )));
        }
        data.get(kubernetes_version).cloned().ok_or_else(|| {
            Error::Validation(format!(
                "upgrader image corresponding to EKS Distro version {kubernetes_version} not found in the config map"
            ))
        })
    }
}

#[async_trait]
impl<C, R, B> Reconciler for NodeUpgradeReconciler<C, R, B>
where
    C: ObjectClient,
    R: RemoteClientRegistry,
    B: UpgraderPodBuilder,
{
    type Object = NodeUpgrade;
    const NAME: &'static str = "nodeupgrade";

    #[instrument(skip_all, fields(node_upgrade = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let mut node_upgrade: NodeUpgrade = self.client.get(key).await?;

        let machine_ref = &node_upgrade.spec.machine;
        let machine_key = ObjectKey::new(machine_ref.namespace_or(&key.namespace), &machine_ref.name);
        let machine = get_opt::<Machine, _>(&self.client, &machine_key).await?;
        if is_deleting(&node_upgrade) && machine.as_ref().and_then(Machine::node_name).is_none() {
            // Without a node there is no workload cluster Pod left to clean up.
            return self.release_orphan(node_upgrade, &machine_key).await;
        }
        let machine = machine.ok_or_else(|| Error::not_found::<Machine>(&machine_key.name))?;

        let cluster = ObjectKey::new(&machine_key.namespace, &machine.spec.cluster_name);
        let remote = self
            .registry
            .get_client(&cluster)
            .await
            .with_context(|| format!("getting remote client for cluster {cluster}"))?;

        let node_name = machine
            .node_name()
            .ok_or_else(|| Error::Validation(format!("machine {} is missing nodeRef", machine_key.name)))?
            .to_string();

        let mut helper = PatchHelper::new(&node_upgrade)?;

        if is_deleting(&node_upgrade) {
            let result = self
                .reconcile_delete(&remote, &mut node_upgrade, &node_name)
                .await;
            let patched = helper.patch(&self.client, &node_upgrade).await;
            return with_patch_result(result, patched);
        }

        if add_finalizer(&mut node_upgrade, NODE_UPGRADE_FINALIZER) {
            helper.checkpoint(&self.client, &mut node_upgrade).await?;
        }

        if node_upgrade.is_completed() {
            debug!("Node upgrade already completed");
            return Ok(Action::await_change());
        }

        let result = self
            .reconcile_upgrade(&remote, &mut node_upgrade, &node_name)
            .await;
        let patched = helper.patch(&self.client, &node_upgrade).await;
        with_patch_result(result, patched)
    }
}
