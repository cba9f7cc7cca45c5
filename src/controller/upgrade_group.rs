//! Upgrade group controllers.
//!
//! `ControlPlaneUpgrade` and `MachineDeploymentUpgrade` share one reconciler,
//! generic over [`UpgradeGroup`]. A group rolls its machines one at a time:
//! it creates the `NodeUpgrade` of the first machine that has none, waits for
//! it to complete, then moves on. Machines past that frontier have no child
//! yet and count as not upgraded. Progress is recomputed from the children on
//! every pass and the CAPI objects of completed machines are synced. Once
//! every machine is upgraded the group deletes itself; its finalizer removes
//! the children first.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument};

use crate::client::{
    ObjectClient, ObjectKey, ObjectKind, create_if_absent, delete_if_present, get_opt,
};
use crate::controller::capi_sync::{
    decode_spec_data, sync_infra_machine, sync_kubeadm_config, sync_machine_set, update_machine,
};
use crate::controller::common::{
    PatchHelper, REQUEUE_INTERVAL, add_finalizer, is_deleting, remove_finalizer,
    with_patch_result,
};
use crate::controller::error::{Error, Result, ResultExt};
use crate::crd::capi::{
    KUBEADM_CLUSTER_CONFIGURATION_ANNOTATION, KubeadmControlPlaneSpec,
    MachineTemplateMachineSpec,
};
use crate::crd::{
    CONTROL_PLANE_UPGRADE_FINALIZER, ControlPlaneUpgrade, ControlPlaneUpgradeStatus,
    MACHINE_DEPLOYMENT_UPGRADE_FINALIZER, MachineDeploymentUpgrade,
    MachineDeploymentUpgradeStatus, NodeUpgrade, NodeUpgradeSpec, ObjectReference,
};
use crate::health::HealthState;
use crate::manager::Reconciler;
use crate::resources::{node_upgrade_name, owner_reference, standard_labels};

/// Aggregated progress of an upgrade group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupProgress {
    pub upgraded: i64,
    pub require_upgrade: i64,
    pub ready: bool,
}

impl GroupProgress {
    /// Progress given the completion flag of every child, one per machine.
    pub fn from_children(completed: &[bool]) -> Self {
        let upgraded = completed.iter().filter(|done| **done).count() as i64;
        let require_upgrade = completed.len() as i64;
        Self {
            upgraded,
            require_upgrade,
            ready: upgraded == require_upgrade,
        }
    }
}

/// A resource upgrading a list of machines through `NodeUpgrade` children.
#[async_trait]
pub trait UpgradeGroup: ObjectKind + Resource<Scope = NamespaceResourceScope> {
    /// Controller name used in logs and metrics.
    const CONTROLLER: &'static str;

    /// Finalizer held until the children are deleted.
    const FINALIZER: &'static str;

    /// Machines to upgrade, in order.
    fn machines(&self) -> &[ObjectReference];

    fn kubernetes_version(&self) -> &str;

    /// etcd version handed to the first node. `None` for worker groups.
    fn etcd_version(&self) -> Option<&str>;

    fn progress(&self) -> GroupProgress;

    fn set_progress(&mut self, progress: GroupProgress, observed_generation: Option<i64>);

    /// Bring the CAPI objects of `machine` in line once its node is upgraded.
    /// Runs on every pass and must be idempotent.
    async fn sync_machine<C: ObjectClient>(&self, client: &C, machine: &ObjectReference)
    -> Result<()>;

    /// Runs once every machine is upgraded, before the group is marked ready.
    async fn sync_ready<C: ObjectClient>(&self, _client: &C) -> Result<()> {
        Ok(())
    }
}

fn machine_key<G: UpgradeGroup>(group: &G, machine: &ObjectReference) -> ObjectKey {
    let namespace = group.namespace().unwrap_or_default();
    ObjectKey::new(machine.namespace_or(&namespace), &machine.name)
}

#[async_trait]
impl UpgradeGroup for ControlPlaneUpgrade {
    const CONTROLLER: &'static str = "controlplaneupgrade";
    const FINALIZER: &'static str = CONTROL_PLANE_UPGRADE_FINALIZER;

    fn machines(&self) -> &[ObjectReference] {
        &self.spec.machines_require_upgrade
    }

    fn kubernetes_version(&self) -> &str {
        &self.spec.kubernetes_version
    }

    fn etcd_version(&self) -> Option<&str> {
        Some(&self.spec.etcd_version)
    }

    fn progress(&self) -> GroupProgress {
        self.status
            .as_ref()
            .map(|s| GroupProgress {
                upgraded: s.upgraded,
                require_upgrade: s.require_upgrade,
                ready: s.ready,
            })
            .unwrap_or_default()
    }

    fn set_progress(&mut self, progress: GroupProgress, observed_generation: Option<i64>) {
        self.status = Some(ControlPlaneUpgradeStatus {
            upgraded: progress.upgraded,
            require_upgrade: progress.require_upgrade,
            ready: progress.ready,
            observed_generation,
        });
    }

    async fn sync_machine<C: ObjectClient>(
        &self,
        client: &C,
        machine: &ObjectReference,
    ) -> Result<()> {
        let control_plane: KubeadmControlPlaneSpec =
            decode_spec_data(&self.spec.control_plane_spec_data)
                .with_context(|| "decoding control plane spec data")?;
        let cluster_configuration = serde_json::to_string(
            &control_plane
                .kubeadm_config_spec
                .as_ref()
                .and_then(|k| k.cluster_configuration.as_ref()),
        )?;

        let machine = update_machine(
            client,
            &machine_key(self, machine),
            &self.spec.kubernetes_version,
            Some((KUBEADM_CLUSTER_CONFIGURATION_ANNOTATION, cluster_configuration)),
        )
        .await?;
        sync_kubeadm_config(client, &machine, &control_plane)
            .await
            .with_context(|| "updating kubeadm config")?;
        sync_infra_machine(client, &machine, &control_plane)
            .await
            .with_context(|| "updating infra machine")
    }
}

#[async_trait]
impl UpgradeGroup for MachineDeploymentUpgrade {
    const CONTROLLER: &'static str = "machinedeploymentupgrade";
    const FINALIZER: &'static str = MACHINE_DEPLOYMENT_UPGRADE_FINALIZER;

    fn machines(&self) -> &[ObjectReference] {
        &self.spec.machines_require_upgrade
    }

    fn kubernetes_version(&self) -> &str {
        &self.spec.kubernetes_version
    }

    fn etcd_version(&self) -> Option<&str> {
        None
    }

    fn progress(&self) -> GroupProgress {
        self.status
            .as_ref()
            .map(|s| GroupProgress {
                upgraded: s.upgraded,
                require_upgrade: s.require_upgrade,
                ready: s.ready,
            })
            .unwrap_or_default()
    }

    fn set_progress(&mut self, progress: GroupProgress, observed_generation: Option<i64>) {
        self.status = Some(MachineDeploymentUpgradeStatus {
            upgraded: progress.upgraded,
            require_upgrade: progress.require_upgrade,
            ready: progress.ready,
            observed_generation,
        });
    }

    async fn sync_machine<C: ObjectClient>(
        &self,
        client: &C,
        machine: &ObjectReference,
    ) -> Result<()> {
        update_machine(
            client,
            &machine_key(self, machine),
            &self.spec.kubernetes_version,
            None,
        )
        .await
        .map(|_| ())
    }

    async fn sync_ready<C: ObjectClient>(&self, client: &C) -> Result<()> {
        let spec: MachineTemplateMachineSpec = decode_spec_data(&self.spec.machine_spec_data)
            .with_context(|| "decoding machine spec data")?;
        let deployment = &self.spec.machine_deployment;
        let namespace = self.namespace().unwrap_or_default();
        let key = ObjectKey::new(deployment.namespace_or(&namespace), &deployment.name);
        sync_machine_set(client, &key, spec).await
    }
}

/// The `NodeUpgrade` a group creates for `machine`.
///
/// Only the first machine of a control-plane group coordinates the etcd
/// upgrade and carries the etcd version.
pub fn build_node_upgrade<G: UpgradeGroup>(
    group: &G,
    machine: &ObjectReference,
    first: bool,
) -> NodeUpgrade {
    let namespace = group.namespace().unwrap_or_default();
    let etcd_version = group
        .etcd_version()
        .filter(|_| first)
        .map(str::to_string);
    let mut machine = machine.clone();
    machine.namespace.get_or_insert_with(|| namespace.clone());

    NodeUpgrade {
        metadata: ObjectMeta {
            name: Some(node_upgrade_name(&machine.name)),
            namespace: Some(namespace),
            labels: Some(standard_labels("node-upgrade")),
            owner_references: Some(vec![owner_reference(group)]),
            ..Default::default()
        },
        spec: NodeUpgradeSpec {
            first_node_to_be_upgraded: etcd_version.is_some(),
            machine,
            kubernetes_version: group.kubernetes_version().to_string(),
            etcd_version,
        },
        status: None,
    }
}

/// Reconciles an upgrade group kind.
pub struct UpgradeGroupReconciler<G, C> {
    client: C,
    health_state: Option<Arc<HealthState>>,
    _group: std::marker::PhantomData<fn() -> G>,
}

/// Reconciler for `ControlPlaneUpgrade`.
pub type ControlPlaneUpgradeReconciler<C> = UpgradeGroupReconciler<ControlPlaneUpgrade, C>;

/// Reconciler for `MachineDeploymentUpgrade`.
pub type MachineDeploymentUpgradeReconciler<C> =
    UpgradeGroupReconciler<MachineDeploymentUpgrade, C>;

impl<G, C> UpgradeGroupReconciler<G, C>
where
    G: UpgradeGroup,
    C: ObjectClient,
{
    pub fn new(client: C) -> Self {
        Self {
            client,
            health_state: None,
            _group: std::marker::PhantomData,
        }
    }

    /// Report group progress through `health_state` metrics.
    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    fn report_progress(&self, group: &G, progress: Option<GroupProgress>) {
        let Some(health) = &self.health_state else {
            return;
        };
        let namespace = group.namespace().unwrap_or_default();
        let kind = G::kind(&());
        match progress {
            Some(p) => health.metrics.set_group_progress(
                &kind,
                &namespace,
                &group.name_any(),
                p.upgraded,
                p.require_upgrade,
            ),
            None => health
                .metrics
                .remove_group(&kind, &namespace, &group.name_any()),
        }
    }

    async fn reconcile_delete(&self, group: &mut G) -> Result<Action> {
        let namespace = group.namespace().unwrap_or_default();
        for machine in group.machines() {
            let key = ObjectKey::new(&namespace, node_upgrade_name(&machine.name));
            if delete_if_present::<NodeUpgrade, _>(&self.client, &key).await? {
                info!(node_upgrade = %key, "Deleted node upgrade");
            }
        }
        remove_finalizer(group, G::FINALIZER);
        self.report_progress(group, None);
        Ok(Action::await_change())
    }

    /// The child of every machine, `None` past the roll-out frontier.
    ///
    /// Roll-out is serial, so children form a prefix of the machine list. A
    /// machine without a child ahead of one that has a child should have
    /// been upgraded already; that gap is an error.
    async fn children(&self, group: &G, namespace: &str) -> Result<Vec<Option<NodeUpgrade>>> {
        let mut children = Vec::with_capacity(group.machines().len());
        for machine in group.machines() {
            let key = ObjectKey::new(namespace, node_upgrade_name(&machine.name));
            let child = get_opt::<NodeUpgrade, _>(&self.client, &key)
                .await
                .with_context(|| format!("getting node upgrader for machine {}", machine.name))?;
            children.push(child);
        }

        let last = children.iter().rposition(Option::is_some).unwrap_or(0);
        let gap = children
            .iter()
            .zip(group.machines())
            .take(last)
            .find(|(child, _)| child.is_none());
        if let Some((_, machine)) = gap {
            return Err(
                Error::not_found::<NodeUpgrade>(&node_upgrade_name(&machine.name))
                    .context(format!("getting node upgrader for machine {}", machine.name)),
            );
        }
        Ok(children)
    }

    /// Create the next missing `NodeUpgrade`, unless an earlier one is still
    /// running. The created child is recorded in `children`.
    async fn roll_out(&self, group: &G, children: &mut [Option<NodeUpgrade>]) -> Result<()> {
        for (idx, (machine, slot)) in group.machines().iter().zip(children.iter_mut()).enumerate() {
            match slot {
                None => {
                    let child = build_node_upgrade(group, machine, idx == 0);
                    if create_if_absent(&self.client, &child).await? {
                        info!(
                            machine = %machine.name,
                            first = child.spec.first_node_to_be_upgraded,
                            "Created node upgrade"
                        );
                    }
                    *slot = Some(child);
                    return Ok(());
                }
                Some(child) if !child.is_completed() => {
                    debug!(machine = %machine.name, "Waiting for node upgrade");
                    return Ok(());
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn reconcile_upgrade(&self, group: &mut G) -> Result<Action> {
        let namespace = group.namespace().unwrap_or_default();
        let mut children = self.children(group, &namespace).await?;
        if !group.progress().ready {
            self.roll_out(group, &mut children).await?;
        }

        let completed: Vec<bool> = children
            .iter()
            .map(|child| child.as_ref().is_some_and(NodeUpgrade::is_completed))
            .collect();
        for (machine, done) in group.machines().iter().zip(&completed) {
            if *done {
                group.sync_machine(&self.client, machine).await?;
            }
        }

        let progress = GroupProgress::from_children(&completed);
        if progress.ready {
            group.sync_ready(&self.client).await?;
        }

        let generation = group.meta().generation;
        group.set_progress(progress, generation);
        self.report_progress(group, Some(progress));
        debug!(
            upgraded = progress.upgraded,
            require_upgrade = progress.require_upgrade,
            "Computed upgrade progress"
        );

        if progress.ready {
            Ok(Action::await_change())
        } else {
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
    }
}

#[async_trait]
impl<G, C> Reconciler for UpgradeGroupReconciler<G, C>
where
    G: UpgradeGroup,
    C: ObjectClient,
{
    type Object = G;
    const NAME: &'static str = G::CONTROLLER;

    #[instrument(skip_all, fields(kind = %G::kind(&()), group = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let mut group: G = self.client.get(key).await?;
        let mut helper = PatchHelper::new(&group)?;

        if is_deleting(&group) {
            let result = self.reconcile_delete(&mut group).await;
            let patched = helper.patch(&self.client, &group).await;
            return with_patch_result(result, patched);
        }

        if add_finalizer(&mut group, G::FINALIZER) {
            helper.checkpoint(&self.client, &mut group).await?;
        }

        let result = self.reconcile_upgrade(&mut group).await;
        let patched = helper.patch(&self.client, &group).await;
        let action = with_patch_result(result, patched)?;

        if group.progress().ready {
            delete_if_present::<G, _>(&self.client, key).await?;
            info!("All machines upgraded, deleting upgrade group");
            return Ok(Action::await_change());
        }
        Ok(action)
    }
}
