//! In-place upgrade detectors.
//!
//! Watch `KubeadmControlPlane` and `MachineDeployment` objects for the
//! in-place-upgrade-needed annotation and turn it into an upgrade group.
//! The object's MachineHealthCheck is paused while the group exists, so CAPI
//! does not remediate machines whose nodes are being upgraded. The annotation
//! is removed once every replica reports updated; until then the detector
//! polls, since it does not watch the group it created.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::client::{
    ObjectClient, ObjectKey, ObjectKind, create_if_absent, delete_if_present, get_opt,
};
use crate::controller::capi_sync::{encode_spec_data, pause_health_check, resume_health_check};
use crate::controller::common::{PatchHelper, REQUEUE_INTERVAL, with_patch_result};
use crate::controller::error::{Error, Result, ResultExt};
use crate::controller::upgrade_group::UpgradeGroup;
use crate::crd::capi::{
    CONTROL_PLANE_NAME_LABEL, DEPLOYMENT_NAME_LABEL, KubeadmControlPlane, Machine,
    MachineDeployment, MachineHealthCheck,
};
use crate::crd::{
    ControlPlaneUpgrade, ControlPlaneUpgradeSpec, MachineDeploymentUpgrade,
    MachineDeploymentUpgradeSpec, ObjectReference, SYSTEM_NAMESPACE,
};
use crate::manager::Reconciler;
use crate::resources::{
    control_plane_health_check_name, control_plane_upgrade_name,
    machine_deployment_health_check_name, machine_deployment_upgrade_name, owner_reference,
    standard_labels,
};

/// Annotation requesting an in-place upgrade of a KubeadmControlPlane.
pub const KCP_IN_PLACE_UPGRADE_ANNOTATION: &str =
    "controlplane.clusters.x-k8s.io/in-place-upgrade-needed";

/// Annotation requesting an in-place upgrade of a MachineDeployment.
pub const MD_IN_PLACE_UPGRADE_ANNOTATION: &str =
    "machinedeployment.clusters.x-k8s.io/in-place-upgrade-needed";

/// Versions an upgrade group drives its machines to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeTarget {
    pub kubernetes_version: String,
    pub etcd_version: Option<String>,
}

/// A CAPI object whose machines are upgraded in place through an upgrade group.
pub trait UpgradeTrigger: ObjectKind + Resource<Scope = NamespaceResourceScope> {
    type Group: UpgradeGroup;

    /// Controller name used in logs and metrics.
    const CONTROLLER: &'static str;

    /// Annotation whose presence requests the upgrade.
    const ANNOTATION: &'static str;

    /// Label selecting the object's machines; its value is the object name.
    const MACHINE_LABEL: &'static str;

    fn group_name(&self) -> String;

    /// Name of the MachineHealthCheck covering the object's machines.
    fn health_check_name(&self) -> String;

    /// Desired replicas (CAPI defaults to 1).
    fn replicas(&self) -> i32;

    fn updated_replicas(&self) -> i32;

    /// Target versions, or a validation error when the object lacks them.
    fn target(&self) -> Result<UpgradeTarget>;

    /// The group upgrading `machines`, carrying a snapshot of the object's spec.
    fn build_group(
        &self,
        target: UpgradeTarget,
        machines: Vec<ObjectReference>,
    ) -> Result<Self::Group>;
}

/// Metadata of the group created for `owner`.
///
/// Groups live in the system namespace. Owner references cannot cross
/// namespaces, so an owner elsewhere gets none and its group is removed by
/// the group controller once ready.
fn group_metadata<T: UpgradeTrigger>(owner: &T) -> ObjectMeta {
    let owner_references = (owner.namespace().as_deref() == Some(SYSTEM_NAMESPACE))
        .then(|| vec![owner_reference(owner)]);
    ObjectMeta {
        name: Some(owner.group_name()),
        namespace: Some(SYSTEM_NAMESPACE.to_string()),
        labels: Some(standard_labels("upgrade-group")),
        owner_references,
        ..Default::default()
    }
}

fn reference_to<T: Resource<DynamicType = ()>>(obj: &T) -> ObjectReference {
    ObjectReference {
        api_version: Some(T::api_version(&()).to_string()),
        kind: Some(T::kind(&()).to_string()),
        name: obj.name_any(),
        namespace: obj.namespace(),
    }
}

impl UpgradeTrigger for KubeadmControlPlane {
    type Group = ControlPlaneUpgrade;
    const CONTROLLER: &'static str = "kubeadmcontrolplane";
    const ANNOTATION: &'static str = KCP_IN_PLACE_UPGRADE_ANNOTATION;
    const MACHINE_LABEL: &'static str = CONTROL_PLANE_NAME_LABEL;

    fn group_name(&self) -> String {
        control_plane_upgrade_name(&self.name_any())
    }

    fn health_check_name(&self) -> String {
        control_plane_health_check_name(&self.name_any())
    }

    fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    fn updated_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.updated_replicas)
            .unwrap_or_default()
    }

    fn target(&self) -> Result<UpgradeTarget> {
        let etcd_version = self.etcd_image_tag().ok_or_else(|| {
            Error::Validation("unable to retrieve etcd version from KubeadmControlPlane".to_string())
        })?;
        Ok(UpgradeTarget {
            kubernetes_version: self.spec.version.clone(),
            etcd_version: Some(etcd_version.to_string()),
        })
    }

    fn build_group(
        &self,
        target: UpgradeTarget,
        machines: Vec<ObjectReference>,
    ) -> Result<ControlPlaneUpgrade> {
        Ok(ControlPlaneUpgrade {
            metadata: group_metadata(self),
            spec: ControlPlaneUpgradeSpec {
                control_plane: reference_to(self),
                machines_require_upgrade: machines,
                kubernetes_version: target.kubernetes_version,
                etcd_version: target.etcd_version.unwrap_or_default(),
                control_plane_spec_data: encode_spec_data(&self.spec)?,
            },
            status: None,
        })
    }
}

impl UpgradeTrigger for MachineDeployment {
    type Group = MachineDeploymentUpgrade;
    const CONTROLLER: &'static str = "machinedeployment";
    const ANNOTATION: &'static str = MD_IN_PLACE_UPGRADE_ANNOTATION;
    const MACHINE_LABEL: &'static str = DEPLOYMENT_NAME_LABEL;

    fn group_name(&self) -> String {
        machine_deployment_upgrade_name(&self.name_any())
    }

    fn health_check_name(&self) -> String {
        machine_deployment_health_check_name(&self.name_any())
    }

    fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    fn updated_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.updated_replicas)
            .unwrap_or_default()
    }

    fn target(&self) -> Result<UpgradeTarget> {
        let version = self.spec.template.spec.version.clone().ok_or_else(|| {
            Error::Validation(
                "unable to retrieve kubernetes version from MachineDeployment".to_string(),
            )
        })?;
        Ok(UpgradeTarget {
            kubernetes_version: version,
            etcd_version: None,
        })
    }

    fn build_group(
        &self,
        target: UpgradeTarget,
        machines: Vec<ObjectReference>,
    ) -> Result<MachineDeploymentUpgrade> {
        Ok(MachineDeploymentUpgrade {
            metadata: group_metadata(self),
            spec: MachineDeploymentUpgradeSpec {
                machine_deployment: reference_to(self),
                machines_require_upgrade: machines,
                kubernetes_version: target.kubernetes_version,
                machine_spec_data: encode_spec_data(&self.spec.template.spec)?,
            },
            status: None,
        })
    }
}

/// Reconciles an annotated CAPI object into its upgrade group.
pub struct InPlaceUpgradeDetector<T, C> {
    client: C,
    _trigger: std::marker::PhantomData<fn() -> T>,
}

/// Detector for `KubeadmControlPlane`.
pub type KubeadmControlPlaneReconciler<C> = InPlaceUpgradeDetector<KubeadmControlPlane, C>;

/// Detector for `MachineDeployment`.
pub type MachineDeploymentReconciler<C> = InPlaceUpgradeDetector<MachineDeployment, C>;

impl<T, C> InPlaceUpgradeDetector<T, C>
where
    T: UpgradeTrigger,
    C: ObjectClient,
{
    pub fn new(client: C) -> Self {
        Self {
            client,
            _trigger: std::marker::PhantomData,
        }
    }

    /// The object's MachineHealthCheck. A missing check is returned as is.
    async fn health_check(&self, obj: &T) -> Result<MachineHealthCheck> {
        let name = obj.health_check_name();
        match self.client.get(&ObjectKey::new(SYSTEM_NAMESPACE, &name)).await {
            Ok(health_check) => Ok(health_check),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => Err(e.context(format!("getting MachineHealthCheck {name}"))),
        }
    }

    async fn reconcile_trigger(&self, obj: &mut T) -> Result<Action> {
        if !obj.annotations().contains_key(T::ANNOTATION) {
            return Ok(Action::await_change());
        }

        let health_check = self.health_check(obj).await?;
        let group_key = ObjectKey::new(SYSTEM_NAMESPACE, obj.group_name());
        let group = get_opt::<T::Group, _>(&self.client, &group_key).await?;

        if obj.replicas() == obj.updated_replicas() {
            if group.as_ref().is_some_and(|g| g.progress().ready) {
                self.delete_group(&group_key).await?;
            }
            // The group may have deleted itself before this pass saw it ready.
            resume_health_check(&self.client, &health_check).await?;
            obj.annotations_mut().remove(T::ANNOTATION);
            info!(
                replicas = obj.replicas(),
                "All replicas updated, removing in-place upgrade annotation"
            );
            return Ok(Action::await_change());
        }

        match group {
            None => self.create_group(obj, &health_check).await?,
            Some(group) if group.progress().ready => {
                self.delete_group(&group_key).await?;
                resume_health_check(&self.client, &health_check).await?;
            }
            Some(_) => debug!(group = %group_key, "Upgrade in progress"),
        }
        Ok(Action::requeue(REQUEUE_INTERVAL))
    }

    async fn delete_group(&self, key: &ObjectKey) -> Result<()> {
        if delete_if_present::<T::Group, _>(&self.client, key)
            .await
            .with_context(|| "deleting upgrade group")?
        {
            info!(group = %key, "Upgrade group ready, deleted");
        }
        Ok(())
    }

    /// Machines of `obj` not yet at `version`, oldest first.
    async fn machines_to_upgrade(&self, obj: &T, version: &str) -> Result<Vec<ObjectReference>> {
        let selector = BTreeMap::from([(T::MACHINE_LABEL.to_string(), obj.name_any())]);
        let namespace = obj.namespace().unwrap_or_default();
        let mut machines: Vec<Machine> = self.client.list(&namespace, &selector).await?;
        machines.sort_by_key(|m| (m.meta().creation_timestamp.as_ref().map(|t| t.0), m.name_any()));

        Ok(machines
            .iter()
            .filter(|m| m.spec.version.as_deref() != Some(version))
            .map(reference_to)
            .collect())
    }

    async fn create_group(&self, obj: &T, health_check: &MachineHealthCheck) -> Result<()> {
        let target = obj.target()?;
        let machines = self
            .machines_to_upgrade(obj, &target.kubernetes_version)
            .await?;
        if machines.is_empty() {
            info!(
                version = %target.kubernetes_version,
                "All machines already at target version, no upgrade group needed"
            );
            return Ok(());
        }

        let count = machines.len();
        let group = obj
            .build_group(target, machines)
            .with_context(|| "generating upgrade group")?;
        pause_health_check(&self.client, health_check).await?;
        if create_if_absent(&self.client, &group).await? {
            info!(group = %ObjectKey::of(&group), machines = count, "Created upgrade group");
        }
        Ok(())
    }
}

#[async_trait]
impl<T, C> Reconciler for InPlaceUpgradeDetector<T, C>
where
    T: UpgradeTrigger,
    C: ObjectClient,
{
    type Object = T;
    const NAME: &'static str = T::CONTROLLER;
    // Annotation changes do not bump the generation.
    const GENERATION_FILTERED: bool = false;

    #[instrument(skip_all, fields(kind = %T::kind(&()), object = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let mut obj: T = self.client.get(key).await?;
        let helper = PatchHelper::new(&obj)?;
        let result = self.reconcile_trigger(&mut obj).await;
        let patched = helper.patch(&self.client, &obj).await;
        with_patch_result(result, patched)
    }
}
