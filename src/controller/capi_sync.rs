//! Cluster API bookkeeping around an in-place upgrade.
//!
//! An in-place upgrade changes nodes without CAPI rolling them, so the CAPI
//! objects describing those nodes have to be brought in line by hand once a
//! node is done:
//! - the Machine gets the new version and, on the control plane, the
//!   kubeadm ClusterConfiguration annotation
//! - the Machine's KubeadmConfig and infrastructure machine are synced with
//!   the KubeadmControlPlane spec
//! - the current MachineSet of a MachineDeployment gets the new template
//!
//! MachineHealthChecks are paused for the length of the upgrade so that
//! nodes going through a restart are not remediated.
//!
//! The desired specs travel on the upgrade group as base64-encoded JSON,
//! captured when the upgrade was requested.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use kube::ResourceExt;
use kube::api::TypeMeta;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::info;

use crate::client::{ObjectClient, ObjectKey};
use crate::controller::common::PatchHelper;
use crate::controller::error::{Error, Result, ResultExt};
use crate::crd::ObjectReference;
use crate::crd::capi::{
    CLONED_FROM_NAME_ANNOTATION, DEPLOYMENT_NAME_LABEL, KubeadmConfig, KubeadmControlPlaneSpec,
    Machine, MachineDeployment, MachineHealthCheck, MachineSet, MachineTemplateMachineSpec,
    PAUSED_ANNOTATION, REVISION_ANNOTATION,
};

/// Encode a spec snapshot for an upgrade group.
pub fn encode_spec_data<T: Serialize>(spec: &T) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(spec)?))
}

/// Decode a spec snapshot written by [`encode_spec_data`].
pub fn decode_spec_data<T: DeserializeOwned>(data: &str) -> Result<T> {
    let raw = STANDARD
        .decode(data)
        .map_err(|e| Error::Validation(format!("decoding spec data with base64: {e}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Set the version of a Machine and optionally one annotation. Returns the
/// Machine as read. Writes nothing when both already match.
pub async fn update_machine<C: ObjectClient>(
    client: &C,
    key: &ObjectKey,
    version: &str,
    annotation: Option<(&str, String)>,
) -> Result<Machine> {
    let mut machine: Machine = client.get(key).await?;
    let helper = PatchHelper::new(&machine)?;
    let changed_version = machine.spec.version.as_deref() != Some(version);
    machine.spec.version = Some(version.to_string());
    if let Some((name, value)) = annotation {
        machine.annotations_mut().insert(name.to_string(), value);
    }
    helper.patch(client, &machine).await?;
    if changed_version {
        info!(machine = %key, version, "Updated machine version");
    }
    Ok(machine)
}

/// Replace the spec of `machine`'s KubeadmConfig with the control plane's.
///
/// Init and join configurations are only carried over when the existing
/// config already has them: a machine that joined keeps a join-only config.
pub async fn sync_kubeadm_config<C: ObjectClient>(
    client: &C,
    machine: &Machine,
    control_plane: &KubeadmControlPlaneSpec,
) -> Result<()> {
    let machine_name = machine.name_any();
    let Some(config_ref) = &machine.spec.bootstrap.config_ref else {
        return Err(Error::Validation(format!(
            "bootstrap config for machine {machine_name} is nil"
        )));
    };
    let key = ObjectKey::new(machine.namespace().unwrap_or_default(), &config_ref.name);
    let mut config: KubeadmConfig = client
        .get(&key)
        .await
        .with_context(|| format!("retrieving bootstrap config for machine {machine_name}"))?;
    let helper = PatchHelper::new(&config)?;

    let mut spec = control_plane.kubeadm_config_spec.clone().unwrap_or_default();
    if config.spec.init_configuration.is_none() {
        spec.init_configuration = None;
    }
    if config.spec.join_configuration.is_none() {
        spec.join_configuration = None;
    }
    config.spec = spec;

    helper.patch(client, &config).await.with_context(|| {
        format!("patching KubeadmConfig {} for Machine {machine_name}", key.name)
    })?;
    info!(kubeadm_config = %key, "Synced kubeadm config with control plane");
    Ok(())
}

/// Point the cloned-from-name annotation of `machine`'s infrastructure
/// machine at the control plane's current infrastructure template.
pub async fn sync_infra_machine<C: ObjectClient>(
    client: &C,
    machine: &Machine,
    control_plane: &KubeadmControlPlaneSpec,
) -> Result<()> {
    let machine_name = machine.name_any();
    let infra_ref = machine.spec.infrastructure_ref.as_ref().ok_or_else(|| {
        Error::Validation(format!("infrastructure ref for machine {machine_name} is nil"))
    })?;
    let type_meta = type_meta_of(infra_ref).ok_or_else(|| {
        Error::Validation(format!(
            "infrastructure ref for machine {machine_name} has no apiVersion or kind"
        ))
    })?;
    let template = control_plane
        .machine_template
        .as_ref()
        .map(|t| t.infrastructure_ref.name.clone())
        .ok_or_else(|| {
            Error::Validation(
                "KubeadmControlPlane spec has no machine template infrastructure ref".to_string(),
            )
        })?;

    let namespace = machine.namespace().unwrap_or_default();
    let key = ObjectKey::new(infra_ref.namespace_or(&namespace), &infra_ref.name);
    let patch = json!({
        "metadata": { "annotations": { CLONED_FROM_NAME_ANNOTATION: template } }
    });
    client
        .patch_dynamic(&type_meta, &key, &patch)
        .await
        .with_context(|| format!("updating spec for infra machine {}", infra_ref.name))?;
    info!(infra_machine = %key, template = %template, "Updated infra machine template annotation");
    Ok(())
}

fn type_meta_of(reference: &ObjectReference) -> Option<TypeMeta> {
    Some(TypeMeta {
        api_version: reference.api_version.clone()?,
        kind: reference.kind.clone()?,
    })
}

/// The MachineSet of `deployment` whose revision matches the deployment's.
pub async fn current_machine_set<C: ObjectClient>(
    client: &C,
    deployment: &MachineDeployment,
) -> Result<MachineSet> {
    let name = deployment.name_any();
    let selector = BTreeMap::from([(DEPLOYMENT_NAME_LABEL.to_string(), name.clone())]);
    let machine_sets: Vec<MachineSet> = client
        .list(&deployment.namespace().unwrap_or_default(), &selector)
        .await
        .with_context(|| format!("getting machine sets for {name}"))?;
    let Some(revision) = deployment.annotations().get(REVISION_ANNOTATION) else {
        return Err(Error::Validation(format!(
            "machineDeployment is missing {REVISION_ANNOTATION} annotation"
        )));
    };
    machine_sets
        .into_iter()
        .find(|ms| ms.annotations().get(REVISION_ANNOTATION) == Some(revision))
        .ok_or_else(|| {
            Error::Validation(format!(
                "couldn't find machine set with revision version {revision}"
            ))
        })
}

/// Write `spec` as the machine template of the deployment's current MachineSet.
pub async fn sync_machine_set<C: ObjectClient>(
    client: &C,
    deployment_key: &ObjectKey,
    spec: MachineTemplateMachineSpec,
) -> Result<()> {
    let deployment: MachineDeployment = client
        .get(deployment_key)
        .await
        .with_context(|| format!("getting MachineDeployment {}", deployment_key.name))?;
    let mut machine_set = current_machine_set(client, &deployment).await?;
    let helper = PatchHelper::new(&machine_set)?;
    machine_set.spec.template.spec = spec;
    helper
        .patch(client, &machine_set)
        .await
        .with_context(|| format!("updating spec for machineset {}", machine_set.name_any()))?;
    info!(machine_set = %ObjectKey::of(&machine_set), "Synced machine set template");
    Ok(())
}

async fn set_health_check_paused<C: ObjectClient>(
    client: &C,
    health_check: &MachineHealthCheck,
    paused: bool,
) -> Result<()> {
    let mut updated = health_check.clone();
    let helper = PatchHelper::new(&updated)?;
    if paused {
        updated
            .annotations_mut()
            .insert(PAUSED_ANNOTATION.to_string(), "true".to_string());
    } else {
        updated.annotations_mut().remove(PAUSED_ANNOTATION);
    }
    helper
        .patch(client, &updated)
        .await
        .with_context(|| "updating annotations for machine health check")
}

/// Stop CAPI from remediating machines while they are upgraded.
pub async fn pause_health_check<C: ObjectClient>(
    client: &C,
    health_check: &MachineHealthCheck,
) -> Result<()> {
    info!(health_check = %ObjectKey::of(health_check), "Pausing machine health check");
    set_health_check_paused(client, health_check, true).await
}

/// Undo [`pause_health_check`]. A no-op when the check is not paused.
pub async fn resume_health_check<C: ObjectClient>(
    client: &C,
    health_check: &MachineHealthCheck,
) -> Result<()> {
    if !health_check.annotations().contains_key(PAUSED_ANNOTATION) {
        return Ok(());
    }
    info!(health_check = %ObjectKey::of(health_check), "Resuming machine health check");
    set_health_check_paused(client, health_check, false).await
}
