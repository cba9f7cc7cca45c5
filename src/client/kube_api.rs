//! [`ObjectClient`] backed by a Kubernetes API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams, TypeMeta,
};
use kube::{Api, Client};

use super::{KubeScope, ObjectClient, ObjectKey, ObjectKind};
use crate::controller::error::{Error, Result, qualified_resource};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "inplace-upgrade-operator";

/// Object client for one cluster.
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
}

impl std::fmt::Debug for KubeObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectClient").finish_non_exhaustive()
    }
}

impl KubeObjectClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying kube client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn api<K: ObjectKind>(&self, namespace: &str) -> Api<K> {
        <K::Scope as KubeScope>::api(self.client.clone(), namespace)
    }
}

impl From<Client> for KubeObjectClient {
    fn from(client: Client) -> Self {
        Self::new(client)
    }
}

/// Map a kube error into the controller taxonomy.
fn map_err<K: ObjectKind>(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 404 => Error::not_found::<K>(name),
        kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                resource: qualified_resource::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(e) if e.code == 409 => Error::Conflict {
            resource: qualified_resource::<K>(),
            name: name.to_string(),
            message: e.message.clone(),
        },
        other => Error::Kube(other),
    }
}

/// Resolve the API resource of a kind known only at runtime. The plural is
/// derived from the kind, as kubebuilder does for CAPI providers.
pub fn api_resource(type_meta: &TypeMeta) -> ApiResource {
    let (group, version) = match type_meta.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", type_meta.api_version.as_str()),
    };
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &type_meta.kind))
}

/// `plural.group` of a runtime kind, as the API server names it in errors.
pub fn dynamic_resource_name(resource: &ApiResource) -> String {
    if resource.group.is_empty() {
        resource.plural.clone()
    } else {
        format!("{}.{}", resource.plural, resource.group)
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get<K: ObjectKind>(&self, key: &ObjectKey) -> Result<K> {
        self.api::<K>(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_err::<K>(e, &key.name))
    }

    async fn list<K: ObjectKind>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(labels));
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(Error::Kube)?;
        Ok(list.items)
    }

    async fn create<K: ObjectKind>(&self, obj: &K) -> Result<K> {
        let meta = obj.meta();
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        self.api::<K>(&namespace)
            .create(
                &PostParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                obj,
            )
            .await
            .map_err(|e| map_err::<K>(e, &name))
    }

    async fn delete<K: ObjectKind>(&self, key: &ObjectKey) -> Result<()> {
        self.api::<K>(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_err::<K>(e, &key.name))
    }

    async fn patch<K: ObjectKind>(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K> {
        self.api::<K>(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err::<K>(e, &key.name))
    }

    async fn patch_status<K: ObjectKind>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K> {
        self.api::<K>(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err::<K>(e, &key.name))
    }

    async fn patch_dynamic(
        &self,
        type_meta: &TypeMeta,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let resource = api_resource(type_meta);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &key.namespace, &resource);
        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::NotFound {
                resource: dynamic_resource_name(&resource),
                name: key.name.clone(),
            }),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
