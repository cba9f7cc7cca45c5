//! Kubernetes object access used by the reconcilers.
//!
//! Reconcilers are written against [`ObjectClient`] rather than `kube::Api`
//! directly. [`KubeObjectClient`] talks to an API server, while
//! `MemoryObjectClient` keeps objects in memory with the same semantics
//! for tests (behind the `test-util` feature). [`RemoteClientRegistry`]
//! hands out clients for workload clusters.

pub mod kube_api;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod remote;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::TypeMeta;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::Result;

pub use kube_api::KubeObjectClient;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryObjectClient;
pub use remote::{KubeconfigSecretRegistry, RemoteClientRegistry, StaticRegistry};

/// Namespace and name of an object. Cluster-scoped objects use an empty namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Key of an existing object.
    pub fn of<K: ::kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Bridges namespaced and cluster-scoped resources to a single `Api` constructor.
pub trait KubeScope {
    /// Whether objects of this scope live in a namespace.
    const NAMESPACED: bool;

    /// Build an `Api` for `K` addressing `namespace` when namespaced.
    fn api<K>(client: ::kube::Client, namespace: &str) -> ::kube::Api<K>
    where
        K: ::kube::Resource<Scope = Self, DynamicType = ()>;
}

impl KubeScope for NamespaceResourceScope {
    const NAMESPACED: bool = true;

    fn api<K>(client: ::kube::Client, namespace: &str) -> ::kube::Api<K>
    where
        K: ::kube::Resource<Scope = Self, DynamicType = ()>,
    {
        ::kube::Api::namespaced(client, namespace)
    }
}

impl KubeScope for ClusterResourceScope {
    const NAMESPACED: bool = false;

    fn api<K>(client: ::kube::Client, _namespace: &str) -> ::kube::Api<K>
    where
        K: ::kube::Resource<Scope = Self, DynamicType = ()>,
    {
        ::kube::Api::all(client)
    }
}

/// Bounds shared by every object type the clients handle.
pub trait ObjectKind:
    ::kube::Resource<DynamicType = (), Scope: KubeScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ObjectKind for K where
    K: ::kube::Resource<DynamicType = (), Scope: KubeScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Typed access to objects of a single cluster.
///
/// Errors are mapped into the controller taxonomy: missing objects return
/// `Error::NotFound`, duplicate creates `Error::AlreadyExists` and stale
/// `resourceVersion` preconditions `Error::Conflict`.
#[async_trait]
pub trait ObjectClient: Clone + Send + Sync + 'static {
    /// Read one object.
    async fn get<K: ObjectKind>(&self, key: &ObjectKey) -> Result<K>;

    /// List objects in `namespace` whose labels contain every `labels` pair.
    async fn list<K: ObjectKind>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    /// Create an object. Its namespace and name are taken from its metadata.
    async fn create<K: ObjectKind>(&self, obj: &K) -> Result<K>;

    /// Request deletion. Objects with finalizers stay readable until the
    /// last finalizer is removed.
    async fn delete<K: ObjectKind>(&self, key: &ObjectKey) -> Result<()>;

    /// Apply a JSON merge patch to the main resource. A
    /// `metadata.resourceVersion` in the patch acts as a precondition.
    async fn patch<K: ObjectKind>(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<K>;

    /// Apply a JSON merge patch to the status subresource.
    async fn patch_status<K: ObjectKind>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Apply a JSON merge patch to a namespaced object whose kind is only
    /// known at runtime, such as a provider's infrastructure machine.
    async fn patch_dynamic(
        &self,
        type_meta: &TypeMeta,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<()>;
}

/// Get an object, mapping NotFound to `None`.
pub async fn get_opt<K, C>(client: &C, key: &ObjectKey) -> Result<Option<K>>
where
    K: ObjectKind,
    C: ObjectClient,
{
    match client.get::<K>(key).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create an object, treating "already exists" as success.
pub async fn create_if_absent<K, C>(client: &C, obj: &K) -> Result<bool>
where
    K: ObjectKind,
    C: ObjectClient,
{
    match client.create(obj).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete an object, treating NotFound as success.
pub async fn delete_if_present<K, C>(client: &C, key: &ObjectKey) -> Result<bool>
where
    K: ObjectKind,
    C: ObjectClient,
{
    match client.delete::<K>(key).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
