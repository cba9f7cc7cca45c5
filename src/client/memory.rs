//! In-memory API server for tests.
//!
//! Objects are stored as JSON and follow API server semantics closely enough
//! for the reconcilers to be exercised end to end:
//! - JSON merge patches (RFC 7386) with `metadata.resourceVersion` preconditions
//! - `status` only changes through [`ObjectClient::patch_status`]
//! - deletion of an object with finalizers only sets `deletionTimestamp`; the
//!   object disappears once its last finalizer is removed
//! - label-selector listing
//!
//! Failures can be injected per verb and kind to drive error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::api::TypeMeta;
use serde_json::{Map, Value, json};

use super::kube_api::{api_resource, dynamic_resource_name};
use super::{KubeScope, ObjectClient, ObjectKey, ObjectKind};
use crate::controller::error::{Error, Result, qualified_resource};

/// API verbs failures can be injected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Delete,
    Patch,
    PatchStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct StoreKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<StoreKey, Value>,
    resource_version: u64,
    failures: HashMap<(Verb, String), String>,
}

impl Store {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Shared in-memory object store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryObjectClient {
    store: Arc<Mutex<Store>>,
}

impl std::fmt::Debug for MemoryObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectClient").finish_non_exhaustive()
    }
}

fn dynamic_store_key(type_meta: &TypeMeta, key: &ObjectKey) -> StoreKey {
    StoreKey {
        api_version: type_meta.api_version.clone(),
        kind: type_meta.kind.clone(),
        namespace: key.namespace.clone(),
        name: key.name.clone(),
    }
}

fn store_key<K: ObjectKind>(namespace: &str, name: &str) -> StoreKey {
    StoreKey {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        namespace: if <K::Scope as KubeScope>::NAMESPACED {
            namespace.to_string()
        } else {
            String::new()
        },
        name: name.to_string(),
    }
}

/// Apply an RFC 7386 merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn finalizers_empty(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_none_or(|f| f.is_empty())
}

fn is_deleting(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp")
        .is_some_and(|v| !v.is_null())
}

fn labels_match(obj: &Value, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| {
        obj.pointer("/metadata/labels")
            .and_then(|labels| labels.get(k))
            .and_then(Value::as_str)
            == Some(v.as_str())
    })
}

fn set_meta(obj: &mut Value, field: &str, value: Value) {
    merge_patch(obj, &json!({ "metadata": { field: value } }));
}

/// Current time at second precision, as the API server stamps metadata.
fn now_rfc3339() -> String {
    let now = jiff::Timestamp::now();
    jiff::Timestamp::from_second(now.as_second())
        .unwrap_or(now)
        .to_string()
}

fn decode<K: ObjectKind>(value: &Value) -> Result<K> {
    Ok(serde_json::from_value(value.clone())?)
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        // A panicking test thread poisons the lock; the data is still usable.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn injected<K: ObjectKind>(store: &Store, verb: Verb) -> Result<()> {
        Self::injected_kind(store, verb, &K::kind(&()))
    }

    fn injected_kind(store: &Store, verb: Verb, kind: &str) -> Result<()> {
        match store.failures.get(&(verb, kind.to_string())) {
            Some(message) => Err(Error::Validation(message.clone())),
            None => Ok(()),
        }
    }

    /// Store an object as-is, including its status. Replaces any existing
    /// object with the same key.
    pub fn insert<K: ObjectKind>(&self, obj: K) -> Result<()> {
        let mut value = serde_json::to_value(&obj)?;
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut store = self.lock();
        let rv = store.next_resource_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        if value.pointer("/metadata/uid").is_none() {
            set_meta(&mut value, "uid", json!(format!("uid-{name}")));
        }
        store
            .objects
            .insert(store_key::<K>(&namespace, &name), value);
        Ok(())
    }

    /// Store a raw object of any kind. `apiVersion`, `kind` and
    /// `metadata.name` are taken from the value itself.
    pub fn insert_value(&self, mut value: Value) -> Result<()> {
        let field = |path: &str| {
            value
                .pointer(path)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let skey = StoreKey {
            api_version: field("/apiVersion"),
            kind: field("/kind"),
            namespace: field("/metadata/namespace"),
            name: field("/metadata/name"),
        };
        let mut store = self.lock();
        let rv = store.next_resource_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        store.objects.insert(skey, value);
        Ok(())
    }

    /// Raw JSON of a stored object of any kind.
    pub fn get_value(&self, type_meta: &TypeMeta, key: &ObjectKey) -> Option<Value> {
        self.lock()
            .objects
            .get(&dynamic_store_key(type_meta, key))
            .cloned()
    }

    /// Make every `verb` call on objects of `kind` fail with `message`,
    /// including kinds only known at runtime.
    pub fn fail_kind(&self, kind: &str, verb: Verb, message: &str) {
        self.lock()
            .failures
            .insert((verb, kind.to_string()), message.to_string());
    }

    /// Whether an object exists.
    pub fn contains<K: ObjectKind>(&self, key: &ObjectKey) -> bool {
        self.lock()
            .objects
            .contains_key(&store_key::<K>(&key.namespace, &key.name))
    }

    /// Number of stored objects of kind `K` across namespaces.
    pub fn count<K: ObjectKind>(&self) -> usize {
        let api_version = K::api_version(&()).to_string();
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .keys()
            .filter(|k| k.api_version == api_version && k.kind == kind)
            .count()
    }

    /// Make every `verb` call on kind `K` fail with `message`.
    pub fn fail<K: ObjectKind>(&self, verb: Verb, message: &str) {
        self.lock()
            .failures
            .insert((verb, K::kind(&()).to_string()), message.to_string());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    fn apply_patch<K: ObjectKind>(
        &self,
        key: &ObjectKey,
        patch: &Value,
        status_only: bool,
    ) -> Result<K> {
        let mut store = self.lock();
        Self::injected::<K>(
            &store,
            if status_only {
                Verb::PatchStatus
            } else {
                Verb::Patch
            },
        )?;
        let skey = store_key::<K>(&key.namespace, &key.name);
        let current = store
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| Error::not_found::<K>(&key.name))?;

        let mut patch = patch.clone();
        if let Some(expected) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            let actual = current
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if expected != actual {
                return Err(Error::Conflict {
                    resource: qualified_resource::<K>(),
                    name: key.name.clone(),
                    message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
                });
            }
        }
        if let Some(meta) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }

        let mut updated = current.clone();
        if status_only {
            if let Some(status) = patch.get("status") {
                merge_patch(&mut updated, &json!({ "status": status }));
            }
        } else {
            if let Some(obj) = patch.as_object_mut() {
                obj.remove("status");
            }
            merge_patch(&mut updated, &patch);
            let spec_changed = updated.get("spec") != current.get("spec");
            if spec_changed {
                let generation = current
                    .pointer("/metadata/generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                set_meta(&mut updated, "generation", json!(generation + 1));
            }
        }

        let rv = store.next_resource_version();
        set_meta(&mut updated, "resourceVersion", json!(rv));
        let result = decode::<K>(&updated)?;
        if is_deleting(&updated) && finalizers_empty(&updated) {
            store.objects.remove(&skey);
        } else {
            store.objects.insert(skey, updated);
        }
        Ok(result)
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn get<K: ObjectKind>(&self, key: &ObjectKey) -> Result<K> {
        let store = self.lock();
        Self::injected::<K>(&store, Verb::Get)?;
        match store
            .objects
            .get(&store_key::<K>(&key.namespace, &key.name))
        {
            Some(value) => decode(value),
            None => Err(Error::not_found::<K>(&key.name)),
        }
    }

    async fn list<K: ObjectKind>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let store = self.lock();
        Self::injected::<K>(&store, Verb::List)?;
        let wanted = store_key::<K>(namespace, "");
        store
            .objects
            .iter()
            .filter(|(k, _)| {
                k.api_version == wanted.api_version
                    && k.kind == wanted.kind
                    && k.namespace == wanted.namespace
            })
            .filter(|(_, v)| labels_match(v, labels))
            .map(|(_, v)| decode(v))
            .collect()
    }

    async fn create<K: ObjectKind>(&self, obj: &K) -> Result<K> {
        let mut value = serde_json::to_value(obj)?;
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut store = self.lock();
        Self::injected::<K>(&store, Verb::Create)?;
        let skey = store_key::<K>(&namespace, &name);
        if store.objects.contains_key(&skey) {
            return Err(Error::AlreadyExists {
                resource: qualified_resource::<K>(),
                name,
            });
        }

        if let Some(obj) = value.as_object_mut() {
            obj.remove("status");
        }
        let rv = store.next_resource_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        set_meta(&mut value, "uid", json!(format!("uid-{name}-{rv}")));
        set_meta(&mut value, "generation", json!(1));
        if value.pointer("/metadata/creationTimestamp").is_none() {
            set_meta(
                &mut value,
                "creationTimestamp",
                json!(now_rfc3339()),
            );
        }
        let created = decode::<K>(&value)?;
        store.objects.insert(skey, value);
        Ok(created)
    }

    async fn delete<K: ObjectKind>(&self, key: &ObjectKey) -> Result<()> {
        let mut store = self.lock();
        Self::injected::<K>(&store, Verb::Delete)?;
        let skey = store_key::<K>(&key.namespace, &key.name);
        let Some(current) = store.objects.get(&skey).cloned() else {
            return Err(Error::not_found::<K>(&key.name));
        };

        if finalizers_empty(&current) {
            store.objects.remove(&skey);
            return Ok(());
        }
        if is_deleting(&current) {
            return Ok(());
        }

        let mut updated = current;
        let generation = updated
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let rv = store.next_resource_version();
        merge_patch(
            &mut updated,
            &json!({
                "metadata": {
                    "deletionTimestamp": now_rfc3339(),
                    "generation": generation + 1,
                    "resourceVersion": rv,
                }
            }),
        );
        store.objects.insert(skey, updated);
        Ok(())
    }

    async fn patch<K: ObjectKind>(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        self.apply_patch(key, patch, false)
    }

    async fn patch_status<K: ObjectKind>(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        self.apply_patch(key, patch, true)
    }

    async fn patch_dynamic(&self, type_meta: &TypeMeta, key: &ObjectKey, patch: &Value) -> Result<()> {
        let mut store = self.lock();
        Self::injected_kind(&store, Verb::Patch, &type_meta.kind)?;
        let skey = dynamic_store_key(type_meta, key);
        let Some(mut updated) = store.objects.get(&skey).cloned() else {
            return Err(Error::NotFound {
                resource: dynamic_resource_name(&api_resource(type_meta)),
                name: key.name.clone(),
            });
        };
        merge_patch(&mut updated, patch);
        let rv = store.next_resource_version();
        set_meta(&mut updated, "resourceVersion", json!(rv));
        store.objects.insert(skey, updated);
        Ok(())
    }
}
