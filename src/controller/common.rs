//! Shared controller helpers.
//!
//! Finalizer manipulation and the patch-on-exit helper used by every
//! reconciler: the object is snapshotted when fetched, mutated in memory
//! during the reconcile, and the difference is written back once on exit.

use std::time::Duration;

use kube::{Resource, ResourceExt};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::client::{ObjectClient, ObjectKey, ObjectKind};
use crate::controller::error::{Error, Result};

/// Requeue interval while an upgrade is in flight. Children are polled
/// rather than watched.
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

/// Metadata fields the patch helper writes back. Everything else in
/// `metadata` is owned by the API server.
const PATCHED_METADATA: [&str; 4] = ["finalizers", "annotations", "labels", "ownerReferences"];

/// Whether `obj` carries `finalizer`.
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add a finalizer to the in-memory object. Returns true if it was added.
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove a finalizer from the in-memory object. Returns true if it was present.
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Whether deletion of `obj` has been requested.
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// JSON merge patch turning `before` into `after`, or `None` when equal.
///
/// Keys missing from `after` are nulled so they are removed on the server.
/// Arrays and scalars are replaced wholesale.
pub fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                let old_value = old.get(key).unwrap_or(&Value::Null);
                if let Some(diff) = merge_diff(old_value, new_value) {
                    patch.insert(key.clone(), diff);
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(after.clone()),
    }
}

/// Snapshot of an object taken before reconciling, used to write back only
/// what the reconcile changed.
pub struct PatchHelper {
    key: ObjectKey,
    before: Value,
}

impl PatchHelper {
    /// Snapshot `obj`.
    pub fn new<K: ObjectKind>(obj: &K) -> Result<Self> {
        Ok(Self {
            key: ObjectKey::of(obj),
            before: serde_json::to_value(obj)?,
        })
    }

    fn metadata_patch(&self, after: &Value) -> Option<Value> {
        let mut meta = Map::new();
        for field in PATCHED_METADATA {
            let old = self
                .before
                .pointer(&format!("/metadata/{field}"))
                .unwrap_or(&Value::Null);
            let new = after
                .pointer(&format!("/metadata/{field}"))
                .unwrap_or(&Value::Null);
            if let Some(diff) = merge_diff(old, new) {
                meta.insert(field.to_string(), diff);
            }
        }
        if meta.is_empty() {
            return None;
        }
        // Optimistic lock: a concurrent writer turns this into a Conflict.
        if let Some(rv) = self.before.pointer("/metadata/resourceVersion") {
            meta.insert("resourceVersion".to_string(), rv.clone());
        }
        Some(json!({ "metadata": meta }))
    }

    fn spec_patch(&self, after: &Value) -> Option<Value> {
        let old = self.before.get("spec").unwrap_or(&Value::Null);
        let new = after.get("spec").unwrap_or(&Value::Null);
        merge_diff(old, new)
    }

    fn status_patch(&self, after: &Value) -> Option<Value> {
        let old = self.before.get("status").unwrap_or(&Value::Null);
        let new = after.get("status").unwrap_or(&Value::Null);
        merge_diff(old, new).map(|diff| json!({ "status": diff }))
    }

    /// Write the changes made to `obj` since the snapshot.
    ///
    /// Metadata and spec go in one resourceVersion-checked patch, status in
    /// a second one. Status is skipped once the object is being deleted and
    /// holds no finalizers, since it no longer exists on the server. Both
    /// writes are attempted; failures are aggregated.
    pub async fn patch<K, C>(&self, client: &C, obj: &K) -> Result<()>
    where
        K: ObjectKind,
        C: ObjectClient,
    {
        let after = serde_json::to_value(obj)?;
        let mut errors = Vec::new();

        let mut main = Map::new();
        if let Some(Value::Object(meta)) = self.metadata_patch(&after) {
            main.extend(meta);
        }
        if let Some(spec) = self.spec_patch(&after) {
            main.insert("spec".to_string(), spec);
        }
        if !main.is_empty() {
            debug!(object = %self.key, "Patching object");
            if let Err(e) = client.patch::<K>(&self.key, &Value::Object(main)).await {
                errors.push(e);
            }
        }

        let gone = is_deleting(obj) && obj.finalizers().is_empty();
        if !gone {
            if let Some(status) = self.status_patch(&after) {
                debug!(object = %self.key, "Patching status");
                if let Err(e) = client.patch_status::<K>(&self.key, &status).await {
                    errors.push(e);
                }
            }
        }

        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Write pending changes now and re-snapshot, so work that follows
    /// starts from persisted state.
    pub async fn checkpoint<K, C>(&mut self, client: &C, obj: &mut K) -> Result<()>
    where
        K: ObjectKind,
        C: ObjectClient,
    {
        self.patch(client, obj).await?;
        let fresh: K = client.get(&self.key).await?;
        obj.meta_mut().resource_version = fresh.meta().resource_version.clone();
        self.before = serde_json::to_value(&*obj)?;
        Ok(())
    }
}

/// Combine the reconcile outcome with the outcome of the exit patch.
pub fn with_patch_result<T>(result: Result<T>, patch: Result<()>) -> Result<T> {
    match (result, patch) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
        (Err(err), Err(patch_err)) => Err(err.combine(patch_err)),
    }
}
