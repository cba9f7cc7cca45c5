//! inplace-upgrade-operator library crate
//!
//! Controllers that upgrade Cluster API machines in place, the custom
//! resources they coordinate through, and the runtime that hosts them.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod leader;
pub mod manager;
pub mod resources;

pub use health::HealthState;
pub use manager::{Manager, Reconciler};

use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watcher configuration shared by every controller.
///
/// `any_semantic()` lets the initial list be served from the API server cache.
pub fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}
