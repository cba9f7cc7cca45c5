//! Provider dispatch for the top-level cluster reconciler.
//!
//! The cluster reconciler picks an infrastructure-specific implementation by
//! the kind of the cluster's datacenter config. Implementations live outside
//! this crate; the registry only maps kind strings to trait objects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;

use crate::client::ObjectKey;
use crate::controller::error::Result;

pub const VSPHERE_DATACENTER_KIND: &str = "VSphereDatacenterConfig";
pub const CLOUDSTACK_DATACENTER_KIND: &str = "CloudStackDatacenterConfig";
pub const NUTANIX_DATACENTER_KIND: &str = "NutanixDatacenterConfig";
pub const TINKERBELL_DATACENTER_KIND: &str = "TinkerbellDatacenterConfig";
pub const SNOW_DATACENTER_KIND: &str = "SnowDatacenterConfig";
pub const DOCKER_DATACENTER_KIND: &str = "DockerDatacenterConfig";

/// Result of a provider reconcile that did not fail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Poll again after this delay.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn to_action(&self) -> Action {
        match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        }
    }
}

/// Infrastructure-specific reconciliation of a workload cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClusterReconciler: Send + Sync {
    /// Reconcile the whole cluster: control plane, workers and provider objects.
    async fn reconcile(&self, cluster: &ObjectKey) -> Result<ReconcileOutcome>;

    /// Reconcile only the worker node groups of the cluster.
    async fn reconcile_worker_nodes(&self, cluster: &ObjectKey) -> Result<ReconcileOutcome>;
}

/// Provider reconcilers keyed by datacenter config kind.
#[derive(Clone, Default)]
pub struct ProviderReconcilerRegistry {
    reconcilers: HashMap<String, Arc<dyn ProviderClusterReconciler>>,
}

impl ProviderReconcilerRegistry {
    pub fn builder() -> ProviderReconcilerRegistryBuilder {
        ProviderReconcilerRegistryBuilder::default()
    }

    /// The reconciler registered for `datacenter_kind`, if any.
    pub fn get(&self, datacenter_kind: &str) -> Option<Arc<dyn ProviderClusterReconciler>> {
        self.reconcilers.get(datacenter_kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.reconcilers.keys().map(String::as_str)
    }
}

#[derive(Default)]
pub struct ProviderReconcilerRegistryBuilder {
    reconcilers: HashMap<String, Arc<dyn ProviderClusterReconciler>>,
}

impl ProviderReconcilerRegistryBuilder {
    /// Register `reconciler` for `datacenter_kind`. A second registration of
    /// the same kind replaces the first.
    pub fn add(
        mut self,
        datacenter_kind: impl Into<String>,
        reconciler: Arc<dyn ProviderClusterReconciler>,
    ) -> Self {
        self.reconcilers.insert(datacenter_kind.into(), reconciler);
        self
    }

    pub fn build(self) -> ProviderReconcilerRegistry {
        ProviderReconcilerRegistry {
            reconcilers: self.reconcilers,
        }
    }
}
