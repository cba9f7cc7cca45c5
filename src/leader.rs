//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only the leader runs controllers. Writes carry the resourceVersion that
//! was read, so two replicas racing for an expired lease cannot both win:
//! the loser gets a 409 and keeps waiting.

use std::sync::Arc;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::kube_api::FIELD_MANAGER;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with a lease observed at a point in time.
#[derive(Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it; refresh the renew time.
    Renew,
    /// Expired or never held; take it over.
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease.
    Wait,
}

/// Decide how `identity` should treat a lease with `spec` at `now`.
pub fn decide(spec: Option<&LeaseSpec>, identity: &str, now: Timestamp) -> LeaseDecision {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration) {
        (Some(_), Some(renewed), Some(secs)) => {
            now > renewed.0 + SignedDuration::from_secs(i64::from(secs))
        }
        _ => true,
    };
    if expired {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseDecision::Wait
    }
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration,
        }
    }

    /// Renew at a third of the lease duration.
    fn renew_interval(&self) -> Duration {
        self.lease_duration / 3
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until leadership is acquired.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership"
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another replica");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let now = Timestamp::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return self.create(&api, now).await,
            Err(e) => return Err(e.into()),
        };

        let acquire_time = existing.spec.as_ref().and_then(|s| s.acquire_time.clone());
        match decide(existing.spec.as_ref(), &self.identity, now) {
            LeaseDecision::Wait => Ok(false),
            LeaseDecision::Renew => {
                let lease = self.lease(existing.metadata.resource_version.clone(), now, acquire_time, None)?;
                self.replace(&api, &lease).await
            }
            LeaseDecision::TakeOver { transitions } => {
                let lease = self.lease(
                    existing.metadata.resource_version.clone(),
                    now,
                    None,
                    Some(transitions + 1),
                )?;
                let acquired = self.replace(&api, &lease).await?;
                if acquired {
                    info!(identity = %self.identity, transitions = transitions + 1, "Took over expired lease");
                }
                Ok(acquired)
            }
        }
    }

    /// Build the lease we want to write. `resource_version` pins the write
    /// to the revision we read.
    fn lease(
        &self,
        resource_version: Option<String>,
        now: Timestamp,
        acquire_time: Option<MicroTime>,
        transitions: Option<i32>,
    ) -> Result<Lease, LeaderElectionError> {
        let resource_version = resource_version
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;
        Ok(Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(resource_version),
                ..Default::default()
            },
            spec: Some(self.spec(now, acquire_time, transitions)),
        })
    }

    fn spec(&self, now: Timestamp, acquire_time: Option<MicroTime>, transitions: Option<i32>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(acquire_time.unwrap_or(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: transitions,
            ..Default::default()
        }
    }

    async fn create(&self, api: &Api<Lease>, now: Timestamp) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.spec(now, None, Some(0))),
        };
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, api: &Api<Lease>, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match api.replace(&self.lease_name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease changed since read");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval()).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => debug!(identity = %self.identity, "Lease renewed"),
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    async fn release(&self) -> Result<(), LeaderElectionError> {
        let api = self.api();
        let lease = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }
        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "holderIdentity": null }
        });
        api.patch(
            &self.lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Holds leadership while alive. Renewal stops when dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once the lease could not be renewed.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
