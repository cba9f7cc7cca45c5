//! Controller manager.
//!
//! Every reconciler implements [`Reconciler`] and registers itself with a
//! [`Manager`] through `setup_with_manager`. The manager builds one
//! `kube::runtime::Controller` per reconciler, which guarantees at most one
//! in-flight reconcile per object key, and runs them all concurrently.
//!
//! Errors are retried with per-key exponential backoff. A reconcile that
//! fails because its own object is gone waits for the next change instead.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::{self, Action};
use kube::runtime::{
    Controller, PredicateConfig, WatchStreamExt, predicates, reflector, watcher,
};
use kube::{Api, Client, Resource};
use tracing::{debug, error, info, warn};

use crate::client::{ObjectKey, ObjectKind};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result, backoff_for, qualified_resource};
use crate::health::HealthState;
use crate::{default_watcher_config, scoped_api};

/// Default number of concurrent reconciles per controller.
pub const DEFAULT_CONCURRENCY: u16 = 10;

/// A level-triggered reconciler for one resource kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The kind this reconciler is triggered by.
    type Object: ObjectKind + Resource<Scope = NamespaceResourceScope>;

    /// Controller name used in logs, events and metrics.
    const NAME: &'static str;

    /// Skip watch events that do not change `metadata.generation`.
    const GENERATION_FILTERED: bool = true;

    /// Reconcile the object identified by `key`.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;

    /// Register this reconciler with `manager`.
    fn setup_with_manager(self, manager: &mut Manager)
    where
        Self: Sized,
    {
        manager.register(self);
    }
}

/// Consecutive failure counts per object key.
#[derive(Default)]
pub struct Backoff {
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    /// Record a failure of `key` and return the delay before its retry.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_for(*count)
    }

    /// Forget the failures of `key` after a successful reconcile.
    pub fn reset(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Whether `error` reports that the reconciled object itself is gone.
pub fn is_primary_not_found<K>(error: &Error, key: &ObjectKey) -> bool
where
    K: Resource<DynamicType = ()>,
{
    match error {
        Error::NotFound { resource, name } => {
            *resource == qualified_resource::<K>() && *name == key.name
        }
        _ => false,
    }
}

struct ControllerState<R> {
    reconciler: R,
    context: Arc<Context>,
    backoff: Backoff,
}

async fn reconcile<R: Reconciler>(
    obj: Arc<R::Object>,
    state: Arc<ControllerState<R>>,
) -> Result<Action> {
    let key = ObjectKey::of(obj.as_ref());
    let start = Instant::now();
    let result = state.reconciler.reconcile(&key).await;
    let elapsed = start.elapsed().as_secs_f64();

    if let Some(health) = &state.context.health_state {
        match &result {
            Ok(_) => {
                health
                    .metrics
                    .record_reconcile(R::NAME, &key.namespace, &key.name, elapsed);
                health.last_reconcile.store(
                    jiff::Timestamp::now().as_second().max(0) as u64,
                    std::sync::atomic::Ordering::Relaxed,
                );
            }
            Err(_) => health
                .metrics
                .record_error(R::NAME, &key.namespace, &key.name),
        }
    }

    match &result {
        Ok(_) => state.backoff.reset(&key),
        Err(e) if !is_primary_not_found::<R::Object>(e, &key) => {
            state
                .context
                .publish_warning_event(
                    obj.as_ref(),
                    "ReconcileFailed",
                    "Reconcile",
                    Some(e.to_string()),
                )
                .await;
        }
        Err(_) => {}
    }
    result
}

fn error_policy<R: Reconciler>(
    obj: Arc<R::Object>,
    error: &Error,
    state: Arc<ControllerState<R>>,
) -> Action {
    let key = ObjectKey::of(obj.as_ref());
    if is_primary_not_found::<R::Object>(error, &key) {
        debug!(controller = R::NAME, object = %key, "Object no longer exists");
        state.backoff.reset(&key);
        return Action::await_change();
    }
    let delay = state.backoff.next_delay(&key);
    let retry_in_ms = delay.as_millis() as u64;
    if error.is_retryable() {
        warn!(controller = R::NAME, object = %key, error = %error, retry_in_ms, "Reconcile failed, requeueing");
    } else {
        // Needs a change to the object or its inputs.
        error!(controller = R::NAME, object = %key, error = %error, retry_in_ms, "Reconcile failed, requeueing");
    }
    Action::requeue(delay)
}

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs the registered controllers against one cluster.
pub struct Manager {
    client: Client,
    namespace: Option<String>,
    concurrency: u16,
    context: Arc<Context>,
    controllers: Vec<ControllerFuture>,
}

impl Manager {
    /// Create a manager watching every namespace.
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            context: Arc::new(Context::new(client.clone(), health_state)),
            client,
            namespace: None,
            concurrency: DEFAULT_CONCURRENCY,
            controllers: Vec::new(),
        }
    }

    /// Restrict watches to `namespace`.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Concurrent reconciles per controller.
    pub fn with_concurrency(mut self, concurrency: u16) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn health_state(&self) -> Option<Arc<HealthState>> {
        self.context.health_state.clone()
    }

    /// Build the controller for `reconciler`. It starts with [`Manager::run`].
    pub fn register<R: Reconciler>(&mut self, reconciler: R) {
        let api: Api<R::Object> = scoped_api(self.client.clone(), self.namespace.as_deref());
        let (reader, writer) = reflector::store();
        let events = reflector(writer, watcher(api, default_watcher_config()))
            .default_backoff()
            .applied_objects();
        let stream: BoxStream<'static, std::result::Result<R::Object, watcher::Error>> =
            if R::GENERATION_FILTERED {
                events
                    .predicate_filter(predicates::generation, PredicateConfig::default())
                    .boxed()
            } else {
                events.boxed()
            };

        let state = Arc::new(ControllerState {
            reconciler,
            context: self.context.clone(),
            backoff: Backoff::default(),
        });

        info!(
            controller = R::NAME,
            kind = %R::Object::kind(&()),
            scope = self.namespace.as_deref().unwrap_or("cluster-wide"),
            "Registering controller"
        );

        let controller = Controller::for_stream(stream, reader)
            .with_config(controller::Config::default().concurrency(self.concurrency))
            .shutdown_on_signal()
            .run(reconcile::<R>, error_policy::<R>, state)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!(controller = R::NAME, object = %obj, "Reconciled");
                    }
                    Err(kube::runtime::controller::Error::ObjectNotFound(obj)) => {
                        debug!(controller = R::NAME, object = %obj, "Object no longer exists");
                    }
                    Err(kube::runtime::controller::Error::ReconcilerFailed(err, obj)) => {
                        debug!(controller = R::NAME, object = %obj, error = %err, "Reconcile error");
                    }
                    Err(e) => {
                        error!(controller = R::NAME, error = %e, "Controller error");
                    }
                }
            });
        self.controllers.push(Box::pin(controller));
    }

    /// Run every registered controller until they stop.
    pub async fn run(self) {
        if let Some(health) = &self.context.health_state {
            health.set_ready(true).await;
        }
        info!(controllers = self.controllers.len(), "Starting controllers");
        futures::future::join_all(self.controllers).await;
        info!("All controllers stopped");
    }
}
