//! Clients for workload clusters.
//!
//! The node upgrade controller runs the upgrader Pod on the cluster that
//! owns the machine, which is usually not the management cluster the
//! operator runs in. A [`RemoteClientRegistry`] resolves a CAPI cluster
//! (namespace + name) to a client for that cluster.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{KubeObjectClient, ObjectClient, ObjectKey};
use crate::controller::error::{Error, Result};

/// Key holding the kubeconfig in a CAPI `<cluster>-kubeconfig` Secret.
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Name of the Secret CAPI writes the admin kubeconfig of a cluster to.
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-kubeconfig")
}

/// Resolves target clusters to API clients.
///
/// Implementations are shared across concurrent reconciles and must be safe
/// to populate concurrently.
#[cfg_attr(test, mockall::automock(type Client = crate::client::MemoryObjectClient;))]
#[async_trait]
pub trait RemoteClientRegistry: Send + Sync + 'static {
    /// Client type handed out for target clusters.
    type Client: ObjectClient;

    /// Client for the cluster named by `cluster` (CAPI Cluster namespace/name).
    async fn get_client(&self, cluster: &ObjectKey) -> Result<Self::Client>;
}

// ============================================================================
// Kubeconfig Secret registry
// ============================================================================

/// A workload cluster client and the kubeconfig Secret version it was built from.
#[derive(Clone)]
struct CachedClient {
    resource_version: Option<String>,
    client: KubeObjectClient,
}

/// Builds clients from CAPI kubeconfig Secrets on the management cluster and
/// caches them per cluster.
///
/// The Secret is read on every lookup. A cached client is reused while the
/// Secret's resourceVersion is unchanged, so rotated credentials take effect
/// on the next lookup. A failed lookup evicts the cluster's entry.
pub struct KubeconfigSecretRegistry<S = KubeObjectClient> {
    secrets: S,
    management: KubeObjectClient,
    management_cluster: Option<String>,
    cache: RwLock<HashMap<ObjectKey, CachedClient>>,
}

impl KubeconfigSecretRegistry {
    /// `management_cluster` names the cluster the operator runs in; it is
    /// served with the management client instead of a kubeconfig lookup.
    pub fn new(management: KubeObjectClient, management_cluster: Option<String>) -> Self {
        Self::with_secret_client(management.clone(), management, management_cluster)
    }
}

impl<S: ObjectClient> KubeconfigSecretRegistry<S> {
    /// Like [`KubeconfigSecretRegistry::new`], reading kubeconfig Secrets through `secrets`.
    pub fn with_secret_client(
        secrets: S,
        management: KubeObjectClient,
        management_cluster: Option<String>,
    ) -> Self {
        Self {
            secrets,
            management,
            management_cluster,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn build_client(cluster: &ObjectKey, secret: &Secret) -> Result<KubeObjectClient> {
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::Kubeconfig(format!(
                    "secret {} has no {KUBECONFIG_SECRET_KEY} key",
                    kubeconfig_secret_name(&cluster.name)
                ))
            })?;
        let yaml =
            std::str::from_utf8(&raw.0).map_err(|e| Error::Kubeconfig(e.to_string()))?;
        let kubeconfig =
            Kubeconfig::from_yaml(yaml).map_err(|e| Error::Kubeconfig(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(config).map_err(Error::Kube)?;

        info!(cluster = %cluster, "Built client for workload cluster");
        Ok(KubeObjectClient::new(client))
    }

    async fn lookup(&self, cluster: &ObjectKey) -> Result<KubeObjectClient> {
        let secret: Secret = self
            .secrets
            .get(&ObjectKey::new(
                cluster.namespace.clone(),
                kubeconfig_secret_name(&cluster.name),
            ))
            .await?;
        let resource_version = secret.metadata.resource_version.clone();

        let cached = self.cache.read().await.get(cluster).cloned();
        if let Some(cached) = cached.filter(|c| c.resource_version == resource_version) {
            debug!(cluster = %cluster, "Using cached workload cluster client");
            return Ok(cached.client);
        }

        let client = Self::build_client(cluster, &secret).await?;
        self.cache.write().await.insert(
            cluster.clone(),
            CachedClient {
                resource_version,
                client: client.clone(),
            },
        );
        Ok(client)
    }
}

#[async_trait]
impl<S: ObjectClient> RemoteClientRegistry for KubeconfigSecretRegistry<S> {
    type Client = KubeObjectClient;

    async fn get_client(&self, cluster: &ObjectKey) -> Result<KubeObjectClient> {
        if self.management_cluster.as_deref() == Some(cluster.name.as_str()) {
            return Ok(self.management.clone());
        }

        let result = self.lookup(cluster).await;
        if result.is_err() && self.cache.write().await.remove(cluster).is_some() {
            debug!(cluster = %cluster, "Evicted workload cluster client");
        }
        result
    }
}

// ============================================================================
// Static registry
// ============================================================================

/// Registry with a fixed set of clients, falling back to a default client
/// for unknown clusters.
#[derive(Clone)]
pub struct StaticRegistry<C> {
    clients: HashMap<ObjectKey, C>,
    fallback: Option<C>,
}

impl<C: ObjectClient> StaticRegistry<C> {
    /// Serve `client` for every cluster.
    pub fn single(client: C) -> Self {
        Self {
            clients: HashMap::new(),
            fallback: Some(client),
        }
    }

    /// No clients; every lookup fails until clusters are added.
    pub fn empty() -> Self {
        Self {
            clients: HashMap::new(),
            fallback: None,
        }
    }

    /// Serve `client` for `cluster`.
    pub fn with_cluster(mut self, cluster: ObjectKey, client: C) -> Self {
        self.clients.insert(cluster, client);
        self
    }
}

#[async_trait]
impl<C: ObjectClient> RemoteClientRegistry for StaticRegistry<C> {
    type Client = C;

    async fn get_client(&self, cluster: &ObjectKey) -> Result<C> {
        self.clients
            .get(cluster)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no client registered for cluster {cluster}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::MemoryObjectClient;

    #[test]
    fn test_kubeconfig_secret_name() {
        assert_eq!(kubeconfig_secret_name("prod"), "prod-kubeconfig");
    }

    #[tokio::test]
    async fn test_static_registry_prefers_registered_cluster() {
        let fallback = MemoryObjectClient::new();
        let workload = MemoryObjectClient::new();
        let key = ObjectKey::new("default", "workload");
        workload
            .insert(k8s_openapi::api::core::v1::Namespace {
                metadata: kube::api::ObjectMeta {
                    name: Some("marker".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let registry = StaticRegistry::single(fallback).with_cluster(key.clone(), workload);
        let client = registry.get_client(&key).await.unwrap();
        assert!(client.contains::<k8s_openapi::api::core::v1::Namespace>(&ObjectKey::cluster(
            "marker"
        )));

        let other = registry
            .get_client(&ObjectKey::new("default", "other"))
            .await
            .unwrap();
        assert!(!other.contains::<k8s_openapi::api::core::v1::Namespace>(&ObjectKey::cluster(
            "marker"
        )));
    }

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: workload
  cluster:
    server: http://127.0.0.1:8080
contexts:
- name: workload
  context:
    cluster: workload
    user: admin
current-context: workload
users:
- name: admin
  user:
    token: not-a-real-token
"#;

    fn kubeconfig_secret(kubeconfig: &str) -> Secret {
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("workload-kubeconfig".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(std::collections::BTreeMap::from([(
                KUBECONFIG_SECRET_KEY.to_string(),
                k8s_openapi::ByteString(kubeconfig.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn secret_registry(secrets: &MemoryObjectClient) -> KubeconfigSecretRegistry<MemoryObjectClient> {
        let config = Config::new("http://127.0.0.1:8081".parse().unwrap());
        let management = KubeObjectClient::new(Client::try_from(config).unwrap());
        KubeconfigSecretRegistry::with_secret_client(
            secrets.clone(),
            management,
            Some("management".to_string()),
        )
    }

    async fn cached_version<S>(registry: &KubeconfigSecretRegistry<S>, cluster: &ObjectKey) -> Option<Option<String>> {
        registry
            .cache
            .read()
            .await
            .get(cluster)
            .map(|c| c.resource_version.clone())
    }

    #[tokio::test]
    async fn test_secret_registry_rebuilds_on_secret_change() {
        let secrets = MemoryObjectClient::new();
        secrets.insert(kubeconfig_secret(KUBECONFIG)).unwrap();
        let registry = secret_registry(&secrets);
        let cluster = ObjectKey::new("default", "workload");

        registry.get_client(&cluster).await.unwrap();
        let first = cached_version(&registry, &cluster).await.unwrap();
        assert!(first.is_some());

        registry.get_client(&cluster).await.unwrap();
        assert_eq!(cached_version(&registry, &cluster).await, Some(first.clone()));

        // Rotated credentials bump the resourceVersion.
        secrets.insert(kubeconfig_secret(KUBECONFIG)).unwrap();
        registry.get_client(&cluster).await.unwrap();
        let rotated = cached_version(&registry, &cluster).await.unwrap();
        assert_ne!(rotated, first);
    }

    #[tokio::test]
    async fn test_secret_registry_evicts_on_error() {
        let secrets = MemoryObjectClient::new();
        secrets.insert(kubeconfig_secret(KUBECONFIG)).unwrap();
        let registry = secret_registry(&secrets);
        let cluster = ObjectKey::new("default", "workload");
        registry.get_client(&cluster).await.unwrap();

        secrets
            .delete::<Secret>(&ObjectKey::new("default", "workload-kubeconfig"))
            .await
            .unwrap();
        let err = registry.get_client(&cluster).await.unwrap_err();
        assert_eq!(err.to_string(), "secrets \"workload-kubeconfig\" not found");
        assert_eq!(cached_version(&registry, &cluster).await, None);
    }

    #[tokio::test]
    async fn test_secret_registry_rejects_bad_kubeconfig() {
        let secrets = MemoryObjectClient::new();
        let mut secret = kubeconfig_secret(KUBECONFIG);
        secret.data = None;
        secrets.insert(secret).unwrap();
        let registry = secret_registry(&secrets);

        let err = registry
            .get_client(&ObjectKey::new("default", "workload"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid kubeconfig: secret workload-kubeconfig has no value key"
        );
    }

    #[tokio::test]
    async fn test_secret_registry_serves_management_cluster() {
        let secrets = MemoryObjectClient::new();
        let registry = secret_registry(&secrets);
        registry
            .get_client(&ObjectKey::new("default", "management"))
            .await
            .unwrap();
        assert!(registry.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_errors() {
        let registry: StaticRegistry<MemoryObjectClient> = StaticRegistry::empty();
        let err = registry
            .get_client(&ObjectKey::new("default", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no client registered for cluster default/missing");
    }
}
