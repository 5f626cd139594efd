//! Tenant Instance Cache
//!
//! Hands out one live connection instance per (user, tenant) pair:
//! - Hit: the cached instance is returned and its last-used time refreshed
//! - Miss: a single construction runs; concurrent callers for the same key
//!   wait for it and receive the same instance
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        InstanceCache                          │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │   Instance map (LRU, idle TTL, optional max lifetime)  │  │
//! │  │  ┌───────────┐  ┌───────────┐  ┌──────────────┐        │  │
//! │  │  │ (u1, t1)  │  │ (u1, t2)  │  │ (u2, <none>) │  ...   │  │
//! │  │  └───────────┘  └───────────┘  └──────────────┘        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                             │ miss                            │
//! │  ┌──────────────────────────▼─────────────────────────────┐  │
//! │  │   SessionConnector (API or Postgres)                   │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The access token only configures a new instance. A hit with a different
//! token returns the existing instance unchanged; callers that know a token
//! was revoked call [`InstanceCache::invalidate`].

use crate::config::{BaseConfig, InstanceCacheConfig};
use crate::connector::{ApiConnector, SessionConnector};
use crate::error::{InstanceError, Result};
use crate::instance::{fingerprint_token, ConnectionInstance};
use moka::future::Cache;
use moka::notification::{ListenerFuture, RemovalCause};
use moka::policy::EvictionPolicy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenancy_models::{IdentityKey, InstanceInfo, SessionKey};
use validator::Validate;

/// Logs at `info` when verbose diagnostics are on, `debug` otherwise
/// (`trace` for the per-hit messages).
macro_rules! diag {
    ($verbose:expr, trace, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    constructions: AtomicU64,
    construction_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Process-wide map from (user, tenant) to a live connection instance
#[derive(Clone)]
pub struct InstanceCache {
    cache: Cache<SessionKey, ConnectionInstance>,
    connector: Arc<dyn SessionConnector>,
    base_config: Arc<BaseConfig>,
    config: InstanceCacheConfig,
    counters: Arc<CacheCounters>,
}

impl InstanceCache {
    /// Create a cache that establishes sessions through `connector`
    pub fn new(
        base_config: BaseConfig,
        config: InstanceCacheConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self> {
        base_config.validate()?;
        config.validate()?;

        let counters = Arc::new(CacheCounters::default());
        let verbose = base_config.debug;

        let listener_counters = counters.clone();
        let mut builder = Cache::builder()
            .max_capacity(config.max_instances)
            .time_to_idle(config.idle_ttl)
            .eviction_policy(EvictionPolicy::lru())
            .async_eviction_listener(
                move |key: Arc<SessionKey>,
                      instance: ConnectionInstance,
                      cause: RemovalCause|
                      -> ListenerFuture {
                    let counters = listener_counters.clone();
                    Box::pin(async move {
                        counters.evictions.fetch_add(1, Ordering::Relaxed);
                        diag!(
                            verbose,
                            "Evicting instance {} for {} ({:?})",
                            instance.id(),
                            key,
                            cause
                        );
                        instance.release().await;
                    })
                },
            );

        if let Some(max_lifetime) = config.max_lifetime {
            builder = builder.time_to_live(max_lifetime);
        }

        tracing::info!(
            "Instance cache ready (api: {}, capacity: {}, idle ttl: {:?})",
            base_config.api_base_path,
            config.max_instances,
            config.idle_ttl
        );

        Ok(Self {
            cache: builder.build(),
            connector,
            base_config: Arc::new(base_config),
            config,
            counters,
        })
    }

    /// Create a cache backed by the HTTP API connector
    pub fn with_api_connector(base_config: BaseConfig, config: InstanceCacheConfig) -> Result<Self> {
        Self::new(base_config, config, Arc::new(ApiConnector::default()))
    }

    pub fn base_config(&self) -> &BaseConfig {
        &self.base_config
    }

    /// Get the instance for `key`, establishing a session on first use.
    ///
    /// Concurrent misses for the same (user, tenant) share one construction.
    /// A failed construction inserts nothing; the next call starts over.
    pub async fn get_instance(&self, key: &IdentityKey) -> Result<ConnectionInstance> {
        key.validate()?;

        let session_key = key.session_key();

        // Check cache first
        if let Some(instance) = self.cache.get(&session_key).await {
            self.record_hit(&instance, key);
            return Ok(instance);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        diag!(self.base_config.debug, "No cached instance for {}", session_key);

        // Run the construction on its own task so an abandoned request
        // does not abandon the session other callers may be waiting for
        let this = self.clone();
        let key = key.clone();
        tokio::spawn(async move { this.get_or_construct(key).await })
            .await
            .map_err(|e| InstanceError::Internal(format!("Instance construction task failed: {}", e)))?
    }

    async fn get_or_construct(&self, key: IdentityKey) -> Result<ConnectionInstance> {
        let session_key = key.session_key();

        let instance = self
            .cache
            .try_get_with(session_key, self.construct(&key))
            .await?;

        instance.touch();
        Ok(instance)
    }

    async fn construct(&self, key: &IdentityKey) -> Result<ConnectionInstance> {
        let session_key = key.session_key();
        diag!(self.base_config.debug, "Establishing session for {}", session_key);

        match self
            .connector
            .connect(&self.base_config, &session_key, &key.access_token)
            .await
        {
            Ok(session) => {
                self.counters.constructions.fetch_add(1, Ordering::Relaxed);
                let instance = ConnectionInstance::new(session_key, &key.access_token, session);
                diag!(
                    self.base_config.debug,
                    "Created instance {} for {} (token {})",
                    instance.id(),
                    instance.key(),
                    instance.token_fingerprint()
                );
                Ok(instance)
            }
            Err(e) => {
                self.counters
                    .construction_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to establish session for {}: {}", session_key, e);
                Err(e)
            }
        }
    }

    fn record_hit(&self, instance: &ConnectionInstance, key: &IdentityKey) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        instance.touch();

        diag!(
            self.base_config.debug,
            trace,
            "Reusing instance {} for {}",
            instance.id(),
            instance.key()
        );

        if !instance.was_created_with(&key.access_token) {
            diag!(
                self.base_config.debug,
                "Instance {} for {} keeps token {}; caller presented {}",
                instance.id(),
                instance.key(),
                instance.token_fingerprint(),
                fingerprint_token(&key.access_token)
            );
        }
    }

    /// Remove and release the instance for `key`. Returns whether one existed.
    pub async fn invalidate(&self, key: impl Into<SessionKey>) -> bool {
        let key = key.into();
        match self.cache.remove(&key).await {
            Some(instance) => {
                // The eviction listener releases too; release is idempotent
                instance.release().await;
                diag!(self.base_config.debug, "Invalidated instance for {}", key);
                true
            }
            None => false,
        }
    }

    /// Remove and release every instance scoped to `tenant_id`
    pub async fn invalidate_tenant(&self, tenant_id: &str) -> usize {
        self.invalidate_matching(|key| key.tenant_id.as_deref() == Some(tenant_id))
            .await
    }

    /// Remove and release every instance belonging to `user_id`
    pub async fn invalidate_user(&self, user_id: &str) -> usize {
        self.invalidate_matching(|key| key.user_id == user_id).await
    }

    /// Remove and release every cached instance
    pub async fn invalidate_all(&self) -> usize {
        self.invalidate_matching(|_| true).await
    }

    async fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SessionKey) -> bool,
    {
        let keys: Vec<SessionKey> = self
            .cache
            .iter()
            .filter(|(key, _)| predicate(key.as_ref()))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.invalidate(key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Whether a live instance exists for `key`; does not count as a use
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Snapshot of every live instance
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.cache.iter().map(|(_, instance)| instance.info()).collect()
    }

    /// Apply pending evictions so counts and listeners are up to date
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Get cache statistics
    pub fn stats(&self) -> InstanceCacheStats {
        InstanceCacheStats {
            cached_instances: self.cache.entry_count(),
            max_instances: self.config.max_instances,
            idle_ttl_secs: self.config.idle_ttl.as_secs(),
            max_lifetime_secs: self.config.max_lifetime.map(|d| d.as_secs()),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            constructions: self.counters.constructions.load(Ordering::Relaxed),
            construction_failures: self.counters.construction_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.config.idle_ttl
    }
}

/// Instance cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct InstanceCacheStats {
    pub cached_instances: u64,
    pub max_instances: u64,
    pub idle_ttl_secs: u64,
    pub max_lifetime_secs: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub constructions: u64,
    pub construction_failures: u64,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::{MockConnector, MockSession};
    use crate::connector::ApiSession;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache_with(connector: Arc<MockConnector>, config: InstanceCacheConfig) -> InstanceCache {
        InstanceCache::new(BaseConfig::default(), config, connector).unwrap()
    }

    fn identity(user: &str, tenant: Option<&str>, token: &str) -> IdentityKey {
        IdentityKey::new(user, tenant, token)
    }

    #[tokio::test]
    async fn test_reuse_same_user_and_tenant() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        let first = cache.get_instance(&identity("u1", Some("t1"), "A")).await.unwrap();
        let second = cache.get_instance(&identity("u1", Some("t1"), "B")).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(connector.attempts(), 1);

        // First writer wins: the instance keeps the token it was built with
        let session = second.session_as::<MockSession>().unwrap();
        assert_eq!(session.access_token, "A");
        assert!(second.was_created_with("A"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.constructions, 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_instances() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        let a = cache.get_instance(&identity("u1", Some("t1"), "A")).await.unwrap();
        let b = cache.get_instance(&identity("u2", Some("t1"), "A")).await.unwrap();
        let c = cache.get_instance(&identity("u1", Some("t2"), "A")).await.unwrap();

        assert!(!a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert!(!b.ptr_eq(&c));
        assert_eq!(connector.attempts(), 3);

        // Releasing one leaves the others alone
        assert!(cache.invalidate(a.key().clone()).await);
        assert!(a.is_released());
        assert!(!b.is_released());
        assert!(!c.is_released());
    }

    #[tokio::test]
    async fn test_null_tenant_is_its_own_key() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        let untenanted = cache.get_instance(&identity("u1", None, "A")).await.unwrap();
        let tenanted = cache.get_instance(&identity("u1", Some("t1"), "A")).await.unwrap();

        assert!(!untenanted.ptr_eq(&tenanted));
        assert_eq!(untenanted.tenant_id(), None);
        assert_eq!(tenanted.tenant_id(), Some("t1"));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_invalid_credentials_do_not_touch_cache() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        let err = cache.get_instance(&identity("u1", Some("t1"), "")).await.unwrap_err();
        assert!(err.is_invalid_credential());

        let err = cache.get_instance(&identity("", Some("t1"), "A")).await.unwrap_err();
        assert!(err.is_invalid_credential());

        assert_eq!(connector.attempts(), 0);
        assert_eq!(cache.stats().misses, 0);
        assert!(!cache.contains(&SessionKey::new("u1", Some("t1"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_construct_once() {
        let connector = Arc::new(MockConnector::with_delay(Duration::from_millis(50)));
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let token = format!("token-{}", i);
                cache.get_instance(&identity("u1", Some("t1"), &token)).await
            }));
        }

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(connector.attempts(), 1);
        let first = &instances[0];
        assert!(instances.iter().all(|i| i.ptr_eq(first)));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());
        let key = identity("u1", Some("t1"), "A");

        let instance = cache.get_instance(&key).await.unwrap();

        assert!(cache.invalidate(&key).await);
        assert!(instance.is_released());
        assert_eq!(connector.closed_count(), 1);

        assert!(!cache.invalidate(&key).await);
        assert_eq!(connector.closed_count(), 1);

        // Next call builds a fresh instance
        let fresh = cache.get_instance(&key).await.unwrap();
        assert!(!fresh.ptr_eq(&instance));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_failed_construction_leaves_no_entry() {
        let connector = Arc::new(MockConnector::failing_first(1));
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());
        let key = identity("u1", Some("t1"), "A");

        let err = cache.get_instance(&key).await.unwrap_err();
        assert!(err.is_upstream_unavailable());
        assert!(!cache.contains(&key.session_key()));

        let instance = cache.get_instance(&key).await.unwrap();
        assert!(!instance.is_released());
        assert_eq!(connector.attempts(), 2);

        let stats = cache.stats();
        assert_eq!(stats.construction_failures, 1);
        assert_eq!(stats.constructions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_waiters_share_failure() {
        let connector = Arc::new(MockConnector {
            delay: Some(Duration::from_millis(50)),
            fail_first: 1,
            ..Default::default()
        });
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_instance(&identity("u1", Some("t1"), "A")).await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_upstream_unavailable());
        }

        assert_eq!(connector.attempts(), 1);
        assert!(!cache.contains(&SessionKey::new("u1", Some("t1"))));
    }

    #[tokio::test]
    async fn test_abandoned_caller_still_populates_cache() {
        let connector = Arc::new(MockConnector::with_delay(Duration::from_millis(100)));
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());
        let key = identity("u1", Some("t1"), "A");

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), cache.get_instance(&key)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.contains(&key.session_key()));

        cache.get_instance(&key).await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_idle_instances_expire_and_release() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(
            connector.clone(),
            InstanceCacheConfig {
                idle_ttl: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let key = identity("u1", Some("t1"), "A");

        let instance = cache.get_instance(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        cache.run_pending_tasks().await;

        assert!(!cache.contains(&key.session_key()));
        assert!(instance.is_released());
        assert_eq!(cache.stats().evictions, 1);

        let fresh = cache.get_instance(&key).await.unwrap();
        assert!(!fresh.ptr_eq(&instance));
    }

    #[tokio::test]
    async fn test_max_lifetime_evicts_busy_instances() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(
            connector.clone(),
            InstanceCacheConfig {
                max_lifetime: Some(Duration::from_millis(150)),
                ..Default::default()
            },
        );
        let key = identity("u1", None, "A");

        let instance = cache.get_instance(&key).await.unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let _ = cache.get_instance(&key).await.unwrap();
        }
        cache.run_pending_tasks().await;

        assert!(instance.is_released());
        assert!(connector.attempts() >= 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(
            connector.clone(),
            InstanceCacheConfig {
                max_instances: 2,
                ..Default::default()
            },
        );
        let a = identity("a", Some("t1"), "A");
        let b = identity("b", Some("t1"), "A");
        let c = identity("c", Some("t1"), "A");

        let instance_a = cache.get_instance(&a).await.unwrap();
        cache.run_pending_tasks().await;
        let instance_b = cache.get_instance(&b).await.unwrap();
        cache.run_pending_tasks().await;

        // Use `a` again so `b` becomes the least recently used
        cache.get_instance(&a).await.unwrap();
        cache.run_pending_tasks().await;

        cache.get_instance(&c).await.unwrap();
        cache.run_pending_tasks().await;

        assert!(cache.contains(&a.session_key()));
        assert!(!cache.contains(&b.session_key()));
        assert!(cache.contains(&c.session_key()));
        assert!(instance_b.is_released());
        assert!(!instance_a.is_released());
        assert_eq!(cache.stats().cached_instances, 2);
    }

    #[tokio::test]
    async fn test_invalidate_tenant_and_user() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        for (user, tenant) in [("u1", Some("t1")), ("u2", Some("t1")), ("u1", Some("t2")), ("u1", None)] {
            cache.get_instance(&identity(user, tenant, "A")).await.unwrap();
        }

        assert_eq!(cache.invalidate_tenant("t1").await, 2);
        assert_eq!(cache.invalidate_tenant("t1").await, 0);
        assert_eq!(cache.invalidate_user("u1").await, 2);

        cache.run_pending_tasks().await;
        assert!(cache.instances().is_empty());
        assert_eq!(connector.closed_count(), 4);
    }

    #[tokio::test]
    async fn test_invalidate_all_and_snapshot() {
        let connector = Arc::new(MockConnector::new());
        let cache = cache_with(connector.clone(), InstanceCacheConfig::default());

        cache.get_instance(&identity("u1", Some("t1"), "A")).await.unwrap();
        cache.get_instance(&identity("u2", None, "B")).await.unwrap();

        let mut users: Vec<String> = cache.instances().into_iter().map(|i| i.user_id).collect();
        users.sort();
        assert_eq!(users, vec!["u1", "u2"]);

        assert_eq!(cache.invalidate_all().await, 2);
        assert_eq!(connector.closed_count(), 2);

        cache.run_pending_tasks().await;
        let stats = cache.stats();
        assert_eq!(stats.cached_instances, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["max_instances"], 1000);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let connector = Arc::new(MockConnector::new());

        let err = InstanceCache::new(BaseConfig::new(""), InstanceCacheConfig::default(), connector.clone())
            .err()
            .unwrap();
        assert!(matches!(err, InstanceError::Configuration(_)));

        let err = InstanceCache::new(
            BaseConfig::default(),
            InstanceCacheConfig {
                max_instances: 0,
                ..Default::default()
            },
            connector,
        )
        .err()
        .unwrap();
        assert!(matches!(err, InstanceError::Configuration(_)));
    }

    #[test]
    fn test_oversized_ttl_is_config_error_not_panic() {
        let connector = Arc::new(MockConnector::new());
        let huge = Duration::from_secs(u64::MAX / 2);

        let err = InstanceCache::new(
            BaseConfig::default(),
            InstanceCacheConfig {
                idle_ttl: huge,
                ..Default::default()
            },
            connector.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, InstanceError::Configuration(_)));

        let err = InstanceCache::new(
            BaseConfig::default(),
            InstanceCacheConfig {
                max_lifetime: Some(huge),
                ..Default::default()
            },
            connector,
        )
        .err()
        .unwrap();
        assert!(matches!(err, InstanceError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_api_connector_end_to_end() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/me"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let base = BaseConfig::new(format!("{}/v2", server.uri())).with_debug(true);
        let cache = InstanceCache::with_api_connector(base, InstanceCacheConfig::default()).unwrap();

        let first = cache.get_instance(&identity("u1", Some("t1"), "A")).await.unwrap();
        let second = cache.get_instance(&identity("u1", Some("t1"), "B")).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert!(first.session_as::<ApiSession>().is_some());
    }
}
