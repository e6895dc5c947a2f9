//! Low-level cache client.
//!
//! `CacheStore` wraps a [`CacheBackend`] with serialization, TTL policy,
//! per-call timeouts and metrics. Apart from [`CacheStore::connect`], every
//! public operation contains its own failures: errors are logged, counted and
//! converted to the operation's safe fallback (miss, `false`, `0`).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anno_cache_api_types::StoreInfoPayload;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::backend::{self, CacheBackend, SetCondition, TTL_MISSING};
use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::{BATCH_PREFIX, CacheKey, EntityKind};
use super::lock::{rw_read, rw_write};
use super::metrics::CacheMetrics;
use super::serializer::{CacheValue, NULL_MARKER, Serializer, is_null_marker};

const SOURCE: &str = "cache::store";
const DELETE_CHUNK: usize = 1_000;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Hit(T),
    /// A deliberately cached "no value".
    Absent,
    Miss,
}

impl<T> Cached<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Cached::Hit(value) => Some(value),
            Cached::Absent | Cached::Miss => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Cached::Miss)
    }
}

/// Write options for [`CacheStore::set_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Requested TTL; `None` means the configured default.
    pub ttl: Option<Duration>,
    pub condition: SetCondition,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Only write when the key does not exist.
    pub fn if_absent(mut self) -> Self {
        self.condition = SetCondition::IfAbsent;
        self
    }

    /// Only write when the key already exists.
    pub fn if_present(mut self) -> Self {
        self.condition = SetCondition::IfPresent;
        self
    }
}

pub struct CacheStore {
    config: CacheConfig,
    serializer: Serializer,
    metrics: Arc<CacheMetrics>,
    backend: RwLock<Option<Arc<dyn CacheBackend>>>,
    injected: Option<Arc<dyn CacheBackend>>,
    connecting: Mutex<()>,
}

impl CacheStore {
    /// Create a store whose backend is chosen by `config.mode` on connect.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a store over an existing backend.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self::build(config, Some(backend))
    }

    fn build(config: CacheConfig, injected: Option<Arc<dyn CacheBackend>>) -> Self {
        for warning in config.validate() {
            warn!(target: "anno_cache::cache::config", %warning, "cache configuration warning");
        }
        Self {
            serializer: Serializer::new(config.compression_threshold),
            config,
            metrics: Arc::new(CacheMetrics::new()),
            backend: RwLock::new(None),
            injected,
            connecting: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Establish the connection pool. Idempotent.
    ///
    /// Unlike every other operation this fails closed, so callers can decide
    /// whether to run without a cache.
    pub async fn connect(&self) -> Result<(), CacheError> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let started = Instant::now();
        let attempt = async {
            let backend = match &self.injected {
                Some(backend) => Arc::clone(backend),
                None => backend::connect(&self.config).await?,
            };
            backend.ping().await?;
            Ok::<_, CacheError>(backend)
        };

        let backend = match timeout(self.config.socket_connect_timeout, attempt).await {
            Ok(Ok(backend)) => backend,
            Ok(Err(err)) => {
                error!(mode = self.config.mode.name(), error = %err, "cache store connection failed");
                return Err(match err {
                    CacheError::Connection { .. } | CacheError::InvalidConfig { .. } => err,
                    other => CacheError::connection(other.to_string()),
                });
            }
            Err(_) => {
                error!(
                    mode = self.config.mode.name(),
                    timeout_ms = self.config.socket_connect_timeout.as_millis() as u64,
                    "cache store connection timed out"
                );
                return Err(CacheError::connection(format!(
                    "timed out after {:?}",
                    self.config.socket_connect_timeout
                )));
            }
        };

        info!(
            mode = self.config.mode.name(),
            backend = backend.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache store connected"
        );
        *rw_write(&self.backend, SOURCE, "connect") = Some(backend);
        Ok(())
    }

    /// Close the pool. Safe to call when not connected.
    pub async fn disconnect(&self) {
        let backend = rw_write(&self.backend, SOURCE, "disconnect").take();
        if let Some(backend) = backend {
            backend.close().await;
            info!(backend = backend.name(), "cache store disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        rw_read(&self.backend, SOURCE, "is_connected").is_some()
    }

    fn backend(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        rw_read(&self.backend, SOURCE, "backend")
            .clone()
            .ok_or(CacheError::NotConnected)
    }

    /// Run one backend call under the socket timeout.
    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(Arc<dyn CacheBackend>) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let backend = self.backend()?;
        let limit = self.config.socket_timeout;
        match timeout(limit, f(backend)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout { op, timeout: limit }),
        }
    }

    /// Record latency for `op` and count plus log a failure.
    fn observe<T>(
        &self,
        op: &'static str,
        key: &str,
        started: Instant,
        result: Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        self.metrics.observe_op(op, started.elapsed());
        if let Err(err) = &result {
            self.metrics.record_error();
            warn!(op, key, error = %err, "cache operation failed");
        }
        result
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up `key`, surfacing store and decode failures.
    pub async fn try_lookup<T: CacheValue>(&self, key: &str) -> Result<Cached<T>, CacheError> {
        let started = Instant::now();
        let fetched = self
            .call("get", |backend| async move { backend.get(key).await })
            .await;
        let result = fetched.and_then(|payload| match payload {
            None => Ok(Cached::Miss),
            Some(bytes) if is_null_marker(&bytes) => Ok(Cached::Absent),
            Some(bytes) => self
                .serializer
                .deserialize(&bytes)
                .map(Cached::Hit)
                .map_err(CacheError::from),
        });
        let result = self.observe("get", key, started, result)?;

        if result.is_miss() {
            self.metrics.record_miss(started.elapsed());
            debug!(key, "cache miss");
        } else {
            self.metrics.record_hit(started.elapsed());
            debug!(key, "cache hit");
        }
        Ok(result)
    }

    /// Look up `key`; failures degrade to [`Cached::Miss`].
    pub async fn lookup<T: CacheValue>(&self, key: &str) -> Cached<T> {
        self.try_lookup(key).await.unwrap_or(Cached::Miss)
    }

    pub async fn get<T: CacheValue>(&self, key: &str) -> Option<T> {
        self.lookup(key).await.into_option()
    }

    /// Value at `key`, or `default` on miss or failure.
    pub async fn get_or<T: CacheValue>(&self, key: &str, default: T) -> T {
        self.get(key).await.unwrap_or(default)
    }

    /// Fetch many keys in one round trip. Missing and undecodable keys are omitted.
    pub async fn get_many<T: CacheValue>(&self, keys: &[String]) -> HashMap<String, T> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return found;
        }

        let started = Instant::now();
        let fetched = self
            .call("get_many", |backend| async move { backend.mget(keys).await })
            .await;
        let Ok(payloads) = self.observe("get_many", &keys[0], started, fetched) else {
            return found;
        };

        let per_key = started.elapsed() / keys.len() as u32;
        for (key, payload) in keys.iter().zip(payloads) {
            match payload {
                Some(bytes) if !is_null_marker(&bytes) => {
                    match self.serializer.deserialize::<T>(&bytes) {
                        Ok(value) => {
                            self.metrics.record_hit(per_key);
                            found.insert(key.clone(), value);
                        }
                        Err(err) => {
                            self.metrics.record_error();
                            warn!(op = "get_many", key = %key, error = %err, "cache entry could not be decoded");
                        }
                    }
                }
                Some(_) => self.metrics.record_hit(per_key),
                None => self.metrics.record_miss(per_key),
            }
        }
        found
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write `value`, surfacing store and encode failures.
    pub async fn try_set<T: CacheValue>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<bool, CacheError> {
        let started = Instant::now();
        let payload = self.serializer.serialize(value).map_err(CacheError::from);
        let payload = self.observe("set", key, started, payload)?;
        self.write(key, payload, options, started).await
    }

    async fn write(
        &self,
        key: &str,
        payload: Vec<u8>,
        options: SetOptions,
        started: Instant,
    ) -> Result<bool, CacheError> {
        let ttl = self.config.effective_ttl(options.ttl);
        let written = self
            .call("set", |backend| async move {
                backend.set(key, payload, ttl, options.condition).await
            })
            .await;
        let written = self.observe("set", key, started, written)?;
        if written {
            self.metrics.record_set(started.elapsed());
            debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        }
        Ok(written)
    }

    /// Write `value` with an optional TTL. Returns `false` on any failure.
    pub async fn set<T: CacheValue>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        self.set_with(
            key,
            value,
            SetOptions {
                ttl,
                ..SetOptions::default()
            },
        )
        .await
    }

    pub async fn set_with<T: CacheValue>(&self, key: &str, value: &T, options: SetOptions) -> bool {
        self.try_set(key, value, options).await.unwrap_or(false)
    }

    /// Cache an explicit "no value" at `key`.
    pub async fn set_none(&self, key: &str, ttl: Option<Duration>) -> bool {
        let options = SetOptions {
            ttl,
            ..SetOptions::default()
        };
        self.try_set_none(key, options).await.unwrap_or(false)
    }

    pub(crate) async fn try_set_none(
        &self,
        key: &str,
        options: SetOptions,
    ) -> Result<bool, CacheError> {
        self.write(key, NULL_MARKER.to_vec(), options, Instant::now())
            .await
    }

    /// Write many entries concurrently. Returns how many were stored.
    pub async fn set_many<T: CacheValue>(&self, entries: &[(String, T)], ttl: Option<Duration>) -> usize {
        let writes = entries
            .iter()
            .map(|(key, value)| self.set(key, value, ttl));
        join_all(writes).await.into_iter().filter(|ok| *ok).count()
    }

    // ========================================================================
    // Deletes and key inspection
    // ========================================================================

    /// Delete `keys`, returning how many existed. Empty input is a no-op.
    pub async fn delete<K: AsRef<str>>(&self, keys: &[K]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let keys: Vec<String> = keys.iter().map(|key| key.as_ref().to_string()).collect();
        let started = Instant::now();
        let removed = self
            .call("delete", |backend| {
                let keys = &keys;
                async move { backend.del(keys).await }
            })
            .await;
        match self.observe("delete", &keys[0], started, removed) {
            Ok(removed) => {
                self.metrics.record_delete(started.elapsed());
                debug!(keys = keys.len(), removed, "cache delete");
                removed
            }
            Err(_) => 0,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let started = Instant::now();
        let result = self
            .call("exists", |backend| async move { backend.exists(key).await })
            .await;
        self.observe("exists", key, started, result).unwrap_or(false)
    }

    /// Remaining TTL in seconds; `-1` without expiry, `-2` when absent or on failure.
    pub async fn ttl(&self, key: &str) -> i64 {
        let started = Instant::now();
        let result = self
            .call("ttl", |backend| async move { backend.ttl(key).await })
            .await;
        self.observe("ttl", key, started, result)
            .unwrap_or(TTL_MISSING)
    }

    /// Attach a TTL to an existing key. The TTL is clamped like a write.
    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let ttl = self.config.effective_ttl(Some(ttl));
        let started = Instant::now();
        let result = self
            .call("expire", |backend| async move { backend.expire(key, ttl).await })
            .await;
        self.observe("expire", key, started, result)
            .unwrap_or(false)
    }

    /// Keys matching a glob pattern.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.try_keys(pattern).await.unwrap_or_default()
    }

    pub(crate) async fn try_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let started = Instant::now();
        let result = self
            .call("keys", |backend| async move { backend.scan(pattern).await })
            .await;
        self.observe("keys", pattern, started, result)
    }

    /// Delete every key matching `pattern`.
    ///
    /// Scan then delete: keys written between the two steps may survive, and
    /// keys removed concurrently are simply not counted.
    pub async fn flush_pattern(&self, pattern: &str) -> u64 {
        let Ok(keys) = self.try_keys(pattern).await else {
            return 0;
        };
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            removed += self.delete(chunk).await;
        }
        if removed > 0 {
            info!(pattern, removed, "flushed cache pattern");
        }
        removed
    }

    /// Clear the whole logical database. Callers must gate this behind confirmation.
    pub async fn flush_all(&self) -> bool {
        let started = Instant::now();
        let result = self
            .call("flush_all", |backend| async move { backend.flush_all().await })
            .await;
        let flushed = self.observe("flush_all", "*", started, result).is_ok();
        if flushed {
            warn!("flushed entire cache database");
        }
        flushed
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Store-reported statistics, or `None` when unavailable.
    pub async fn info(&self) -> Option<StoreInfoPayload> {
        let started = Instant::now();
        let result = self
            .call("info", |backend| async move { backend.info().await })
            .await;
        self.observe("info", "*", started, result).ok()
    }

    /// Number of keys under each reserved prefix.
    pub async fn key_count_by_prefix(&self) -> BTreeMap<String, u64> {
        let prefixes = EntityKind::ALL
            .iter()
            .map(|kind| kind.prefix())
            .chain([BATCH_PREFIX]);

        let mut counts = BTreeMap::new();
        for prefix in prefixes {
            let matched = self.keys(&CacheKey::prefix_pattern(prefix)).await;
            counts.insert(prefix.to_string(), matched.len() as u64);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;

    fn store() -> CacheStore {
        CacheStore::with_backend(CacheConfig::memory(), Arc::new(MemoryBackend::new(64)))
    }

    #[tokio::test]
    async fn operations_before_connect_degrade() {
        let store = store();
        assert!(!store.is_connected());
        assert_eq!(store.get::<String>("k").await, None);
        assert!(!store.set("k", &"v".to_string(), None).await);
        assert_eq!(store.delete(&["k"]).await, 0);
        assert_eq!(store.ttl("k").await, TTL_MISSING);
        assert_eq!(store.metrics().errors(), 4);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let store = store();
        store.connect().await.expect("first connect");
        store.connect().await.expect("second connect");
        assert!(store.is_connected());

        store.disconnect().await;
        assert!(!store.is_connected());
        store.disconnect().await;
    }

    #[tokio::test]
    async fn null_marker_reads_as_absent_hit() {
        let store = store();
        store.connect().await.expect("connect");
        assert!(store.set_none("user:404", None).await);

        let cached = store.lookup::<String>("user:404").await;
        assert_eq!(cached, Cached::Absent);
        assert_eq!(store.metrics().hits(), 1);
        assert_eq!(store.get_or("user:404", "fallback".to_string()).await, "fallback");
    }

    #[tokio::test]
    async fn conditional_writes() {
        let store = store();
        store.connect().await.expect("connect");

        let ttl = Duration::from_secs(60);
        assert!(!store.set_with("k", &1_i64, SetOptions::ttl(ttl).if_present()).await);
        assert!(store.set_with("k", &1_i64, SetOptions::ttl(ttl).if_absent()).await);
        assert!(!store.set_with("k", &2_i64, SetOptions::ttl(ttl).if_absent()).await);
        assert!(store.set_with("k", &3_i64, SetOptions::ttl(ttl).if_present()).await);
        assert_eq!(store.get::<i64>("k").await, Some(3));
        assert_eq!(store.metrics().sets(), 2);
    }

    #[tokio::test]
    async fn corrupted_entries_degrade_to_miss() {
        let backend = Arc::new(MemoryBackend::new(8));
        backend
            .set("k", b"garbage".to_vec(), Duration::from_secs(60), SetCondition::Always)
            .await
            .expect("seed");
        let store = CacheStore::with_backend(CacheConfig::memory(), backend);
        store.connect().await.expect("connect");

        assert_eq!(store.get::<String>("k").await, None);
        assert_eq!(store.metrics().errors(), 1);
        assert_eq!(store.metrics().misses(), 0);
    }

    #[tokio::test]
    async fn get_many_returns_only_hits() {
        let store = store();
        store.connect().await.expect("connect");
        store.set("user:1", &"ada".to_string(), None).await;
        store.set("user:2", &"grace".to_string(), None).await;

        let keys = vec!["user:1".to_string(), "user:2".to_string(), "user:3".to_string()];
        let found = store.get_many::<String>(&keys).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["user:2"], "grace");
        assert_eq!(store.metrics().hits(), 2);
        assert_eq!(store.metrics().misses(), 1);
    }

    #[tokio::test]
    async fn set_many_counts_successful_writes() {
        let store = store();
        store.connect().await.expect("connect");
        let entries = vec![
            ("label:1".to_string(), 1_i64),
            ("label:2".to_string(), 2_i64),
        ];
        assert_eq!(store.set_many(&entries, None).await, 2);
        assert!(store.exists("label:2").await);
    }

    #[tokio::test]
    async fn key_counts_cover_reserved_prefixes() {
        let store = store();
        store.connect().await.expect("connect");
        store.set("user:1", &1_i64, None).await;
        store.set("user:2", &1_i64, None).await;
        store.set("batch:import:1700000000", &1_i64, None).await;

        let counts = store.key_count_by_prefix().await;
        assert_eq!(counts["user"], 2);
        assert_eq!(counts["project"], 0);
        assert_eq!(counts["batch"], 1);
    }
}
