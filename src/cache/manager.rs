//! Domain-aware cache-aside helpers.
//!
//! One generic implementation per operation, keyed by [`EntityKind`], with
//! thin per-entity wrappers. Cascade lists are fixed per entity so every
//! invalidation fan-out is visible in [`cascade_targets`].

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anno_cache_api_types::{HealthPayload, HealthState};
use futures::future::join_all;
use metrics::histogram;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keys::{
    BATCH_PREFIX, CacheKey, EntityKind, HEALTH_PROBE_PREFIX, PROJECT_PREFIX, QUERY_PREFIX,
    QueryParams,
};
use super::metrics::METRIC_WARM_MS;
use super::serializer::CacheValue;
use super::store::{Cached, CacheStore};

pub const DEFAULT_WARM_BATCH_SIZE: usize = 50;
pub const DEFAULT_WARM_PAUSE: Duration = Duration::from_millis(100);

/// TTL of `batch:<id>:<ts>` bookkeeping entries.
pub const BATCH_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const HEALTH_PROBE_TTL: Duration = Duration::from_secs(10);

/// Exact keys and glob patterns removed by one invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeTargets {
    pub keys: Vec<String>,
    pub patterns: Vec<String>,
}

/// Dependent keys for an entity. `project_id` only matters for annotations.
pub fn cascade_targets(kind: EntityKind, id: &str, project_id: Option<&str>) -> CascadeTargets {
    let own = kind.key(id);
    let child = |suffix: &str| CacheKey::builder(kind.prefix()).arg(id).arg(suffix).build();
    let query_ref = |name: &str| CacheKey::pattern(QUERY_PREFIX, &format!("*{name}:{id}*"));

    match kind {
        EntityKind::User => CascadeTargets {
            keys: vec![own, child("projects"), child("permissions")],
            patterns: vec![query_ref("user_id")],
        },
        EntityKind::Project => CascadeTargets {
            keys: vec![
                own,
                child("stats"),
                child("users"),
                child("annotations"),
                child("labels"),
            ],
            patterns: vec![query_ref("project_id")],
        },
        EntityKind::Annotation => {
            let mut keys = vec![own];
            if let Some(project_id) = project_id {
                let project = |suffix: &str| {
                    CacheKey::builder(PROJECT_PREFIX)
                        .arg(project_id)
                        .arg(suffix)
                        .build()
                };
                keys.push(project("annotations"));
                keys.push(project("stats"));
            }
            CascadeTargets {
                keys,
                patterns: Vec::new(),
            }
        }
        EntityKind::Label => CascadeTargets {
            keys: vec![own],
            patterns: vec![CacheKey::pattern(QUERY_PREFIX, "*label*")],
        },
        EntityKind::Query => CascadeTargets {
            keys: vec![own],
            patterns: Vec::new(),
        },
    }
}

#[derive(Clone)]
pub struct CacheManager {
    store: Arc<CacheStore>,
    warm_batch_size: usize,
    warm_pause: Duration,
}

impl CacheManager {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self::with_warm_policy(store, DEFAULT_WARM_BATCH_SIZE, DEFAULT_WARM_PAUSE)
    }

    pub fn with_warm_policy(store: Arc<CacheStore>, batch_size: usize, pause: Duration) -> Self {
        Self {
            store,
            warm_batch_size: batch_size.max(1),
            warm_pause: pause,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    // ========================================================================
    // Generic cache-aside
    // ========================================================================

    /// Cached value of one entity, loading and caching it on miss.
    ///
    /// A `None` from the loader is only cached when `cache_none` is set; the
    /// loader's own error is returned untouched and nothing is cached.
    pub async fn get_entity<T, F, Fut, E>(
        &self,
        kind: EntityKind,
        id: impl Display,
        loader: F,
        cache_none: bool,
    ) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let key = kind.key(id);
        self.get_or_load(&key, kind.default_ttl(), loader, cache_none)
            .await
    }

    async fn get_or_load<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
        cache_none: bool,
    ) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        match self.store.lookup::<T>(key).await {
            Cached::Hit(value) => return Ok(Some(value)),
            Cached::Absent => return Ok(None),
            Cached::Miss => {}
        }

        let loaded = loader().await?;
        match &loaded {
            Some(value) => {
                self.store.set(key, value, Some(ttl)).await;
            }
            None if cache_none => {
                self.store.set_none(key, Some(ttl)).await;
            }
            None => debug!(key, "loader returned nothing; not cached"),
        }
        Ok(loaded)
    }

    /// Cached value of one entity without loading.
    pub async fn peek_entity<T: CacheValue>(&self, kind: EntityKind, id: impl Display) -> Option<T> {
        self.store.get(&kind.key(id)).await
    }

    /// Write-through after a create or update.
    pub async fn set_entity<T: CacheValue>(
        &self,
        kind: EntityKind,
        id: impl Display,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let ttl = ttl.unwrap_or_else(|| kind.default_ttl());
        self.store.set(&kind.key(id), value, Some(ttl)).await
    }

    /// Remove an entity's key and, with `cascade`, its fixed dependents.
    pub async fn invalidate_entity(&self, kind: EntityKind, id: impl Display, cascade: bool) -> bool {
        self.invalidate_counted(kind, &id.to_string(), None, cascade)
            .await
            > 0
    }

    /// Same as [`Self::invalidate_entity`], returning how many keys went away.
    pub(crate) async fn invalidate_counted(
        &self,
        kind: EntityKind,
        id: &str,
        project_id: Option<&str>,
        cascade: bool,
    ) -> u64 {
        let targets = cascade_targets(kind, id, project_id);
        if !cascade {
            return self.store.delete(&targets.keys[..1]).await;
        }

        let mut removed = self.store.delete(&targets.keys).await;
        for pattern in &targets.patterns {
            removed += self.store.flush_pattern(pattern).await;
        }
        debug!(entity = %kind, id, removed, "cascade invalidation");
        removed
    }

    /// Cached values for many ids; the loader runs once for all misses.
    pub async fn get_entities_batch<I, T, F, Fut, E>(
        &self,
        kind: EntityKind,
        ids: &[I],
        loader: F,
    ) -> Result<HashMap<I, T>, E>
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: FnOnce(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
    {
        let keys: Vec<String> = ids.iter().map(|id| kind.key(id)).collect();
        let mut cached = self.store.get_many::<T>(&keys).await;

        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for (id, key) in ids.iter().zip(&keys) {
            match cached.remove(key) {
                Some(value) => {
                    found.insert(id.clone(), value);
                }
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let loaded = loader(missing).await?;
        self.write_entities(kind, &loaded, None).await;
        found.extend(loaded);
        Ok(found)
    }

    /// Concurrent write of loaded entities. Returns how many were stored.
    async fn write_entities<I, T>(
        &self,
        kind: EntityKind,
        entities: &HashMap<I, T>,
        ttl: Option<Duration>,
    ) -> usize
    where
        I: Display,
        T: CacheValue,
    {
        let ttl = ttl.unwrap_or_else(|| kind.default_ttl());
        let keys: Vec<String> = entities.keys().map(|id| kind.key(id)).collect();
        let writes = keys
            .iter()
            .zip(entities.values())
            .map(|(key, value)| self.store.set(key, value, Some(ttl)));
        join_all(writes).await.into_iter().filter(|ok| *ok).count()
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub async fn get_user<T, F, Fut, E>(&self, id: impl Display, loader: F) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        self.get_entity(EntityKind::User, id, loader, false).await
    }

    pub async fn set_user<T: CacheValue>(&self, id: impl Display, user: &T, ttl: Option<Duration>) -> bool {
        self.set_entity(EntityKind::User, id, user, ttl).await
    }

    pub async fn invalidate_user(&self, id: impl Display, cascade: bool) -> bool {
        self.invalidate_entity(EntityKind::User, id, cascade).await
    }

    pub async fn get_users_batch<I, T, F, Fut, E>(&self, ids: &[I], loader: F) -> Result<HashMap<I, T>, E>
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: FnOnce(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
    {
        self.get_entities_batch(EntityKind::User, ids, loader).await
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub async fn get_project<T, F, Fut, E>(&self, id: impl Display, loader: F) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        self.get_entity(EntityKind::Project, id, loader, false).await
    }

    pub async fn set_project<T: CacheValue>(
        &self,
        id: impl Display,
        project: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_entity(EntityKind::Project, id, project, ttl).await
    }

    pub async fn invalidate_project(&self, id: impl Display, cascade: bool) -> bool {
        self.invalidate_entity(EntityKind::Project, id, cascade).await
    }

    pub async fn get_projects_batch<I, T, F, Fut, E>(
        &self,
        ids: &[I],
        loader: F,
    ) -> Result<HashMap<I, T>, E>
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: FnOnce(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
    {
        self.get_entities_batch(EntityKind::Project, ids, loader)
            .await
    }

    // ========================================================================
    // Annotations
    // ========================================================================

    pub async fn get_annotation<T, F, Fut, E>(
        &self,
        id: impl Display,
        loader: F,
    ) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        self.get_entity(EntityKind::Annotation, id, loader, false)
            .await
    }

    pub async fn set_annotation<T: CacheValue>(
        &self,
        id: impl Display,
        annotation: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_entity(EntityKind::Annotation, id, annotation, ttl)
            .await
    }

    /// With `cascade` and a `project_id`, the project's annotation list and
    /// stats are dropped as well.
    pub async fn invalidate_annotation(
        &self,
        id: impl Display,
        project_id: Option<&str>,
        cascade: bool,
    ) -> bool {
        self.invalidate_counted(EntityKind::Annotation, &id.to_string(), project_id, cascade)
            .await
            > 0
    }

    pub async fn get_annotations_batch<I, T, F, Fut, E>(
        &self,
        ids: &[I],
        loader: F,
    ) -> Result<HashMap<I, T>, E>
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: FnOnce(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
    {
        self.get_entities_batch(EntityKind::Annotation, ids, loader)
            .await
    }

    // ========================================================================
    // Labels
    // ========================================================================

    pub async fn get_label<T, F, Fut, E>(&self, id: impl Display, loader: F) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        self.get_entity(EntityKind::Label, id, loader, false).await
    }

    pub async fn set_label<T: CacheValue>(&self, id: impl Display, label: &T, ttl: Option<Duration>) -> bool {
        self.set_entity(EntityKind::Label, id, label, ttl).await
    }

    pub async fn invalidate_label(&self, id: impl Display, cascade: bool) -> bool {
        self.invalidate_entity(EntityKind::Label, id, cascade).await
    }

    pub async fn get_labels_batch<I, T, F, Fut, E>(&self, ids: &[I], loader: F) -> Result<HashMap<I, T>, E>
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: FnOnce(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
    {
        self.get_entities_batch(EntityKind::Label, ids, loader).await
    }

    // ========================================================================
    // Query results
    // ========================================================================

    /// Key of a named, parameterised query: `query:<name>:<param>:<value>...`.
    pub fn query_key(name: &str, params: &QueryParams) -> String {
        CacheKey::builder(QUERY_PREFIX)
            .arg(name)
            .params(params)
            .build()
    }

    pub async fn get_query_result<T, F, Fut, E>(
        &self,
        name: &str,
        params: &QueryParams,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<Option<T>, E>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let key = Self::query_key(name, params);
        let ttl = ttl.unwrap_or_else(|| EntityKind::Query.default_ttl());
        self.get_or_load(&key, ttl, loader, false).await
    }

    /// Flush cached query results matching `pattern` (the `query:` prefix is implied).
    pub async fn invalidate_query_cache(&self, pattern: &str) -> u64 {
        let pattern = if pattern.starts_with("query:") {
            pattern.to_string()
        } else {
            CacheKey::pattern(QUERY_PREFIX, pattern)
        };
        self.store.flush_pattern(&pattern).await
    }

    // ========================================================================
    // Warming
    // ========================================================================

    pub async fn warm_user_cache<I, T, F, Fut, E>(&self, ids: &[I], loader: F) -> usize
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
        E: Display,
    {
        self.warm_entities(EntityKind::User, ids, loader).await
    }

    pub async fn warm_project_cache<I, T, F, Fut, E>(&self, ids: &[I], loader: F) -> usize
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
        E: Display,
    {
        self.warm_entities(EntityKind::Project, ids, loader).await
    }

    /// Load `ids` in sub-batches and cache every returned entity.
    ///
    /// A failing sub-batch is logged and skipped. Returns how many entries were stored.
    pub async fn warm_entities<I, T, F, Fut, E>(&self, kind: EntityKind, ids: &[I], loader: F) -> usize
    where
        I: Display + Eq + Hash + Clone,
        T: CacheValue,
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<HashMap<I, T>, E>>,
        E: Display,
    {
        let started = Instant::now();
        let mut warmed = 0;

        for (index, chunk) in ids.chunks(self.warm_batch_size).enumerate() {
            if index > 0 && !self.warm_pause.is_zero() {
                tokio::time::sleep(self.warm_pause).await;
            }
            match loader(chunk.to_vec()).await {
                Ok(entities) => warmed += self.write_entities(kind, &entities, None).await,
                Err(err) => warn!(
                    entity = %kind,
                    batch = index,
                    size = chunk.len(),
                    error = %err,
                    "cache warm batch failed; skipping"
                ),
            }
        }

        histogram!(METRIC_WARM_MS, "entity" => kind.prefix())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        info!(entity = %kind, requested = ids.len(), warmed, "cache warm finished");
        warmed
    }

    // ========================================================================
    // Health and bookkeeping
    // ========================================================================

    /// Write, read back and delete a throwaway probe key.
    pub async fn health_check(&self) -> HealthPayload {
        let started = Instant::now();
        let unhealthy = |reason: &str| HealthPayload {
            status: HealthState::Unhealthy,
            reason: Some(reason.to_string()),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        if !self.store.is_connected() {
            return unhealthy("cache store is not connected");
        }

        let key = CacheKey::builder(HEALTH_PROBE_PREFIX)
            .arg(Uuid::new_v4())
            .build();
        let token = Uuid::new_v4().to_string();

        if !self.store.set(&key, &token, Some(HEALTH_PROBE_TTL)).await {
            return unhealthy("probe write failed");
        }
        if self.store.get::<String>(&key).await.as_deref() != Some(token.as_str()) {
            self.store.delete(&[&key]).await;
            return unhealthy("probe read returned an unexpected value");
        }
        if self.store.delete(&[&key]).await != 1 {
            return unhealthy("probe delete failed");
        }

        HealthPayload {
            status: HealthState::Healthy,
            reason: None,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Record a batch operation under `batch:<id>:<unix_ts>`.
    pub async fn record_batch_operation<T: CacheValue>(&self, id: impl Display, payload: &T) -> bool {
        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
        let key = CacheKey::builder(BATCH_PREFIX)
            .arg(id)
            .arg(timestamp)
            .build();
        self.store.set(&key, payload, Some(BATCH_RECORD_TTL)).await
    }
}
