//! Periodic cache maintenance.
//!
//! The worker owns no connection of its own: it shares the manager's store
//! with request traffic and closes it only as the last step of shutdown.
//!
//! Lifecycle: `stopped -> initializing -> running -> stopping -> stopped`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anno_cache_api_types::{HealthPayload, HealthState, MetricsPayload, StoreInfoPayload};
use async_trait::async_trait;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::keys::{BATCH_PREFIX, CacheKey, EntityKind, STATS_KEY};
use super::lock::mutex_lock;
use super::manager::CacheManager;
use super::metrics::METRIC_MAINTENANCE_MS;
use super::serializer::{CacheValue, Encoding};

const SOURCE: &str = "cache::worker";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_WARM_LIMIT: usize = 50;
pub const DEFAULT_BATCH_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_STATS_TTL: Duration = Duration::from_secs(5 * 60);

pub type WarmSourceError = Box<dyn std::error::Error + Send + Sync>;

/// Source of truth consulted when warming.
#[async_trait]
pub trait WarmSource: Send + Sync {
    /// Ids of recently active entities, most valuable first.
    async fn recent_ids(&self, kind: EntityKind, limit: usize) -> Result<Vec<String>, WarmSourceError>;

    async fn load(
        &self,
        kind: EntityKind,
        ids: Vec<String>,
    ) -> Result<HashMap<String, serde_json::Value>, WarmSourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Initializing,
    Running,
    Stopping,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Initializing => "initializing",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub warm_on_start: bool,
    /// Entities per kind warmed by each cycle.
    pub warm_limit: usize,
    /// `batch:` keys whose embedded timestamp is older than this are removed.
    pub batch_retention: Duration,
    pub stats_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            warm_on_start: false,
            warm_limit: DEFAULT_WARM_LIMIT,
            batch_retention: DEFAULT_BATCH_RETENTION,
            stats_ttl: DEFAULT_STATS_TTL,
        }
    }
}

impl From<&crate::config::WorkerSettings> for WorkerConfig {
    fn from(settings: &crate::config::WorkerSettings) -> Self {
        Self {
            interval: settings.interval,
            warm_on_start: settings.warm_on_start,
            warm_limit: settings.warm_batch_size.get(),
            batch_retention: settings.batch_retention,
            stats_ttl: settings.stats_ttl,
        }
    }
}

/// Aggregate statistics written to [`STATS_KEY`] for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub recorded_at: i64,
    pub metrics: MetricsPayload,
    pub store: Option<StoreInfoPayload>,
    pub key_counts: BTreeMap<String, u64>,
}

impl CacheValue for StatsSnapshot {
    const ENCODING: Encoding = Encoding::Json;
}

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub warmed: usize,
    pub cleaned: u64,
    pub stats_written: bool,
    /// Steps that failed; the remaining steps still ran.
    pub failed_steps: Vec<&'static str>,
}

struct WorkerInner {
    manager: CacheManager,
    config: WorkerConfig,
    source: Option<Arc<dyn WarmSource>>,
    state: Mutex<WorkerState>,
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct BackgroundWorker {
    inner: Arc<WorkerInner>,
    running: Mutex<Option<RunningTask>>,
}

impl BackgroundWorker {
    pub fn new(manager: CacheManager, config: WorkerConfig) -> Self {
        Self::build(manager, config, None)
    }

    pub fn with_source(
        manager: CacheManager,
        config: WorkerConfig,
        source: Arc<dyn WarmSource>,
    ) -> Self {
        Self::build(manager, config, Some(source))
    }

    fn build(
        manager: CacheManager,
        config: WorkerConfig,
        source: Option<Arc<dyn WarmSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                manager,
                config,
                source,
                state: Mutex::new(WorkerState::Stopped),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state()
    }

    pub fn manager(&self) -> &CacheManager {
        &self.inner.manager
    }

    /// Connect, probe, and optionally warm.
    ///
    /// A connection failure is returned so the caller can decide whether to
    /// continue without a cache; the worker is left stopped.
    pub async fn initialize(&self) -> Result<HealthPayload, CacheError> {
        self.inner.set_state(WorkerState::Initializing);

        if let Err(err) = self.inner.manager.store().connect().await {
            warn!(error = %err, "cache worker could not connect");
            self.inner.set_state(WorkerState::Stopped);
            return Err(err);
        }

        let health = self.inner.manager.health_check().await;
        if health.status == HealthState::Unhealthy {
            warn!(reason = health.reason.as_deref().unwrap_or("unknown"), "cache health check failed");
        }

        if self.inner.config.warm_on_start {
            let warmed = self.inner.warm().await.unwrap_or_else(|partial| partial);
            info!(warmed, "initial cache warm finished");
        }
        Ok(health)
    }

    /// Initialize if needed, then run maintenance on the configured interval.
    pub async fn start(&self) -> Result<(), CacheError> {
        match self.state() {
            WorkerState::Running | WorkerState::Stopping => return Ok(()),
            WorkerState::Stopped => {
                self.initialize().await?;
            }
            WorkerState::Initializing => {}
        }

        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), signal));
        *mutex_lock(&self.running, SOURCE, "start") = Some(RunningTask { shutdown, handle });

        self.inner.set_state(WorkerState::Running);
        info!(
            interval_secs = self.inner.config.interval.as_secs(),
            "cache worker running"
        );
        Ok(())
    }

    /// One maintenance cycle, run inline.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle().await
    }

    /// Stop the loop and close the store. Safe in any state.
    pub async fn shutdown(&self) {
        self.inner.set_state(WorkerState::Stopping);

        let running = mutex_lock(&self.running, SOURCE, "shutdown").take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.handle.await {
                warn!(error = %err, "cache worker task ended abnormally");
            }
        }

        self.inner.manager.store().disconnect().await;
        self.inner.set_state(WorkerState::Stopped);
        info!("cache worker stopped");
    }
}

async fn run_loop(inner: Arc<WorkerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip the first immediate tick

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        tokio::select! {
            report = inner.run_cycle() => debug!(
                warmed = report.warmed,
                cleaned = report.cleaned,
                stats_written = report.stats_written,
                failed = report.failed_steps.len(),
                "maintenance cycle finished"
            ),
            _ = shutdown.changed() => {
                info!("maintenance cycle cancelled by shutdown");
                break;
            }
        }
    }
}

impl WorkerInner {
    fn state(&self) -> WorkerState {
        *mutex_lock(&self.state, SOURCE, "state")
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = mutex_lock(&self.state, SOURCE, "set_state");
        if *state != next {
            debug!(from = state.as_str(), to = next.as_str(), "cache worker state change");
            *state = next;
        }
    }

    async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        match self.warm().await {
            Ok(warmed) => report.warmed = warmed,
            Err(partial) => {
                report.warmed = partial;
                report.failed_steps.push("warm");
            }
        }
        match self.clean_batch_keys().await {
            Ok(cleaned) => report.cleaned = cleaned,
            Err(()) => report.failed_steps.push("cleanup"),
        }
        match self.write_stats().await {
            Ok(()) => report.stats_written = true,
            Err(()) => report.failed_steps.push("stats"),
        }

        histogram!(METRIC_MAINTENANCE_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        report
    }

    /// Warm recently active projects and users from the source, if any.
    ///
    /// A kind whose ids cannot be listed is skipped; the error carries the
    /// count warmed for the other kinds.
    async fn warm(&self) -> Result<usize, usize> {
        let Some(source) = &self.source else {
            debug!("no warm source configured; skipping warm");
            return Ok(0);
        };

        let mut warmed = 0;
        let mut failed = false;
        for kind in [EntityKind::Project, EntityKind::User] {
            let ids = match source.recent_ids(kind, self.config.warm_limit).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(entity = %kind, error = %err, "could not list entities to warm");
                    failed = true;
                    continue;
                }
            };
            let loader = |batch: Vec<String>| {
                let source = Arc::clone(source);
                async move { source.load(kind, batch).await }
            };
            warmed += self.manager.warm_entities(kind, &ids, loader).await;
        }

        if failed { Err(warmed) } else { Ok(warmed) }
    }

    /// Delete `batch:<id>:<ts>` keys older than the retention window.
    async fn clean_batch_keys(&self) -> Result<u64, ()> {
        let store = self.manager.store();
        let keys = store
            .try_keys(&CacheKey::prefix_pattern(BATCH_PREFIX))
            .await
            .map_err(|_| ())?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let retention = i64::try_from(self.config.batch_retention.as_secs()).unwrap_or(i64::MAX);
        let expired: Vec<String> = keys
            .into_iter()
            .filter(|key| batch_timestamp(key).is_some_and(|ts| now.saturating_sub(ts) > retention))
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }
        let removed = store.delete(&expired).await;
        info!(removed, "removed expired batch bookkeeping keys");
        Ok(removed)
    }

    async fn write_stats(&self) -> Result<(), ()> {
        let store = self.manager.store();
        let snapshot = StatsSnapshot {
            recorded_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            metrics: store.metrics().snapshot(),
            store: store.info().await,
            key_counts: store.key_count_by_prefix().await,
        };
        if store
            .set(STATS_KEY, &snapshot, Some(self.config.stats_ttl))
            .await
        {
            Ok(())
        } else {
            Err(())
        }
    }
}

/// Unix timestamp embedded as the last segment of a `batch:<id>:<ts>` key.
fn batch_timestamp(key: &str) -> Option<i64> {
    let (head, ts) = key.rsplit_once(':')?;
    if !head.contains(':') {
        return None;
    }
    ts.parse::<i64>().ok()
}
