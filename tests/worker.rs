mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anno_cache::cache::{
    BackgroundWorker, CacheConfig, CacheManager, CacheStore, EntityKind, STATS_KEY, StatsSnapshot,
    WarmSource, WarmSourceError, WorkerConfig, WorkerState,
};
use anno_cache_api_types::HealthState;
use async_trait::async_trait;
use serde_json::json;
use support::{flaky_store, memory_manager};

/// Source of truth with two recent entities per kind; projects fail to list when asked.
#[derive(Default)]
struct RecentEntities {
    fail_projects: bool,
    loads: AtomicUsize,
}

#[async_trait]
impl WarmSource for RecentEntities {
    async fn recent_ids(&self, kind: EntityKind, limit: usize) -> Result<Vec<String>, WarmSourceError> {
        if self.fail_projects && kind == EntityKind::Project {
            return Err("projects table locked".into());
        }
        Ok(["1", "2"].into_iter().take(limit).map(String::from).collect())
    }

    async fn load(
        &self,
        kind: EntityKind,
        ids: Vec<String>,
    ) -> Result<HashMap<String, serde_json::Value>, WarmSourceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ids
            .into_iter()
            .map(|id| {
                let value = json!({ "kind": kind.prefix(), "id": id });
                (id, value)
            })
            .collect())
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[tokio::test]
async fn lifecycle_moves_through_states() {
    let worker = BackgroundWorker::new(memory_manager().await, WorkerConfig::default());
    assert_eq!(worker.state(), WorkerState::Stopped);

    worker.start().await.expect("memory store starts");
    assert_eq!(worker.state(), WorkerState::Running);

    worker.start().await.expect("second start is a no-op");
    assert_eq!(worker.state(), WorkerState::Running);

    worker.shutdown().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(!worker.manager().store().is_connected());
}

#[tokio::test]
async fn initialize_reports_health() {
    let store = Arc::new(CacheStore::new(CacheConfig::memory()));
    let worker = BackgroundWorker::new(CacheManager::new(store), WorkerConfig::default());

    let health = worker.initialize().await.expect("memory store connects");
    assert_eq!(health.status, HealthState::Healthy);
    assert_eq!(worker.state(), WorkerState::Initializing);
}

#[tokio::test]
async fn shutdown_is_safe_without_initialize() {
    let store = Arc::new(CacheStore::new(CacheConfig::memory()));
    let worker = BackgroundWorker::new(CacheManager::new(store), WorkerConfig::default());

    worker.shutdown().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn connect_failure_leaves_worker_stopped() {
    let store = Arc::new(CacheStore::new(CacheConfig {
        port: 1,
        socket_connect_timeout: Duration::from_millis(500),
        ..CacheConfig::default()
    }));
    let worker = BackgroundWorker::new(CacheManager::new(store), WorkerConfig::default());

    assert!(worker.start().await.is_err());
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn cycle_removes_expired_batch_keys_only() {
    let manager = memory_manager().await;
    let store = Arc::clone(manager.store());
    let stale = format!("batch:import-1:{}", unix_now() - 25 * 3_600);
    let fresh = format!("batch:import-2:{}", unix_now() - 3_600);
    store.set(&stale, &"done".to_string(), None).await;
    store.set(&fresh, &"done".to_string(), None).await;
    store.set("batch:unversioned", &"done".to_string(), None).await;
    store.set("batch:17", &"done".to_string(), None).await;

    let worker = BackgroundWorker::new(manager, WorkerConfig::default());
    let report = worker.run_cycle().await;

    assert_eq!(report.cleaned, 1);
    assert!(report.failed_steps.is_empty());
    assert!(!store.exists(&stale).await);
    assert!(store.exists(&fresh).await);
    assert!(store.exists("batch:unversioned").await);
    assert!(store.exists("batch:17").await);
}

#[tokio::test]
async fn cycle_writes_statistics_snapshot() {
    let manager = memory_manager().await;
    let store = Arc::clone(manager.store());
    store.set("user:1", &"ada".to_string(), None).await;

    let worker = BackgroundWorker::new(
        manager,
        WorkerConfig {
            stats_ttl: Duration::from_secs(120),
            ..WorkerConfig::default()
        },
    );
    let report = worker.run_cycle().await;
    assert!(report.stats_written);

    let snapshot = store
        .get::<StatsSnapshot>(STATS_KEY)
        .await
        .expect("snapshot stored");
    assert_eq!(snapshot.key_counts["user"], 1);
    assert!(snapshot.store.is_some());
    let ttl = store.ttl(STATS_KEY).await;
    assert!((119..=120).contains(&ttl), "ttl was {ttl}");
}

#[tokio::test]
async fn cycle_warms_from_source() {
    let manager = memory_manager().await;
    let store = Arc::clone(manager.store());
    let source = Arc::new(RecentEntities::default());
    let worker = BackgroundWorker::with_source(manager, WorkerConfig::default(), source.clone());

    let report = worker.run_cycle().await;
    assert_eq!(report.warmed, 4);
    assert!(store.exists("project:1").await);
    assert!(store.exists("user:2").await);
    assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    let cached = store
        .get::<serde_json::Value>("project:2")
        .await
        .expect("warmed entry");
    assert_eq!(cached["kind"], "project");
}

#[tokio::test]
async fn failing_step_does_not_abort_cycle() {
    let manager = memory_manager().await;
    let store = Arc::clone(manager.store());
    let source = Arc::new(RecentEntities {
        fail_projects: true,
        ..RecentEntities::default()
    });
    let worker = BackgroundWorker::with_source(manager, WorkerConfig::default(), source);

    let report = worker.run_cycle().await;
    assert_eq!(report.failed_steps, vec!["warm"]);
    assert_eq!(report.warmed, 2);
    assert!(report.stats_written);
    assert!(store.exists("user:1").await);
    assert!(!store.exists("project:1").await);
}

#[tokio::test]
async fn broken_store_fails_steps_but_not_the_worker() {
    let (store, backend) = flaky_store().await;
    let worker = BackgroundWorker::new(CacheManager::new(store), WorkerConfig::default());
    backend.set_broken(true);

    let report = worker.run_cycle().await;
    assert_eq!(report.failed_steps, vec!["cleanup", "stats"]);
}

#[tokio::test(start_paused = true)]
async fn running_worker_cycles_on_interval() {
    let manager = memory_manager().await;
    let store = Arc::clone(manager.store());
    let worker = BackgroundWorker::new(
        manager,
        WorkerConfig {
            interval: Duration::from_secs(60),
            ..WorkerConfig::default()
        },
    );

    worker.start().await.expect("memory store starts");
    assert!(!store.exists(STATS_KEY).await);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(store.exists(STATS_KEY).await);

    worker.shutdown().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
}
