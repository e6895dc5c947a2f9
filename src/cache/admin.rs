//! Administrative cache operations.
//!
//! Transport-agnostic: an HTTP layer maps each method onto a route and
//! renders [`ErrorPayload`] for failures.

use std::sync::Arc;
use std::time::Instant;

use anno_cache_api_types::{
    ErrorPayload, FlushRequest, FlushResponse, HealthPayload, HealthState, InvalidateRequest,
    InvalidateResponse, KeyEntry, KeysQuery, KeysResponse, PatternResult, PingResponse,
    StatisticsResponse, WarmAck, WarmRequest,
};
use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::CacheError;
use super::keys::EntityKind;
use super::manager::CacheManager;
use super::worker::WarmSource;

/// Flush pattern that clears the whole store.
pub const FLUSH_ALL: &str = "all";

const GLOB_CHARS: &[char] = &['*', '?', '['];

impl From<&CacheError> for ErrorPayload {
    fn from(err: &CacheError) -> Self {
        ErrorPayload::new(err.to_string())
    }
}

#[derive(Clone)]
pub struct CacheAdmin {
    manager: CacheManager,
    source: Option<Arc<dyn WarmSource>>,
}

impl CacheAdmin {
    pub fn new(manager: CacheManager) -> Self {
        Self {
            manager,
            source: None,
        }
    }

    /// Admin surface able to serve warm requests from `source`.
    pub fn with_source(manager: CacheManager, source: Arc<dyn WarmSource>) -> Self {
        Self {
            manager,
            source: Some(source),
        }
    }

    pub async fn statistics(&self) -> StatisticsResponse {
        let store = self.manager.store();
        StatisticsResponse {
            metrics: store.metrics().snapshot(),
            store: store.info().await,
            key_counts: store.key_count_by_prefix().await,
            health: self.manager.health_check().await,
        }
    }

    pub async fn health(&self) -> HealthPayload {
        self.manager.health_check().await
    }

    /// Flush each pattern. With `cascade`, a plain entity key such as
    /// `project:42` expands to that entity's dependent keys.
    pub async fn invalidate(&self, request: &InvalidateRequest) -> InvalidateResponse {
        let mut results = Vec::with_capacity(request.patterns.len());
        for pattern in &request.patterns {
            let deleted = match cascade_entity(pattern).filter(|_| request.cascade) {
                Some((kind, id)) => {
                    self.manager
                        .invalidate_counted(kind, id, None, true)
                        .await
                }
                None => self.manager.store().flush_pattern(pattern).await,
            };
            results.push(PatternResult {
                pattern: pattern.clone(),
                deleted,
            });
        }

        let total_deleted: u64 = results.iter().map(|result| result.deleted).sum();
        info!(
            patterns = results.len(),
            cascade = request.cascade,
            total_deleted,
            "admin invalidation"
        );
        InvalidateResponse {
            results,
            total_deleted,
        }
    }

    /// Schedule warming in the background and acknowledge immediately.
    pub fn warm(&self, request: WarmRequest) -> WarmAck {
        let task_id = Uuid::new_v4().to_string();
        let users = request.user_ids.len();
        let projects = request.project_ids.len();

        let Some(source) = self.source.clone() else {
            return WarmAck {
                accepted: false,
                task_id,
                users,
                projects,
                message: Some("no warm source configured".to_string()),
            };
        };

        let manager = self.manager.clone();
        let task = task_id.clone();
        tokio::spawn(async move {
            let loader = |kind: EntityKind| {
                let source = Arc::clone(&source);
                move |batch: Vec<String>| {
                    let source = Arc::clone(&source);
                    async move { source.load(kind, batch).await }
                }
            };
            let warmed_users = manager
                .warm_user_cache(&request.user_ids, loader(EntityKind::User))
                .await;
            let warmed_projects = manager
                .warm_project_cache(&request.project_ids, loader(EntityKind::Project))
                .await;
            info!(
                task_id = %task,
                warmed_users,
                warmed_projects,
                "admin warm task finished"
            );
        });

        WarmAck {
            accepted: true,
            task_id,
            users,
            projects,
            message: None,
        }
    }

    /// Delete keys matching `pattern`, or everything for `"all"`.
    /// Refused unless the request is confirmed.
    pub async fn flush(&self, request: &FlushRequest) -> Result<FlushResponse, CacheError> {
        if !request.confirm {
            warn!(pattern = %request.pattern, "refused unconfirmed cache flush");
            return Err(CacheError::ConfirmationRequired { op: "flush" });
        }

        let store = self.manager.store();
        if request.pattern == FLUSH_ALL {
            if !store.flush_all().await {
                return Err(CacheError::operation("flush_all", "store did not clear"));
            }
            return Ok(FlushResponse {
                pattern: request.pattern.clone(),
                deleted: None,
            });
        }

        let deleted = store.flush_pattern(&request.pattern).await;
        Ok(FlushResponse {
            pattern: request.pattern.clone(),
            deleted: Some(deleted),
        })
    }

    /// Keys matching the pattern with their TTLs, capped at `limit`.
    pub async fn keys(&self, query: &KeysQuery) -> KeysResponse {
        let store = self.manager.store();
        let matched = store.keys(&query.pattern).await;
        let total_matched = matched.len();

        let shown: Vec<String> = matched.into_iter().take(query.limit).collect();
        let ttls = join_all(shown.iter().map(|key| store.ttl(key))).await;
        let keys = shown
            .into_iter()
            .zip(ttls)
            .map(|(key, ttl)| KeyEntry { key, ttl })
            .collect();

        KeysResponse {
            pattern: query.pattern.clone(),
            keys,
            total_matched,
            truncated: total_matched > query.limit,
        }
    }

    pub fn reset_metrics(&self) {
        self.manager.store().metrics().reset();
        info!("cache metrics reset");
    }

    /// Probe round trip.
    pub async fn ping(&self) -> PingResponse {
        let started = Instant::now();
        let health = self.manager.health_check().await;
        PingResponse {
            ok: health.status == HealthState::Healthy,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

/// `<entity>:<id>` without glob characters, for entities with a cascade list.
fn cascade_entity(pattern: &str) -> Option<(EntityKind, &str)> {
    if pattern.contains(GLOB_CHARS) {
        return None;
    }
    let (prefix, id) = pattern.split_once(':')?;
    let kind = EntityKind::from_prefix(prefix).filter(|kind| *kind != EntityKind::Query)?;
    (!id.is_empty() && !id.contains(':')).then_some((kind, id))
}
