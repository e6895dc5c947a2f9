//! Request and response payloads for the anno-cache administrative surface.
//!
//! These types are shared between the cache subsystem and whichever HTTP layer
//! exposes it. They carry no behavior beyond (de)serialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Snapshot of the in-process cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub avg_response_time_ms: f64,
}

/// Aggregate statistics reported by the key-value store itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreInfoPayload {
    pub used_memory_bytes: u64,
    pub used_memory_human: Option<String>,
    pub connected_clients: u64,
    pub total_commands_processed: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub db_size: u64,
}

/// Result of a probe-based health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// `GET` statistics response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub metrics: MetricsPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreInfoPayload>,
    pub key_counts: BTreeMap<String, u64>,
    pub health: HealthPayload,
}

/// `POST` invalidate request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub patterns: Vec<String>,
    #[serde(default)]
    pub cascade: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternResult {
    pub pattern: String,
    pub deleted: u64,
}

/// `POST` invalidate response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub results: Vec<PatternResult>,
    pub total_deleted: u64,
}

/// `POST` warm request: entity ids to preload, grouped by entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmRequest {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub project_ids: Vec<String>,
}

/// Acknowledgement returned immediately after warming is scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmAck {
    pub accepted: bool,
    pub task_id: String,
    pub users: usize,
    pub projects: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `POST` flush request. Without `confirm` the flush is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushRequest {
    #[serde(default = "default_flush_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub confirm: bool,
}

impl Default for FlushRequest {
    fn default() -> Self {
        Self {
            pattern: default_flush_pattern(),
            confirm: false,
        }
    }
}

fn default_flush_pattern() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushResponse {
    pub pattern: String,
    /// Keys removed, or `None` when the whole store was cleared.
    pub deleted: Option<u64>,
}

/// `GET` keys query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysQuery {
    #[serde(default = "default_keys_pattern")]
    pub pattern: String,
    #[serde(default = "default_keys_limit")]
    pub limit: usize,
}

impl Default for KeysQuery {
    fn default() -> Self {
        Self {
            pattern: default_keys_pattern(),
            limit: default_keys_limit(),
        }
    }
}

fn default_keys_pattern() -> String {
    "*".to_string()
}

fn default_keys_limit() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: String,
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysResponse {
    pub pattern: String,
    pub keys: Vec<KeyEntry>,
    pub total_matched: usize,
    pub truncated: bool,
}

/// `GET` ping response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
    pub latency_ms: f64,
}

/// Structured error body returned by administrative operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub status: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}
