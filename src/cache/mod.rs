//! Anno Cache System
//!
//! Cache-aside layer for the annotation platform on top of a shared
//! key-value store:
//!
//! - **Store**: typed get/set/delete with TTL policy, compressed encoding and
//!   pattern flushes ([`CacheStore`])
//! - **Manager**: per-entity helpers, cascade invalidation and warming
//!   ([`CacheManager`])
//! - **Memoization**: read wrappers and write-side invalidation ([`Memoized`],
//!   [`InvalidateOnWrite`], [`InvalidationScope`])
//! - **Worker**: periodic warming, bookkeeping cleanup and statistics
//!   ([`BackgroundWorker`])
//!
//! ## Configuration
//!
//! Store settings live under `[cache]` in `anno-cache.toml`:
//!
//! ```toml
//! [cache]
//! host = "127.0.0.1"
//! port = 6379
//! mode = "standalone"
//! default_ttl_seconds = 3600
//! # ... see config.rs for all options
//! ```
//!
//! Store failures never reach callers of the non-`try_` operations: they are
//! logged, counted and reported as a miss or a failed write.

mod admin;
pub mod backend;
pub(crate) mod config;
mod error;
mod keys;
mod lock;
mod manager;
mod memoize;
pub(crate) mod metrics;
mod serializer;
mod store;
mod worker;

pub use admin::{CacheAdmin, FLUSH_ALL};
pub use backend::{CacheBackend, MemoryBackend, RedisBackend, SetCondition};
pub use config::{CacheConfig, DeploymentMode};
pub use error::{CacheError, SerializationError};
pub use keys::{
    BATCH_PREFIX, CacheKey, EntityKind, HEALTH_PROBE_PREFIX, KeyArgs, KeyBuilder, MAX_KEY_LENGTH,
    QueryParams, STATS_KEY,
};
pub use manager::{
    BATCH_RECORD_TTL, CacheManager, CascadeTargets, DEFAULT_WARM_BATCH_SIZE, DEFAULT_WARM_PAUSE,
    cascade_targets,
};
pub use memoize::{InvalidateOnWrite, InvalidationScope, MemoizeError, Memoized};
pub use metrics::CacheMetrics;
pub use serializer::{CacheValue, Encoding, Serializer, deserialize, is_null_marker, serialize};
pub use store::{CacheStore, Cached, SetOptions};
pub use worker::{
    BackgroundWorker, CycleReport, StatsSnapshot, WarmSource, WarmSourceError, WorkerConfig,
    WorkerState,
};
