//! Key-value store backends.
//!
//! [`CacheBackend`] is the narrow byte-level surface `CacheStore` needs. The
//! Redis implementation covers the standalone, sentinel and cluster
//! topologies; the memory implementation backs local runs and tests.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use anno_cache_api_types::StoreInfoPayload;
use async_trait::async_trait;

use super::config::{CacheConfig, DeploymentMode};
use super::error::CacheError;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Conditional write flag forwarded to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    /// Write only when the key does not exist (`NX`).
    IfAbsent,
    /// Write only when the key already exists (`XX`).
    IfPresent,
}

/// TTL reported for a key that exists without an expiry.
pub const TTL_NO_EXPIRY: i64 = -1;
/// TTL reported for a key that does not exist.
pub const TTL_MISSING: i64 = -2;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Topology name, for logs.
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Values for `keys`, positionally aligned.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    /// Returns whether the write happened; conditional writes may be skipped.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        condition: SetCondition,
    ) -> Result<bool, CacheError>;

    /// Number of keys actually removed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining TTL in seconds, or [`TTL_NO_EXPIRY`] / [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> Result<i64, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Keys matching a glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    async fn flush_all(&self) -> Result<(), CacheError>;

    async fn info(&self) -> Result<StoreInfoPayload, CacheError>;

    /// Release pooled connections. Calls after this fail with `NotConnected`.
    async fn close(&self);
}

/// Establish the backend selected by `config.mode`.
pub async fn connect(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, CacheError> {
    let backend: Arc<dyn CacheBackend> = match &config.mode {
        DeploymentMode::Memory { capacity } => Arc::new(MemoryBackend::new(*capacity)),
        DeploymentMode::Standalone => Arc::new(RedisBackend::standalone(config).await?),
        DeploymentMode::Sentinel {
            hosts,
            service_name,
        } => Arc::new(RedisBackend::sentinel(config, hosts, service_name).await?),
        DeploymentMode::Cluster { nodes } => Arc::new(RedisBackend::cluster(config, nodes).await?),
    };
    Ok(backend)
}
