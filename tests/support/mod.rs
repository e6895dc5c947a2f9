#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anno_cache::cache::{
    CacheBackend, CacheConfig, CacheError, CacheManager, CacheStore, MemoryBackend, SetCondition,
};
use anno_cache_api_types::StoreInfoPayload;
use async_trait::async_trait;

/// Connected store over a fresh in-process backend.
pub async fn memory_store() -> Arc<CacheStore> {
    memory_store_with(CacheConfig::memory()).await
}

pub async fn memory_store_with(config: CacheConfig) -> Arc<CacheStore> {
    let store = CacheStore::with_backend(config, Arc::new(MemoryBackend::new(1_024)));
    store.connect().await.expect("memory backend connects");
    Arc::new(store)
}

/// Manager without pauses between warm batches.
pub async fn memory_manager() -> CacheManager {
    CacheManager::with_warm_policy(memory_store().await, 2, Duration::ZERO)
}

/// Backend that accepts the connection probe, then fails while `broken` is set.
pub struct FlakyBackend {
    inner: MemoryBackend,
    broken: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(1_024),
            broken: AtomicBool::new(false),
        }
    }

    pub fn broken() -> Self {
        let backend = Self::new();
        backend.set_broken(true);
        backend
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    fn check(&self, op: &'static str) -> Result<(), CacheError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(CacheError::operation(op, "connection reset by peer"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.check("mget")?;
        self.inner.mget(keys).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        condition: SetCondition,
    ) -> Result<bool, CacheError> {
        self.check("set")?;
        self.inner.set(key, value, ttl, condition).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.check("del")?;
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check("exists")?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.check("ttl")?;
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check("expire")?;
        self.inner.expire(key, ttl).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check("scan")?;
        self.inner.scan(pattern).await
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.check("flush_all")?;
        self.inner.flush_all().await
    }

    async fn info(&self) -> Result<StoreInfoPayload, CacheError> {
        self.check("info")?;
        self.inner.info().await
    }

    async fn close(&self) {}
}

/// Connected store over a [`FlakyBackend`], with a handle to break it.
pub async fn flaky_store() -> (Arc<CacheStore>, Arc<FlakyBackend>) {
    let backend = Arc::new(FlakyBackend::new());
    let store = CacheStore::with_backend(CacheConfig::memory(), backend.clone());
    store.connect().await.expect("flaky backend connects");
    (Arc::new(store), backend)
}
