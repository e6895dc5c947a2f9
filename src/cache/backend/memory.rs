use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anno_cache_api_types::StoreInfoPayload;
use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use lru::LruCache;
use tokio::time::Instant;

use super::{CacheBackend, SetCondition, TTL_MISSING, TTL_NO_EXPIRY};
use crate::cache::error::CacheError;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::backend::memory";

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process LRU store with Redis-compatible TTL and glob semantics.
///
/// Expired entries are dropped lazily when touched or scanned.
pub struct MemoryBackend {
    entries: RwLock<LruCache<String, Entry>>,
    commands: AtomicU64,
    keyspace_hits: AtomicU64,
    keyspace_misses: AtomicU64,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            commands: AtomicU64::new(0),
            keyspace_hits: AtomicU64::new(0),
            keyspace_misses: AtomicU64::new(0),
        }
    }

    fn count_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    fn read_live(&self, key: &str, op: &'static str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, op);
        let state = entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        let live = match state {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if live.is_some() {
            &self.keyspace_hits
        } else {
            &self.keyspace_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        live
    }
}

fn matcher(pattern: &str) -> Result<GlobMatcher, CacheError> {
    GlobBuilder::new(pattern)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| CacheError::operation("scan", format!("invalid pattern `{pattern}`: {err}")))
}

fn remaining_secs(expires_at: Instant, now: Instant) -> i64 {
    let remaining = expires_at.saturating_duration_since(now);
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.count_command();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.count_command();
        Ok(self.read_live(key, "get"))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.count_command();
        Ok(keys.iter().map(|key| self.read_live(key, "mget")).collect())
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        condition: SetCondition,
    ) -> Result<bool, CacheError> {
        self.count_command();
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        let present = entries.peek(key).is_some_and(|entry| entry.is_live(now));
        let allowed = match condition {
            SetCondition::Always => true,
            SetCondition::IfAbsent => !present,
            SetCondition::IfPresent => present,
        };
        if allowed {
            entries.put(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Some(now + ttl),
                },
            );
        }
        Ok(allowed)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.count_command();
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "del");
        let removed = keys
            .iter()
            .filter_map(|key| entries.pop(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.count_command();
        let now = Instant::now();
        Ok(rw_read(&self.entries, SOURCE, "exists")
            .peek(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.count_command();
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "ttl");
        let ttl = match entries.peek(key) {
            Some(entry) if entry.is_live(now) => entry
                .expires_at
                .map_or(TTL_NO_EXPIRY, |at| remaining_secs(at, now)),
            _ => TTL_MISSING,
        };
        Ok(ttl)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.count_command();
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "expire");
        match entries.peek_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.count_command();
        let matcher = matcher(pattern)?;
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "scan");

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }

        let mut keys: Vec<String> = entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| matcher.is_match(key.as_str()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.count_command();
        rw_write(&self.entries, SOURCE, "flush_all").clear();
        Ok(())
    }

    async fn info(&self) -> Result<StoreInfoPayload, CacheError> {
        self.count_command();
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "info");
        let (db_size, used_memory_bytes) = entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .fold((0_u64, 0_u64), |(count, bytes), (key, entry)| {
                (count + 1, bytes + (key.len() + entry.value.len()) as u64)
            });

        Ok(StoreInfoPayload {
            used_memory_bytes,
            used_memory_human: Some(format!("{:.2}K", used_memory_bytes as f64 / 1024.0)),
            connected_clients: 1,
            total_commands_processed: self.commands.load(Ordering::Relaxed),
            keyspace_hits: self.keyspace_hits.load(Ordering::Relaxed),
            keyspace_misses: self.keyspace_misses.load(Ordering::Relaxed),
            db_size,
        })
    }

    async fn close(&self) {}
}
