//! In-process cache counters.
//!
//! Counters are atomics shared by every request task and the worker; rates and
//! averages are derived on read. Each record call also feeds the global
//! `metrics` recorder so hosts can export the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anno_cache_api_types::MetricsPayload;
use metrics::{counter, histogram};

pub(crate) const METRIC_HIT_TOTAL: &str = "anno_cache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "anno_cache_miss_total";
pub(crate) const METRIC_SET_TOTAL: &str = "anno_cache_set_total";
pub(crate) const METRIC_DELETE_TOTAL: &str = "anno_cache_delete_total";
pub(crate) const METRIC_ERROR_TOTAL: &str = "anno_cache_error_total";
pub(crate) const METRIC_OP_MS: &str = "anno_cache_op_ms";
pub(crate) const METRIC_WARM_MS: &str = "anno_cache_warm_ms";
pub(crate) const METRIC_MAINTENANCE_MS: &str = "anno_cache_maintenance_ms";

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    total_latency_nanos: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, latency: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
        counter!(METRIC_HIT_TOTAL).increment(1);
    }

    pub fn record_miss(&self, latency: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
        counter!(METRIC_MISS_TOTAL).increment(1);
    }

    pub fn record_set(&self, latency: Duration) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
        counter!(METRIC_SET_TOTAL).increment(1);
    }

    pub fn record_delete(&self, latency: Duration) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
        counter!(METRIC_DELETE_TOTAL).increment(1);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ERROR_TOTAL).increment(1);
    }

    /// Per-operation latency, exported only.
    pub fn observe_op(&self, op: &'static str, latency: Duration) {
        histogram!(METRIC_OP_MS, "op" => op).record(latency.as_secs_f64() * 1000.0);
    }

    fn add_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.total_latency_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Operations that contributed latency (hits, misses, sets, deletes).
    pub fn total_operations(&self) -> u64 {
        self.hits() + self.misses() + self.sets() + self.deletes()
    }

    /// Hits as a percentage of lookups.
    pub fn hit_rate(&self) -> f64 {
        percentage(self.hits(), self.hits() + self.misses())
    }

    /// Misses as a percentage of lookups.
    pub fn miss_rate(&self) -> f64 {
        percentage(self.misses(), self.hits() + self.misses())
    }

    pub fn avg_response_time(&self) -> Duration {
        let ops = self.total_operations();
        if ops == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_latency_nanos.load(Ordering::Relaxed) / ops)
    }

    pub fn snapshot(&self) -> MetricsPayload {
        let hits = self.hits();
        let misses = self.misses();
        MetricsPayload {
            hits,
            misses,
            sets: self.sets(),
            deletes: self.deletes(),
            errors: self.errors(),
            total_requests: hits + misses,
            hit_rate: percentage(hits, hits + misses),
            miss_rate: percentage(misses, hits + misses),
            avg_response_time_ms: self.avg_response_time().as_secs_f64() * 1000.0,
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.total_latency_nanos.store(0, Ordering::Relaxed);
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}
