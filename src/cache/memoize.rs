//! Read memoization and write-side invalidation helpers.
//!
//! [`Memoized`] wraps a read function in cache-aside. [`InvalidateOnWrite`]
//! and [`InvalidationScope`] tie cache invalidation to a successful write, so
//! a failed write leaves cached views untouched.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::error::CacheError;
use super::keys::{CacheKey, KeyArgs};
use super::serializer::CacheValue;
use super::store::{CacheStore, Cached, SetOptions};

/// Failure of a memoized call.
#[derive(Debug, Error)]
pub enum MemoizeError<E> {
    /// Only produced when cache errors are propagated.
    #[error("cache error: {0}")]
    Cache(#[source] CacheError),
    #[error("{0}")]
    Source(E),
}

impl<E> MemoizeError<E> {
    /// Error of the wrapped function, if that is what failed.
    pub fn into_source(self) -> Option<E> {
        match self {
            MemoizeError::Source(err) => Some(err),
            MemoizeError::Cache(_) => None,
        }
    }
}

type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Cache-aside wrapper around a read function.
///
/// Keys default to `prefix` followed by the argument components; a custom key
/// function replaces that. Cache errors are swallowed unless
/// [`Memoized::propagate_errors`] is set.
pub struct Memoized<A> {
    store: Arc<CacheStore>,
    prefix: String,
    ttl: Option<Duration>,
    cache_none: bool,
    swallow_errors: bool,
    key_fn: Option<KeyFn<A>>,
}

impl<A> Clone for Memoized<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            ttl: self.ttl,
            cache_none: self.cache_none,
            swallow_errors: self.swallow_errors,
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<A> fmt::Debug for Memoized<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("cache_none", &self.cache_none)
            .field("swallow_errors", &self.swallow_errors)
            .field("custom_key", &self.key_fn.is_some())
            .finish()
    }
}

impl<A: KeyArgs> Memoized<A> {
    pub fn new(store: Arc<CacheStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl: None,
            cache_none: false,
            swallow_errors: true,
            key_fn: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache `None` results as an explicit "no value".
    pub fn cache_none(mut self, cache_none: bool) -> Self {
        self.cache_none = cache_none;
        self
    }

    /// Surface cache failures as [`MemoizeError::Cache`] instead of calling through.
    pub fn propagate_errors(mut self) -> Self {
        self.swallow_errors = false;
        self
    }

    pub fn key_fn(mut self, key_fn: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn key(&self, args: &A) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(args),
            None => CacheKey::from_components(&self.prefix, &args.key_components()),
        }
    }

    /// Return the cached result for `args`, or call `f` and cache what it returns.
    pub async fn call<T, F, Fut, E>(&self, args: A, f: F) -> Result<Option<T>, MemoizeError<E>>
    where
        T: CacheValue,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let key = self.key(&args);

        let cached = if self.swallow_errors {
            self.store.lookup::<T>(&key).await
        } else {
            self.store
                .try_lookup::<T>(&key)
                .await
                .map_err(MemoizeError::Cache)?
        };
        match cached {
            Cached::Hit(value) => return Ok(Some(value)),
            Cached::Absent => return Ok(None),
            Cached::Miss => {}
        }

        let value = f(args).await.map_err(MemoizeError::Source)?;
        let options = SetOptions {
            ttl: self.ttl,
            ..SetOptions::default()
        };
        let written = match &value {
            Some(value) => Some(self.store.try_set(&key, value, options).await),
            None if self.cache_none => Some(self.store.try_set_none(&key, options).await),
            None => None,
        };
        if let Some(Err(err)) = written {
            if !self.swallow_errors {
                return Err(MemoizeError::Cache(err));
            }
        }
        Ok(value)
    }

    /// Drop the cached result for `args`.
    pub async fn invalidate(&self, args: &A) -> bool {
        self.store.delete(&[self.key(args)]).await > 0
    }
}

/// Flushes a fixed set of patterns after every successful write.
#[derive(Clone)]
pub struct InvalidateOnWrite {
    store: Arc<CacheStore>,
    patterns: Vec<String>,
}

impl InvalidateOnWrite {
    pub fn new<P: Into<String>>(store: Arc<CacheStore>, patterns: impl IntoIterator<Item = P>) -> Self {
        Self {
            store,
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Await `write`; on success flush every pattern. Flush failures are only logged.
    pub async fn run<T, E, Fut>(&self, write: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let result = write.await;
        if result.is_ok() {
            for pattern in &self.patterns {
                self.store.flush_pattern(pattern).await;
            }
        }
        result
    }
}

/// Keys to delete once a write has succeeded.
///
/// Dropping the scope without [`commit`](Self::commit) leaves the keys cached.
pub struct InvalidationScope {
    store: Arc<CacheStore>,
    keys: Vec<String>,
    committed: bool,
}

impl InvalidationScope {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            keys: Vec::new(),
            committed: false,
        }
    }

    pub fn add(&mut self, key: impl Into<String>) -> &mut Self {
        self.keys.push(key.into());
        self
    }

    pub fn extend<K: Into<String>>(&mut self, keys: impl IntoIterator<Item = K>) -> &mut Self {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Delete the declared keys now. Returns how many existed.
    pub async fn commit(mut self) -> u64 {
        self.committed = true;
        self.store.delete(&self.keys).await
    }

    /// Run `body` and commit only if it succeeds.
    pub async fn run<T, E, Fut>(self, body: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let result = body.await;
        if result.is_ok() {
            self.commit().await;
        }
        result
    }
}

impl Drop for InvalidationScope {
    fn drop(&mut self) {
        if !self.committed && !self.keys.is_empty() {
            debug!(keys = self.keys.len(), "invalidation scope dropped without commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::config::CacheConfig;

    async fn store() -> Arc<CacheStore> {
        let store = CacheStore::with_backend(CacheConfig::memory(), Arc::new(MemoryBackend::new(64)));
        store.connect().await.expect("connect");
        Arc::new(store)
    }

    #[tokio::test]
    async fn default_key_uses_prefix_and_arguments() {
        let memo = Memoized::<(i64, String)>::new(store().await, "report");
        assert_eq!(memo.key(&(7, "weekly".to_string())), "report:7:weekly");

        let custom = memo.key_fn(|(id, _)| format!("report:custom:{id}"));
        assert_eq!(custom.key(&(7, "weekly".to_string())), "report:custom:7");
    }

    #[tokio::test]
    async fn none_results_are_cached_only_on_request() {
        let store = store().await;
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let lookup = move |_: i64| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<String>, std::convert::Infallible>(None)
        };

        let plain = Memoized::new(Arc::clone(&store), "plain");
        plain.call(1_i64, lookup).await.expect("call");
        plain.call(1_i64, lookup).await.expect("call");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let sticky = Memoized::new(Arc::clone(&store), "sticky").cache_none(true);
        sticky.call(1_i64, lookup).await.expect("call");
        sticky.call(1_i64, lookup).await.expect("call");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dropped_scope_keeps_keys() {
        let store = store().await;
        store.set("user:1", &"ada".to_string(), None).await;

        let mut scope = InvalidationScope::new(Arc::clone(&store));
        scope.add("user:1");
        drop(scope);
        assert!(store.exists("user:1").await);

        let mut scope = InvalidationScope::new(Arc::clone(&store));
        scope.add("user:1");
        assert_eq!(scope.commit().await, 1);
        assert!(!store.exists("user:1").await);
    }
}
