mod support;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anno_cache::cache::{InvalidateOnWrite, InvalidationScope, MemoizeError, Memoized};
use support::{flaky_store, memory_store};

#[tokio::test]
async fn memoized_reads_hit_the_cache() {
    let store = memory_store().await;
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let count_annotations = move |project_id: i64| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(Some(project_id * 10))
    };

    let memo = Memoized::new(Arc::clone(&store), "project_annotation_count")
        .ttl(Duration::from_secs(120));

    assert_eq!(memo.call(4_i64, count_annotations).await.ok(), Some(Some(40)));
    assert_eq!(memo.call(4_i64, count_annotations).await.ok(), Some(Some(40)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ttl = store.ttl("project_annotation_count:4").await;
    assert!((119..=120).contains(&ttl), "ttl was {ttl}");

    assert!(memo.invalidate(&4).await);
    memo.call(4_i64, count_annotations).await.ok();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cache_errors_are_swallowed_by_default() {
    let (store, backend) = flaky_store().await;
    backend.set_broken(true);

    let memo = Memoized::new(store, "report");
    let result = memo
        .call(("weekly".to_string(), 3_i64), |(name, week)| async move {
            Ok::<_, Infallible>(Some(format!("{name}-{week}")))
        })
        .await;

    assert_eq!(result.ok(), Some(Some("weekly-3".to_string())));
}

#[tokio::test]
async fn cache_errors_propagate_on_request() {
    let (store, backend) = flaky_store().await;
    backend.set_broken(true);
    let calls = AtomicUsize::new(0);

    let memo = Memoized::new(store, "report").propagate_errors();
    let result = memo
        .call(1_i64, |id| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Infallible>(Some(id)) }
        })
        .await;

    assert!(matches!(result, Err(MemoizeError::Cache(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn source_errors_are_returned_and_not_cached() {
    let store = memory_store().await;
    let memo = Memoized::new(Arc::clone(&store), "label_usage");

    let result = memo
        .call(9_i64, |_| async { Err::<Option<i64>, _>("replica lag") })
        .await;
    assert_eq!(
        result.map_err(MemoizeError::into_source).err(),
        Some(Some("replica lag"))
    );
    assert!(!store.exists("label_usage:9").await);
}

#[tokio::test]
async fn custom_key_function_replaces_default_key() {
    let store = memory_store().await;
    let memo = Memoized::new(Arc::clone(&store), "ignored")
        .key_fn(|user_id: &i64| format!("user:{user_id}:permissions"));

    memo.call(7_i64, |_| async { Ok::<_, Infallible>(Some(vec!["annotate".to_string()])) })
        .await
        .ok();
    assert!(store.exists("user:7:permissions").await);
}

#[tokio::test]
async fn successful_writes_flush_declared_patterns() {
    let store = memory_store().await;
    store.set("project:1:stats", &1_i64, None).await;
    store.set("project:2:stats", &1_i64, None).await;
    store.set("label:1", &1_i64, None).await;

    let on_write = InvalidateOnWrite::new(Arc::clone(&store), ["project:*:stats"]);
    let result = on_write.run(async { Ok::<_, String>("saved") }).await;

    assert_eq!(result, Ok("saved"));
    assert!(!store.exists("project:1:stats").await);
    assert!(!store.exists("project:2:stats").await);
    assert!(store.exists("label:1").await);
}

#[tokio::test]
async fn failed_writes_leave_cache_untouched() {
    let store = memory_store().await;
    store.set("project:1:stats", &1_i64, None).await;

    let on_write = InvalidateOnWrite::new(Arc::clone(&store), ["project:*:stats"]);
    let result = on_write
        .run(async { Err::<(), _>("constraint violation".to_string()) })
        .await;

    assert!(result.is_err());
    assert!(store.exists("project:1:stats").await);
}

#[tokio::test]
async fn flush_failures_do_not_fail_the_write() {
    let (store, backend) = flaky_store().await;
    let on_write = InvalidateOnWrite::new(store, ["project:*"]);
    backend.set_broken(true);

    let result = on_write.run(async { Ok::<_, String>(42) }).await;
    assert_eq!(result, Ok(42));
}

#[tokio::test]
async fn scope_commits_only_on_success() {
    let store = memory_store().await;
    store.set("user:1", &1_i64, None).await;
    store.set("user:1:projects", &1_i64, None).await;

    let mut scope = InvalidationScope::new(Arc::clone(&store));
    scope.add("user:1").add("user:1:projects");
    let failed = scope.run(async { Err::<(), _>("rollback") }).await;
    assert!(failed.is_err());
    assert!(store.exists("user:1").await);

    let mut scope = InvalidationScope::new(Arc::clone(&store));
    scope.extend(["user:1", "user:1:projects"]);
    let done = scope.run(async { Ok::<_, &str>(()) }).await;
    assert!(done.is_ok());
    assert!(!store.exists("user:1").await);
    assert!(!store.exists("user:1:projects").await);
}
