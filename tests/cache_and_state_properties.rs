use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use query_engine::clock::SystemClock;
use query_engine::key;
use query_engine::query::cache::QueryCache;
use query_engine::query::context::InfiniteQueryFnContext;
use query_engine::query::infinite::{InfiniteQueryObserver, InfiniteQueryOptions, PageFetcher};
use query_engine::query::observer::QueryObserver;
use query_engine::query::options::{GcTime, QueryOptions};
use query_engine::query::query::Fetcher;
use query_engine::query::state::Status;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Property 1: a cache lookup either misses, or returns the entry whose own
/// key matches what was asked for.
#[test]
fn cache_lookup_either_misses_or_returns_matching_key() {
    let cache = QueryCache::new();
    let clock: Arc<dyn query_engine::clock::Clock> = Arc::new(SystemClock);
    let k = key!["users", 1.0];

    assert!(cache.get(&k).is_none());

    let _query = cache.build::<String, String>(&k, clock, GcTime::default(), None);
    let entry = cache.get(&k).expect("query must exist after build");
    assert_eq!(entry.key(), &k);

    assert!(cache.get(&key!["users", 2.0]).is_none());
}

/// Property 3: `status` and `data`/`error` stay consistent across
/// transitions — `Success` always carries data and no error, `Error` always
/// carries an error but keeps whatever data preceded it.
#[tokio::test(start_paused = true)]
async fn status_data_error_invariant_holds_across_transitions() {
    use query_engine::query::query::Query;

    let clock = Arc::new(SystemClock);
    let on_gc: Arc<dyn Fn(&query_engine::Key) + Send + Sync> = Arc::new(|_| {});
    let query: Arc<Query<String, String>> = Arc::new(Query::new(key!["k"], clock, GcTime::default(), None, on_gc));

    let succeed: Fetcher<String, String> = Arc::new(|_ctx| Box::pin(async move { Ok("v1".to_string()) }));
    let policy = query_engine::retry::no_retry_policy();
    query.fetch(succeed, policy.clone(), None).await.unwrap();

    let state = query.state();
    assert_eq!(state.status, Status::Success);
    assert_eq!(state.data, Some("v1".to_string()));
    assert_eq!(state.error, None);

    let fail: Fetcher<String, String> = Arc::new(|_ctx| Box::pin(async move { Err::<String, String>("boom".to_string()) }));
    let result = query.fetch(fail, policy, None).await;
    assert!(result.is_err());

    let state = query.state();
    assert_eq!(state.status, Status::Error);
    assert_eq!(state.error, Some("boom".to_string()));
    assert_eq!(state.data, Some("v1".to_string()), "a failed background refetch must not clear the last good data");
}

/// Property 4: while an observer is mounted and enabled, its query always
/// appears in `cache.get_all()`.
#[tokio::test(start_paused = true)]
async fn active_observers_query_always_appears_in_get_all() {
    let cache = QueryCache::new();
    let clock = Arc::new(SystemClock);
    let k = key!["active"];
    let fetcher: Fetcher<String, String> = Arc::new(|_ctx| Box::pin(async move { Ok("v".to_string()) }));
    let options = QueryOptions::<String, String>::default();

    let observer = QueryObserver::new(&cache, clock, k.clone(), fetcher, options);
    assert!(cache.get_all().iter().any(|q| q.key() == &k), "a freshly mounted observer's query must be visible in get_all immediately");

    settle().await;
    assert!(cache.get_all().iter().any(|q| q.key() == &k));

    observer.dispose();
}

/// Property 5: mounting a second observer before a scheduled GC fires
/// cancels it — the query is never collected out from under a still-live
/// remount, and GC only ever runs once per observerless window.
#[tokio::test(start_paused = true)]
async fn remounting_before_gc_fires_cancels_the_pending_collection() {
    let cache = QueryCache::new();
    let clock = Arc::new(SystemClock);
    let k = key!["remount"];
    let fetcher: Fetcher<String, String> = Arc::new(|_ctx| Box::pin(async move { Ok("v".to_string()) }));
    let options = QueryOptions::<String, String> {
        gc_time: GcTime::After(Duration::from_secs(60)),
        ..QueryOptions::default()
    };

    let observer = QueryObserver::new(&cache, clock.clone(), k.clone(), fetcher.clone(), options.clone());
    settle().await;
    observer.dispose();

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert!(cache.get(&k).is_some(), "gcTime has not elapsed yet");

    let observer2 = QueryObserver::new(&cache, clock, k.clone(), fetcher, options);
    settle().await;

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert!(cache.get(&k).is_some(), "remounting before gcTime elapsed must cancel the pending collection");

    observer2.dispose();
}

/// Property 9: `fetchFailureCount` resets to 0 both at the start of a new
/// fetch cycle and again once that cycle lands on success.
#[tokio::test(start_paused = true)]
async fn fetch_failure_count_resets_at_cycle_start_and_on_success() {
    use query_engine::query::query::Query;

    let clock = Arc::new(SystemClock);
    let on_gc: Arc<dyn Fn(&query_engine::Key) + Send + Sync> = Arc::new(|_| {});
    let query: Arc<Query<String, String>> = Arc::new(Query::new(key!["flaky-then-fine"], clock, GcTime::default(), None, on_gc));

    let attempt = Arc::new(AtomicU32::new(0));
    let attempt_clone = attempt.clone();
    let fetcher: Fetcher<String, String> = Arc::new(move |_ctx| {
        let attempt = attempt_clone.clone();
        Box::pin(async move {
            if attempt.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".to_string())
            } else {
                Ok("recovered".to_string())
            }
        })
    });
    let policy: query_engine::retry::RetryPolicy<String> = Arc::new(|n, _| if n < 5 { Some(Duration::from_millis(10)) } else { None });

    let result = query.fetch(fetcher, policy, None).await;
    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(query.state().fetch_failure_count, 0, "a cycle that ends in success must reset the failure count");

    let always_fail: Fetcher<String, String> = Arc::new(|_ctx| Box::pin(async move { Err::<String, String>("boom".to_string()) }));
    let no_retry = query_engine::retry::no_retry_policy();
    let _ = query.fetch(always_fail, no_retry, None).await;
    assert_eq!(query.state().fetch_failure_count, 1, "fresh cycle must start its failure count from zero, not carry over the prior cycle's");
}

/// Property 10: `refetch` on an infinite query re-fetches exactly the pages
/// already present, in their original `pageParam` order, without growing or
/// reordering the page list.
#[tokio::test(start_paused = true)]
async fn infinite_refetch_preserves_page_count_and_param_order() {
    let cache = QueryCache::new();
    let clock = Arc::new(SystemClock);
    let fetch_count = Arc::new(AtomicU32::new(0));
    let fetch_count_clone = fetch_count.clone();
    let fetcher: PageFetcher<String, u32, String> = Arc::new(move |ctx: InfiniteQueryFnContext<u32, String>| {
        let fetch_count = fetch_count_clone.clone();
        Box::pin(async move {
            fetch_count.fetch_add(1, Ordering::SeqCst);
            Ok(format!("page-{}", ctx.page_param))
        })
    });

    let options = InfiniteQueryOptions::new(0u32, |data: &query_engine::query::infinite::InfiniteData<String, u32>| data.page_params.last().map(|last| last + 1)).enabled(false);
    let observer = InfiniteQueryObserver::new(&cache, clock, key!["refetch-order"], fetcher, options);

    observer.fetch_initial().await.unwrap();
    observer.fetch_next_page().await.unwrap();
    observer.fetch_next_page().await.unwrap();
    assert_eq!(fetch_count.load(Ordering::SeqCst), 3);

    let refreshed = observer.refetch().await.unwrap();
    assert_eq!(refreshed.page_params, vec![0, 1, 2], "refetch must preserve the original pageParam order");
    assert_eq!(refreshed.pages, vec!["page-0", "page-1", "page-2"]);
    assert_eq!(fetch_count.load(Ordering::SeqCst), 6, "refetch re-runs the fetcher once per existing page");
}
