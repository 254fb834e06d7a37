use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use query_engine::clock::SystemClock;
use query_engine::key;
use query_engine::query::cache::QueryCache;
use query_engine::query::client::QueryClient;
use query_engine::query::context::QueryFnContext;
use query_engine::query::observer::QueryObserver;
use query_engine::query::options::{GcTime, QueryOptions, RefetchPolicy};
use query_engine::query::query::Fetcher;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// S4: a query with two mounted observers outlives the GC duration after
/// only one of them disposes; it is collected once both have.
#[tokio::test(start_paused = true)]
async fn query_survives_gc_while_a_second_observer_remains() {
    let cache = QueryCache::new();
    let clock = Arc::new(SystemClock);
    let k = key!["shared"];

    let fetcher: Fetcher<String, String> = Arc::new(|_ctx| Box::pin(async move { Ok("v".to_string()) }));
    let options = QueryOptions::<String, String> {
        gc_time: GcTime::After(Duration::from_secs(5 * 60)),
        ..QueryOptions::default()
    };

    let observer1 = QueryObserver::new(&cache, clock.clone(), k.clone(), fetcher.clone(), options.clone());
    let observer2 = QueryObserver::new(&cache, clock, k.clone(), fetcher, options);
    settle().await;

    observer1.dispose();
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    settle().await;
    assert!(cache.get(&k).is_some(), "query must survive while observer2 is still mounted");

    observer2.dispose();
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    settle().await;
    assert!(cache.get(&k).is_none(), "query must be collected once observerless past gcTime");
}

/// S5: `set_query_data` seeds a query directly; `invalidate_queries` flips
/// `isInvalidated`; a freshly mounted observer with `refetchOnMount = Stale`
/// (the default) then fetches because an invalidated query is always stale.
#[tokio::test(start_paused = true)]
async fn set_then_invalidate_then_remount_triggers_fetch() {
    let client = QueryClient::new();
    let k = key!["k"];

    let written = client.set_query_data::<String, String>(&k, |_| Some("v".to_string()), None);
    assert_eq!(written, Some("v".to_string()));
    let state = client.get_query_state::<String, String>(&k).unwrap();
    assert!(state.is_success());
    assert_eq!(state.data_update_count, 1);

    let filter = query_engine::query::cache::Filter::by_key(k.clone()).exact();
    client.invalidate_queries(&filter);
    assert!(client.get_query_state::<String, String>(&k).unwrap().is_invalidated);

    let call_count = Arc::new(AtomicU32::new(0));
    let call_count_clone = call_count.clone();
    let fetcher: Fetcher<String, String> = Arc::new(move |_ctx: QueryFnContext<String>| {
        let call_count = call_count_clone.clone();
        Box::pin(async move {
            call_count.fetch_add(1, Ordering::SeqCst);
            Ok("refreshed".to_string())
        })
    });
    let options = QueryOptions {
        refetch_on_mount: RefetchPolicy::Stale,
        ..client.default_query_options::<String, String>()
    };
    let observer = client.build_query_observer(k.clone(), fetcher, options);
    settle().await;

    assert_eq!(call_count.load(Ordering::SeqCst), 1, "remounting on an invalidated query must trigger a fetch");
    assert_eq!(observer.result().data, Some("refreshed".to_string()));
}

/// Property 6: concurrent `fetchQuery`s issued before the first settles share
/// one in-flight future — only the first fetcher runs.
#[tokio::test(start_paused = true)]
async fn concurrent_fetches_dedupe_to_the_first_fetcher() {
    let client = QueryClient::new();
    let k = key!["dedup"];

    let calls_a = Arc::new(AtomicU32::new(0));
    let calls_a_clone = calls_a.clone();
    let fetcher_a: Fetcher<String, String> = Arc::new(move |_ctx| {
        let calls_a = calls_a_clone.clone();
        Box::pin(async move {
            calls_a.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("from-a".to_string())
        })
    });
    let calls_b = Arc::new(AtomicU32::new(0));
    let calls_b_clone = calls_b.clone();
    let fetcher_b: Fetcher<String, String> = Arc::new(move |_ctx| {
        let calls_b = calls_b_clone.clone();
        Box::pin(async move {
            calls_b.fetch_add(1, Ordering::SeqCst);
            Ok("from-b".to_string())
        })
    });

    let options = client.default_query_options::<String, String>();
    let first_task = tokio::spawn(client.fetch_query(k.clone(), fetcher_a, options.clone()));
    settle().await;
    let second = client.fetch_query(k.clone(), fetcher_b, options).await;
    let first = first_task.await.unwrap();

    assert_eq!(first.unwrap(), "from-a");
    assert_eq!(second.unwrap(), "from-a");
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 0, "the second fetcher must never run while the first is in flight");
}

/// Property 7: `isStale` derivation, including the `Static` exemption.
#[test]
fn static_stale_time_is_never_stale_even_when_invalidated() {
    use query_engine::query::options::StaleTime;
    use query_engine::query::query::Query;

    let clock: Arc<dyn query_engine::clock::Clock> = Arc::new(SystemClock);
    let on_gc: Arc<dyn Fn(&query_engine::Key) + Send + Sync> = Arc::new(|_| {});
    let query: Arc<Query<String, String>> = Arc::new(Query::new(key!["static"], clock, GcTime::default(), None, on_gc));

    assert!(!query.is_stale(StaleTime::Static));
    query.invalidate();
    assert!(!query.is_stale(StaleTime::Static), "Static exempts even an invalidated query from staleness");
    assert!(query.is_stale(StaleTime::Zero));
}
