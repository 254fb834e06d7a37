use std::sync::Arc;
use std::time::Duration;

use query_engine::clock::SystemClock;
use query_engine::key;
use query_engine::query::cache::QueryCache;
use query_engine::query::context::InfiniteQueryFnContext;
use query_engine::query::infinite::{InfiniteQueryObserver, InfiniteQueryOptions, PageFetcher};

fn disabled_forward_options(initial: u32) -> InfiniteQueryOptions<String, u32, String> {
    InfiniteQueryOptions::new(initial, |data| data.page_params.last().map(|last| last + 1)).enabled(false)
}

/// S1: fetch an initial page, then fetch one more; `dataUpdateCount` tracks
/// every committed page.
#[tokio::test(start_paused = true)]
async fn initial_fetch_then_next_page_appends() {
    let cache = QueryCache::new();
    let clock = Arc::new(SystemClock);
    let fetcher: PageFetcher<String, u32, String> = Arc::new(|ctx: InfiniteQueryFnContext<u32, String>| {
        Box::pin(async move { Ok(format!("page-{}", ctx.page_param)) })
    });

    let observer = InfiniteQueryObserver::new(&cache, clock, key!["t"], fetcher, disabled_forward_options(0));

    let data = observer.fetch_initial().await.unwrap();
    assert_eq!(data.pages, vec!["page-0"]);
    assert_eq!(data.page_params, vec![0]);
    let result = observer.result();
    assert!(result.is_success);
    assert_eq!(result.data_update_count, 1);

    let data = observer.fetch_next_page().await.unwrap();
    assert_eq!(data.pages, vec!["page-0", "page-1"]);
    assert_eq!(data.page_params, vec![0, 1]);
    assert_eq!(observer.result().data_update_count, 2);
}

/// S2: with `maxPages = 2`, fetching a third page drops the oldest.
#[tokio::test(start_paused = true)]
async fn max_pages_drops_oldest_page() {
    let cache = QueryCache::new();
    let clock = Arc::new(SystemClock);
    let fetcher: PageFetcher<String, u32, String> = Arc::new(|ctx: InfiniteQueryFnContext<u32, String>| {
        Box::pin(async move { Ok(format!("page-{}", ctx.page_param)) })
    });

    let options = disabled_forward_options(0).max_pages(2);
    let observer = InfiniteQueryObserver::new(&cache, clock, key!["t2"], fetcher, options);

    observer.fetch_initial().await.unwrap();
    observer.fetch_next_page().await.unwrap();
    let data = observer.fetch_next_page().await.unwrap();

    assert_eq!(data.pages, vec!["page-1", "page-2"]);
    assert_eq!(data.page_params, vec![1, 2]);
}

/// S3: a fetcher that always fails exhausts a 3-retry policy; failure count
/// lands on 4 and the query ends in `error`.
#[tokio::test(start_paused = true)]
async fn exhausted_retries_land_in_error_with_failure_count_four() {
    use query_engine::query::query::Query;

    let clock = Arc::new(SystemClock);
    let on_gc: Arc<dyn Fn(&query_engine::Key) + Send + Sync> = Arc::new(|_| {});
    let query: Arc<Query<String, String>> = Arc::new(Query::new(
        key!["flaky"],
        clock,
        query_engine::query::options::GcTime::default(),
        None,
        on_gc,
    ));

    let fetcher: query_engine::query::query::Fetcher<String, String> =
        Arc::new(|_ctx| Box::pin(async move { Err::<String, String>("boom".to_string()) }));
    let policy: query_engine::retry::RetryPolicy<String> = Arc::new(|n, _| if n < 3 { Some(Duration::from_secs(1)) } else { None });

    let result = query.fetch(fetcher, policy, None).await;
    assert!(result.is_err());
    let state = query.state();
    assert_eq!(state.fetch_failure_count, 4);
    assert_eq!(state.status, query_engine::query::state::Status::Error);
    assert_eq!(state.error, Some("boom".to_string()));
}
