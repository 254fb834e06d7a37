use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use query_engine::key;
use query_engine::query::cache::{Filter, QueryCache};
use query_engine::query::client::QueryClient;
use query_engine::query::context::QueryFnContext;
use query_engine::query::query::Fetcher;
use query_engine::Key;

#[derive(Clone, Debug)]
struct BenchUser {
    id: u32,
    name: String,
}

fn user_fetcher(id: u32) -> Fetcher<BenchUser, String> {
    Arc::new(move |_ctx: QueryFnContext<String>| {
        Box::pin(async move {
            Ok(BenchUser {
                id,
                name: format!("user-{id}"),
            })
        })
    })
}

fn benchmark_query_creation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("query_creation");

    group.bench_function("build_single_query", |b| {
        b.iter(|| {
            rt.block_on(async {
                let client = QueryClient::new();
                let result = client
                    .fetch_query(key!["users", 1.0], user_fetcher(1), client.default_query_options())
                    .await;
                black_box(result)
            });
        });
    });

    group.finish();
}

fn benchmark_cache_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let client = QueryClient::new();
    rt.block_on(async {
        for id in 0..100u32 {
            let _ = client
                .fetch_query(key!["users", id as f64], user_fetcher(id), client.default_query_options())
                .await;
        }
    });

    let mut group = c.benchmark_group("cache_lookup");
    group.bench_function("typed_get_hit", |b| {
        b.iter(|| {
            let data = client.get_query_data::<BenchUser, String>(&key!["users", 42.0]);
            black_box(data)
        });
    });
    group.bench_function("typed_get_miss", |b| {
        b.iter(|| {
            let data = client.get_query_data::<BenchUser, String>(&key!["users", 9999.0]);
            black_box(data)
        });
    });
    group.finish();
}

fn benchmark_filter_matching(c: &mut Criterion) {
    let cache = QueryCache::new();
    let clock: Arc<dyn query_engine::clock::Clock> = Arc::new(query_engine::clock::SystemClock);
    for id in 0..200u32 {
        let _ = cache.build::<BenchUser, String>(
            &key!["users", id as f64],
            clock.clone(),
            query_engine::query::options::GcTime::default(),
            None,
        );
    }

    let mut group = c.benchmark_group("filter_matching");
    group.bench_function("find_all_by_prefix", |b| {
        b.iter(|| {
            let filter = Filter::by_key(key!["users"]);
            black_box(cache.find_all(&filter))
        });
    });
    group.bench_function("find_all_exact", |b| {
        b.iter(|| {
            let filter = Filter::by_key(key!["users", 100.0]).exact();
            black_box(cache.find_all(&filter))
        });
    });
    group.finish();
}

fn benchmark_invalidate_queries(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("invalidate_queries");

    group.bench_function("invalidate_by_prefix", |b| {
        b.iter(|| {
            rt.block_on(async {
                let client = QueryClient::new();
                for id in 0..20u32 {
                    let _ = client
                        .fetch_query(key!["users", id as f64], user_fetcher(id), client.default_query_options())
                        .await;
                }
                let filter = Filter::by_key(key!["users"]);
                client.invalidate_queries(&filter);
            });
        });
    });

    group.finish();
}

fn benchmark_key_equality(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_equality");
    let a: Key = key!["users", 1.0, "posts"];
    let b_key: Key = key!["users", 1.0, "posts"];

    group.bench_function("deep_equal", |b| {
        b.iter(|| black_box(&a == &b_key));
    });
    group.bench_function("starts_with", |b| {
        b.iter(|| black_box(a.starts_with(&key!["users"])));
    });

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .sample_size(20)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));
    targets =
        benchmark_query_creation,
        benchmark_cache_lookup,
        benchmark_filter_matching,
        benchmark_invalidate_queries,
        benchmark_key_equality,
);

criterion_main!(benches);
