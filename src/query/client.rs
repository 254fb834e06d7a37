//! Query client façade (`spec.md` §4.7).
//!
//! Everything here is a thin, type-erasure-aware wrapper over
//! [`QueryCache`]/[`MutationCache`] plus the two observer constructors —
//! the client itself holds no query state of its own beyond the writable
//! defaults layered into every new observer (`spec.md` §4.11 "writable
//! client defaults").

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::mutation::cache::MutationCache;
use crate::mutation::observer::MutationObserver;
use crate::mutation::options::{MutationFn, MutationOptions};
use crate::retry::{default_retry_policy, no_retry_policy};
use crate::value::Key;

use super::cache::{Filter, QueryCache};
use super::infinite::{InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions, PageFetcher};
use super::observer::QueryObserver;
use super::options::{GcTime, NetworkMode, QueryOptions, RefetchPolicy, StaleTime};
use super::query::Fetcher;
use super::state::QueryState;

/// Writable defaults resolved into every new observer/query at construction
/// time (`spec.md` §4.7 "`defaultQueryOptions`/`defaultMutationOptions` —
/// writable; new observers and new queries resolve options against whatever
/// is current").
#[derive(Debug, Clone)]
pub struct QueryClientConfig {
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
    pub refetch_on_mount: RefetchPolicy,
    pub refetch_on_resume: RefetchPolicy,
    pub retry_on_mount: bool,
    pub network_mode: NetworkMode,
    pub mutation_gc_time: GcTime,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            stale_time: StaleTime::default(),
            gc_time: GcTime::default(),
            refetch_on_mount: RefetchPolicy::default(),
            refetch_on_resume: RefetchPolicy::default(),
            retry_on_mount: true,
            network_mode: NetworkMode::default(),
            mutation_gc_time: GcTime::default(),
        }
    }
}

struct ClientInner {
    clock: Arc<dyn Clock>,
    queries: QueryCache,
    mutations: MutationCache,
    config: parking_lot::RwLock<QueryClientConfig>,
}

/// The process-local façade over both engines (`spec.md` §5 "Shared resource
/// policy": the two caches are process-global by convention of a single
/// client instance). Cheap to clone — every clone shares the same caches.
#[derive(Clone)]
pub struct QueryClient(Arc<ClientInner>);

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self(Arc::new(ClientInner {
            clock,
            queries: QueryCache::new(),
            mutations: MutationCache::new(),
            config: parking_lot::RwLock::new(QueryClientConfig::default()),
        }))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.0.clock.clone()
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.0.queries
    }

    pub fn mutation_cache(&self) -> &MutationCache {
        &self.0.mutations
    }

    pub fn config(&self) -> QueryClientConfig {
        self.0.config.read().clone()
    }

    /// `defaultQueryOptions`/`defaultMutationOptions` setter half.
    pub fn set_default_query_options(&self, config: QueryClientConfig) {
        *self.0.config.write() = config;
    }

    /// Fresh [`QueryOptions`] layered against the current client defaults
    /// (`spec.md` §4.5 step 1 "client defaults → observer options").
    pub fn default_query_options<T, E>(&self) -> QueryOptions<T, E> {
        let config = self.0.config.read();
        QueryOptions {
            enabled: true,
            stale_time: config.stale_time,
            gc_time: config.gc_time,
            refetch_on_mount: config.refetch_on_mount,
            refetch_on_resume: config.refetch_on_resume,
            refetch_interval: None,
            retry: default_retry_policy(),
            retry_on_mount: config.retry_on_mount,
            seed: None,
            seed_updated_at: None,
            placeholder: None,
            meta: None,
            network_mode: config.network_mode,
        }
    }

    pub fn default_mutation_options<T, V, C, E>(&self) -> MutationOptions<T, V, C, E> {
        let config = self.0.config.read();
        MutationOptions {
            mutation_key: None,
            meta: None,
            retry: no_retry_policy(),
            gc_time: config.mutation_gc_time,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidates: Vec::new(),
        }
    }

    /// Binds a [`QueryObserver`] to `key`, resolved against this client's
    /// cache and clock.
    pub fn build_query_observer<T, E>(&self, key: Key, fetcher: Fetcher<T, E>, options: QueryOptions<T, E>) -> QueryObserver<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        QueryObserver::new(&self.0.queries, self.0.clock.clone(), key, fetcher, options)
    }

    pub fn build_infinite_query_observer<P, Param, E>(
        &self,
        key: Key,
        fetcher: PageFetcher<P, Param, E>,
        options: InfiniteQueryOptions<P, Param, E>,
    ) -> InfiniteQueryObserver<P, Param, E>
    where
        P: Clone + Send + Sync + 'static,
        Param: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        InfiniteQueryObserver::new(&self.0.queries, self.0.clock.clone(), key, fetcher, options)
    }

    pub fn build_mutation_observer<T, V, C, E>(&self, mutation_fn: MutationFn<T, V, E>, options: MutationOptions<T, V, C, E>) -> MutationObserver<T, V, C, E>
    where
        T: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        MutationObserver::new(self.0.clock.clone(), self.0.mutations.clone(), self.0.queries.clone(), mutation_fn, options)
    }

    /// `fetchQuery`: returns cached data if not stale, otherwise drives a
    /// fetch through [`super::query::Query::fetch`] (`fetchOptimistic`,
    /// bypassing observer listener semantics).
    pub async fn fetch_query<T, E>(&self, key: Key, fetcher: Fetcher<T, E>, options: QueryOptions<T, E>) -> Result<T, EngineError<E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let seed = options.seed.clone().map(|data| (data, options.seed_updated_at.unwrap_or_else(|| self.0.clock.now())));
        let query = self.0.queries.build::<T, E>(&key, self.0.clock.clone(), options.gc_time, seed);
        if !query.is_stale(options.stale_time) {
            if let Some(data) = query.state().data {
                return Ok(data);
            }
        }
        query.fetch(fetcher, options.retry.clone(), options.meta.clone()).await
    }

    /// `prefetchQuery`: like [`QueryClient::fetch_query`] but swallows the
    /// error — state still reflects the failure.
    pub async fn prefetch_query<T, E>(&self, key: Key, fetcher: Fetcher<T, E>, options: QueryOptions<T, E>)
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let _ = self.fetch_query(key, fetcher, options).await;
    }

    pub fn get_query_data<T, E>(&self, key: &Key) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.0.queries.get_typed::<T, E>(key).and_then(|q| q.state().data)
    }

    pub fn get_query_state<T, E>(&self, key: &Key) -> Option<QueryState<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.0.queries.get_typed::<T, E>(key).map(|q| q.state())
    }

    /// `setQueryData`: creates the query on demand if absent (with no
    /// fetcher registered — unlike a real fetch cycle this path never calls
    /// one) and writes through [`super::query::Query::set_data`], which
    /// already resets `error`/`isInvalidated` and notifies observers.
    pub fn set_query_data<T, E>(&self, key: &Key, updater: impl FnOnce(Option<&T>) -> Option<T>, updated_at: Option<Instant>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let query = self.0.queries.build::<T, E>(key, self.0.clock.clone(), self.0.config.read().gc_time, None);
        query.set_data(updater, updated_at)
    }

    /// `invalidateQueries`: marks matches invalidated. Does not itself force
    /// a refetch — an already-mounted active observer's refetch policy (not
    /// this call) decides that on its own next trigger (`spec.md` §4.7,
    /// §8 S5).
    pub fn invalidate_queries(&self, filter: &Filter) {
        for query in self.0.queries.find_all(filter) {
            query.invalidate();
        }
    }

    /// `refetchQueries`: triggers a fetch on every matching active
    /// (≥1 observer, `enabled=true`) non-`static` query; awaits all.
    pub async fn refetch_queries(&self, filter: &Filter) {
        let matches = self.0.queries.find_all(filter);
        let futures = matches
            .into_iter()
            .filter(|q| q.is_active() && !q.is_static())
            .map(|q| q.refetch());
        join_all(futures).await;
    }

    /// `resetQueries`: resets state to seed/pending, cancels in-flight
    /// fetches with revert, then schedules a refetch for queries that are
    /// still active afterwards.
    pub async fn reset_queries(&self, filter: &Filter) {
        let matches = self.0.queries.find_all(filter);
        for query in &matches {
            query.cancel(true, true);
            query.wait_until_idle().await;
            query.reset();
        }
        let futures = matches.into_iter().filter(|q| q.is_active()).map(|q| q.refetch());
        join_all(futures).await;
    }

    /// `removeQueries`: unconditional removal, no refetch.
    pub fn remove_queries(&self, filter: &Filter) {
        let keys: Vec<Key> = self.0.queries.find_all(filter).iter().map(|q| q.key().clone()).collect();
        for key in keys {
            self.0.queries.remove_by_key(&key);
        }
    }

    /// `cancelQueries`: applies `Query.cancel` to each match, returns once
    /// all are idle.
    pub async fn cancel_queries(&self, filter: &Filter, revert: bool, silent: bool) {
        let matches = self.0.queries.find_all(filter);
        for query in &matches {
            query.cancel(revert, silent);
        }
        join_all(matches.iter().map(|q| q.wait_until_idle())).await;
    }

    /// `fetchInfiniteQuery`: builds a throwaway observer (so the `pages`
    /// option's sequential initial load and per-page retry machinery run
    /// unchanged), fetches, then disposes it — observer listener semantics
    /// are bypassed exactly like plain `fetchQuery`/`fetchOptimistic`.
    pub async fn fetch_infinite_query<P, Param, E>(
        &self,
        key: Key,
        fetcher: PageFetcher<P, Param, E>,
        options: InfiniteQueryOptions<P, Param, E>,
    ) -> Result<InfiniteData<P, Param>, EngineError<E>>
    where
        P: Clone + Send + Sync + 'static,
        Param: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let observer = InfiniteQueryObserver::new(&self.0.queries, self.0.clock.clone(), key, fetcher, options);
        let result = observer.fetch_initial().await;
        observer.dispose();
        result
    }

    pub async fn prefetch_infinite_query<P, Param, E>(&self, key: Key, fetcher: PageFetcher<P, Param, E>, options: InfiniteQueryOptions<P, Param, E>)
    where
        P: Clone + Send + Sync + 'static,
        Param: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let _ = self.fetch_infinite_query(key, fetcher, options).await;
    }

    pub fn get_infinite_query_data<P, Param, E>(&self, key: &Key) -> Option<InfiniteData<P, Param>>
    where
        P: Clone + Send + Sync + 'static,
        Param: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.0.queries.get_typed::<InfiniteData<P, Param>, E>(key).and_then(|q| q.state().data)
    }
}
