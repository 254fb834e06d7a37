//! Infinite query observer (`spec.md` §4.6).
//!
//! Specializes [`super::observer::QueryObserver`] for data that is an
//! ordered sequence of pages: `data` is an [`InfiniteData`] rather than an
//! opaque `T`, and fetches are page-at-a-time operations
//! (`fetchNextPage`/`fetchPreviousPage`/`refetch`) instead of one opaque
//! fetcher invocation. Each page fetch still runs through the same
//! [`crate::retry`] machinery as a plain query, but the sequencing —
//! "fetch one page, append it, publish" or "refetch every page in order,
//! publishing after each" — doesn't fit the single-opaque-`Fetcher` shape
//! [`super::query::Query::fetch`] assumes, so this observer drives the
//! query's state directly via `begin_fetch_cycle`/`set_data`/`set_error`
//! (`spec.md` §9 "Polymorphism": the underlying `Query<T, E>` stays
//! agnostic to what `T` is, here `InfiniteData<P, Param>`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::trace;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::ids::ObserverId;
use crate::query::cache::QueryCache;
use crate::query::context::{CancelSignal, Direction, InfiniteQueryFnContext};
use crate::query::options::{GcTime, NetworkMode, RefetchPolicy, StaleTime};
use crate::query::query::Query;
use crate::query::state::{FetchStatus, Status};
use crate::retry::{default_retry_policy, RetryHandle, RetryHooks, RetryPolicy};
use crate::value::{Key, Value};

/// `{ pages, pageParams }` with `|pages| == |pageParams|` (`spec.md` §3.4).
/// Equality is deep/structural via the derived `PartialEq`, which is
/// sufficient here because `P`/`Param` are themselves compared structurally
/// by the caller's own `PartialEq` impl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfiniteData<P, Param> {
    pub pages: Vec<P>,
    pub page_params: Vec<Param>,
}

impl<P, Param> InfiniteData<P, Param> {
    pub fn empty() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl<P, Param> Default for InfiniteData<P, Param> {
    fn default() -> Self {
        Self::empty()
    }
}

/// One page fetcher: `fn(ctx) -> Future<Output = Result<Page, E>>`, invoked
/// once per page rather than once per cycle (`spec.md` §6 "Fetcher context
/// (query)" infinite extension: `pageParam`, `direction`).
pub type PageFetcher<P, Param, E> =
    Arc<dyn Fn(InfiniteQueryFnContext<Param, E>) -> BoxFuture<'static, Result<P, E>> + Send + Sync>;

type NextParamBuilder<P, Param> = Arc<dyn Fn(&InfiniteData<P, Param>) -> Option<Param> + Send + Sync>;

/// Configuration for an [`InfiniteQueryObserver`] (`spec.md` §6 "Options
/// (infinite query)"). Shares the base knobs of
/// [`crate::query::options::QueryOptions`] plus pagination-specific fields.
#[derive(Clone)]
pub struct InfiniteQueryOptions<P, Param, E> {
    pub enabled: bool,
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
    pub refetch_on_mount: RefetchPolicy,
    pub refetch_on_resume: RefetchPolicy,
    pub refetch_interval: Option<Duration>,
    pub retry: RetryPolicy<E>,
    pub retry_on_mount: bool,
    pub meta: Option<Value>,
    pub network_mode: NetworkMode,
    pub initial_page_param: Param,
    pub next_page_param_builder: NextParamBuilder<P, Param>,
    pub prev_page_param_builder: Option<NextParamBuilder<P, Param>>,
    /// Soft cap; when exceeded on `fetchNextPage` the oldest page drops, on
    /// `fetchPreviousPage` the newest (`spec.md` §4.6).
    pub max_pages: Option<usize>,
    /// Initial page count requested sequentially on first mount (`spec.md`
    /// §4.7 "`pages` option requests that many pages sequentially").
    pub pages: Option<usize>,
}

impl<P, Param, E> InfiniteQueryOptions<P, Param, E>
where
    Param: Clone,
{
    /// There's no sensible default `initial_page_param`/builder, so unlike
    /// [`crate::query::options::QueryOptions`] this has a constructor rather
    /// than a blanket `Default` impl: seed the required fields up front,
    /// then layer optional ones through the builder methods below.
    pub fn new(
        initial_page_param: Param,
        next_page_param_builder: impl Fn(&InfiniteData<P, Param>) -> Option<Param> + Send + Sync + 'static,
    ) -> Self {
        Self {
            enabled: true,
            stale_time: StaleTime::default(),
            gc_time: GcTime::default(),
            refetch_on_mount: RefetchPolicy::default(),
            refetch_on_resume: RefetchPolicy::default(),
            refetch_interval: None,
            retry: default_retry_policy(),
            retry_on_mount: true,
            meta: None,
            network_mode: NetworkMode::default(),
            initial_page_param,
            next_page_param_builder: Arc::new(next_page_param_builder),
            prev_page_param_builder: None,
            max_pages: None,
            pages: None,
        }
    }

    pub fn prev_page_param_builder(mut self, builder: impl Fn(&InfiniteData<P, Param>) -> Option<Param> + Send + Sync + 'static) -> Self {
        self.prev_page_param_builder = Some(Arc::new(builder));
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.max_pages = Some(n);
        self
    }

    pub fn initial_pages(mut self, n: usize) -> Self {
        self.pages = Some(n);
        self
    }

    pub fn stale_time(mut self, stale_time: StaleTime) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Derived, consumer-facing projection (`spec.md` §4.6 "Derived booleans").
#[derive(Clone)]
pub struct InfiniteQueryObserverResult<P, Param, E> {
    pub status: Status,
    pub fetch_status: FetchStatus,
    pub data: Option<InfiniteData<P, Param>>,
    pub error: Option<E>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    pub data_update_count: u64,
    pub error_update_count: u64,
    pub failure_count: u32,
    pub failure_reason: Option<E>,
    pub is_invalidated: bool,
    pub is_pending: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_fetching: bool,
    /// Always `false` during `fetchNextPage`/`fetchPreviousPage` — those use
    /// the dedicated booleans below instead (`spec.md` §4.6).
    pub is_refetching: bool,
    pub is_fetching_next_page: bool,
    pub is_fetching_previous_page: bool,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub is_stale: bool,
    pub is_fetched_after_mount: bool,
}

fn has_next<P, Param>(data: &Option<InfiniteData<P, Param>>, builder: &NextParamBuilder<P, Param>) -> bool {
    data.as_ref().is_some_and(|d| builder(d).is_some())
}

struct ObserverInner<P, Param, E> {
    id: ObserverId,
    key: Key,
    clock: Arc<dyn Clock>,
    options: RwLock<InfiniteQueryOptions<P, Param, E>>,
    query: Arc<Query<InfiniteData<P, Param>, E>>,
    fetcher: RwLock<PageFetcher<P, Param, E>>,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn(&InfiniteQueryObserverResult<P, Param, E>) + Send + Sync>)>>,
    next_listener_id: AtomicU64,
    query_listener_id: parking_lot::Mutex<Option<u64>>,
    fetched_after_mount: AtomicBool,
    last_seen_fetch_status: parking_lot::Mutex<FetchStatus>,
    is_fetching_next: AtomicBool,
    is_fetching_prev: AtomicBool,
    interval_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// `spec.md` §4.6. Cheap to clone — all clones share one binding.
pub struct InfiniteQueryObserver<P, Param, E>(Arc<ObserverInner<P, Param, E>>);

impl<P, Param, E> Clone for InfiniteQueryObserver<P, Param, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P, Param, E> InfiniteQueryObserver<P, Param, E>
where
    P: Clone + Send + Sync + 'static,
    Param: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        cache: &QueryCache,
        clock: Arc<dyn Clock>,
        key: Key,
        fetcher: PageFetcher<P, Param, E>,
        options: InfiniteQueryOptions<P, Param, E>,
    ) -> Self {
        let id = ObserverId::new();
        let query = cache.build::<InfiniteData<P, Param>, E>(&key, clock.clone(), options.gc_time, None);
        query.add_observer(id, options.meta.clone(), options.gc_time, options.enabled, options.stale_time == StaleTime::Static);

        let initial_fetch_status = query.state().fetch_status;

        let inner = Arc::new(ObserverInner {
            id,
            key,
            clock,
            options: RwLock::new(options),
            query,
            fetcher: RwLock::new(fetcher),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            query_listener_id: parking_lot::Mutex::new(None),
            fetched_after_mount: AtomicBool::new(false),
            last_seen_fetch_status: parking_lot::Mutex::new(initial_fetch_status),
            is_fetching_next: AtomicBool::new(false),
            is_fetching_prev: AtomicBool::new(false),
            interval_task: parking_lot::Mutex::new(None),
        });

        let weak: Weak<ObserverInner<P, Param, E>> = Arc::downgrade(&inner);
        let listener_id = inner.query.subscribe_raw(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                InfiniteQueryObserver(inner).on_query_update();
            }
        }));
        *inner.query_listener_id.lock() = Some(listener_id);

        let observer = Self(inner);
        observer.evaluate_mount_policy();
        observer.schedule_refetch_interval();
        observer
    }

    fn query(&self) -> &Arc<Query<InfiniteData<P, Param>, E>> {
        &self.0.query
    }

    fn on_query_update(&self) {
        let state = self.query().state();
        let mut became_terminal = false;
        {
            let mut last = self.0.last_seen_fetch_status.lock();
            if *last == FetchStatus::Fetching && state.fetch_status != FetchStatus::Fetching {
                became_terminal = true;
                self.0.fetched_after_mount.store(true, Ordering::SeqCst);
            }
            *last = state.fetch_status;
        }

        let result = self.result();
        let listeners: Vec<_> = self.0.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&result);
        }

        if became_terminal {
            self.schedule_refetch_interval();
        }
    }

    /// `spec.md` §4.6 "Derived booleans".
    pub fn result(&self) -> InfiniteQueryObserverResult<P, Param, E> {
        let state = self.query().state();
        let options = self.0.options.read();
        let is_stale = self.query().is_stale(options.stale_time);
        InfiniteQueryObserverResult {
            status: state.status,
            fetch_status: state.fetch_status,
            data: state.data.clone(),
            error: state.error.clone(),
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            data_update_count: state.data_update_count,
            error_update_count: state.error_update_count,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_invalidated: state.is_invalidated,
            is_pending: state.status == Status::Pending,
            is_success: state.status == Status::Success,
            is_error: state.status == Status::Error,
            is_fetching: state.fetch_status == FetchStatus::Fetching,
            is_refetching: false,
            is_fetching_next_page: self.0.is_fetching_next.load(Ordering::SeqCst),
            is_fetching_previous_page: self.0.is_fetching_prev.load(Ordering::SeqCst),
            has_next_page: has_next(&state.data, &options.next_page_param_builder),
            has_previous_page: options
                .prev_page_param_builder
                .as_ref()
                .is_some_and(|b| has_next(&state.data, b)),
            is_stale,
            is_fetched_after_mount: self.0.fetched_after_mount.load(Ordering::SeqCst),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&InfiniteQueryObserverResult<P, Param, E>) + Send + Sync + 'static) -> impl FnOnce() {
        let id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().push((id, Arc::new(listener)));
        let inner = self.0.clone();
        move || {
            inner.listeners.write().retain(|(lid, _)| *lid != id);
        }
    }

    fn evaluate_mount_policy(&self) {
        let options = self.0.options.read();
        if !options.enabled {
            return;
        }
        let last_was_error = self.query().state().status == Status::Error;
        let should_fetch = if last_was_error && options.retry_on_mount {
            true
        } else {
            match options.refetch_on_mount {
                RefetchPolicy::Always => true,
                RefetchPolicy::Never => false,
                RefetchPolicy::Stale => self.query().is_stale(options.stale_time) || self.query().state().data.is_none(),
            }
        };
        drop(options);
        if should_fetch {
            trace!("infinite observer mount policy triggered initial fetch");
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.fetch_initial().await;
            });
        }
    }

    pub fn on_resume(&self) {
        let options = self.0.options.read();
        if !options.enabled {
            return;
        }
        let should_fetch = match options.refetch_on_resume {
            RefetchPolicy::Always => true,
            RefetchPolicy::Never => false,
            RefetchPolicy::Stale => self.query().is_stale(options.stale_time),
        };
        drop(options);
        if should_fetch {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.refetch().await;
            });
        }
    }

    fn cancel_refetch_interval(&self) {
        if let Some(task) = self.0.interval_task.lock().take() {
            task.abort();
        }
    }

    fn schedule_refetch_interval(&self) {
        self.cancel_refetch_interval();
        let Some(interval) = self.0.options.read().refetch_interval else {
            return;
        };
        let weak: Weak<ObserverInner<P, Param, E>> = Arc::downgrade(&self.0);
        let clock = self.0.clock.clone();
        let task = tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let observer = InfiniteQueryObserver(inner);
                if observer.0.options.read().enabled {
                    let _ = observer.refetch().await;
                }
            }
        });
        *self.0.interval_task.lock() = Some(task);
    }

    fn fetch_meta(&self) -> Option<Value> {
        self.0.options.read().meta.clone()
    }

    /// Fetches a single page at `page_param` through the retry policy,
    /// mirroring `spec.md` §4.1's attempt/backoff loop without going
    /// through [`Query::fetch`]'s single-opaque-`Fetcher` dedup path.
    async fn fetch_one_page(&self, page_param: Param, direction: Direction) -> Result<P, EngineError<E>> {
        let fetcher = self.0.fetcher.read().clone();
        let policy = self.0.options.read().retry.clone();
        let meta = self.fetch_meta();
        let key = self.0.key.clone();
        let query = self.query().clone();
        let handle: RetryHandle<E> = RetryHandle::default();
        let handle_for_ctx = handle.clone();

        let attempt = {
            let page_param = page_param.clone();
            let fetcher = fetcher.clone();
            let key = key.clone();
            let meta = meta.clone();
            move || {
                let ctx = InfiniteQueryFnContext {
                    key: key.clone(),
                    meta: meta.clone(),
                    signal: CancelSignal(handle_for_ctx.clone()),
                    page_param: page_param.clone(),
                    direction,
                };
                fetcher(ctx)
            }
        };

        let hooks = RetryHooks {
            on_error: Some(Arc::new({
                let query = query.clone();
                move |count: u32, err: &E| {
                    query.record_fetch_failure(count, err);
                }
            })),
            ..RetryHooks::default()
        };

        crate::retry::run(attempt, policy, hooks, Arc::new(|| true), self.0.clock.clone(), handle).await
    }

    /// `spec.md` §4.7 "`pages` option requests that many pages sequentially
    /// on initial load" — also the plain initial fetch (`pages` defaults to
    /// one page).
    pub async fn fetch_initial(&self) -> Result<InfiniteData<P, Param>, EngineError<E>> {
        if self.query().state().fetch_status == FetchStatus::Fetching {
            return Ok(self.query().state().data.unwrap_or_default());
        }
        let page_count = self.0.options.read().pages.unwrap_or(1).max(1);
        let initial_param = self.0.options.read().initial_page_param.clone();

        self.query().begin_fetch_cycle();
        let mut data = InfiniteData::empty();
        let mut page_param = initial_param;
        for i in 0..page_count {
            match self.fetch_one_page(page_param.clone(), Direction::Forward).await {
                Ok(page) => {
                    data.pages.push(page);
                    data.page_params.push(page_param.clone());
                    let committed = data.clone();
                    self.query().set_data(move |_| Some(committed.clone()), None);
                    if i + 1 < page_count {
                        let builder = self.0.options.read().next_page_param_builder.clone();
                        match builder(&data) {
                            Some(next) => page_param = next,
                            None => break,
                        }
                    }
                }
                Err(EngineError::Source(err)) => {
                    self.query().set_error(err.clone());
                    return Err(EngineError::Source(err));
                }
                Err(EngineError::Aborted) => {
                    self.query().end_fetch_cycle_idle();
                    return Err(EngineError::Aborted);
                }
            }
        }
        self.query().end_fetch_cycle_idle();
        Ok(data)
    }

    /// `spec.md` §4.6 `fetchNextPage`: no-op if `hasNextPage` is false.
    pub async fn fetch_next_page(&self) -> Result<InfiniteData<P, Param>, EngineError<E>> {
        let result = self.result();
        let Some(current) = result.data.clone() else {
            return self.fetch_initial().await;
        };
        if !result.has_next_page {
            return Ok(current);
        }
        let builder = self.0.options.read().next_page_param_builder.clone();
        let Some(next_param) = builder(&current) else {
            return Ok(current);
        };

        self.0.is_fetching_next.store(true, Ordering::SeqCst);
        self.query().begin_fetch_cycle();
        let outcome = self.fetch_one_page(next_param.clone(), Direction::Forward).await;
        let final_result = match outcome {
            Ok(page) => {
                let mut pages = current.pages.clone();
                let mut params = current.page_params.clone();
                pages.push(page);
                params.push(next_param);
                if let Some(max) = self.0.options.read().max_pages {
                    while pages.len() > max {
                        pages.remove(0);
                        params.remove(0);
                    }
                }
                let next_data = InfiniteData { pages, page_params: params };
                let committed = next_data.clone();
                self.query().set_data(move |_| Some(committed.clone()), None);
                self.query().end_fetch_cycle_idle();
                Ok(next_data)
            }
            Err(EngineError::Source(err)) => {
                self.query().set_error(err.clone());
                Err(EngineError::Source(err))
            }
            Err(EngineError::Aborted) => {
                self.query().end_fetch_cycle_idle();
                Err(EngineError::Aborted)
            }
        };
        self.0.is_fetching_next.store(false, Ordering::SeqCst);
        final_result
    }

    /// `spec.md` §4.6 `fetchPreviousPage`: mirror of `fetchNextPage` using
    /// `prevPageParamBuilder` and prepending.
    pub async fn fetch_previous_page(&self) -> Result<InfiniteData<P, Param>, EngineError<E>> {
        let result = self.result();
        let Some(current) = result.data.clone() else {
            return self.fetch_initial().await;
        };
        if !result.has_previous_page {
            return Ok(current);
        }
        let Some(builder) = self.0.options.read().prev_page_param_builder.clone() else {
            return Ok(current);
        };
        let Some(prev_param) = builder(&current) else {
            return Ok(current);
        };

        self.0.is_fetching_prev.store(true, Ordering::SeqCst);
        self.query().begin_fetch_cycle();
        let outcome = self.fetch_one_page(prev_param.clone(), Direction::Backward).await;
        let final_result = match outcome {
            Ok(page) => {
                let mut pages = current.pages.clone();
                let mut params = current.page_params.clone();
                pages.insert(0, page);
                params.insert(0, prev_param);
                if let Some(max) = self.0.options.read().max_pages {
                    while pages.len() > max {
                        pages.pop();
                        params.pop();
                    }
                }
                let next_data = InfiniteData { pages, page_params: params };
                let committed = next_data.clone();
                self.query().set_data(move |_| Some(committed.clone()), None);
                self.query().end_fetch_cycle_idle();
                Ok(next_data)
            }
            Err(EngineError::Source(err)) => {
                self.query().set_error(err.clone());
                Err(EngineError::Source(err))
            }
            Err(EngineError::Aborted) => {
                self.query().end_fetch_cycle_idle();
                Err(EngineError::Aborted)
            }
        };
        self.0.is_fetching_prev.store(false, Ordering::SeqCst);
        final_result
    }

    /// `spec.md` §4.6 `refetch`: re-runs the fetcher for every existing page
    /// sequentially, publishing each success immediately so observers see
    /// partial refresh; a page failure stops the sequence with `data`
    /// retaining whatever refreshed before it (`spec.md` §8 property 10).
    pub async fn refetch(&self) -> Result<InfiniteData<P, Param>, EngineError<E>> {
        if self.query().state().fetch_status == FetchStatus::Fetching {
            return Ok(self.query().state().data.unwrap_or_default());
        }
        let Some(existing) = self.query().state().data else {
            return self.fetch_initial().await;
        };
        if existing.is_empty() {
            return Ok(existing);
        }

        self.query().begin_fetch_cycle();
        let mut refreshed = InfiniteData::empty();
        for page_param in existing.page_params.iter().cloned() {
            match self.fetch_one_page(page_param.clone(), Direction::Forward).await {
                Ok(page) => {
                    refreshed.pages.push(page);
                    refreshed.page_params.push(page_param);
                    let committed = refreshed.clone();
                    self.query().set_data(move |_| Some(committed.clone()), None);
                }
                Err(EngineError::Source(err)) => {
                    self.query().set_error(err.clone());
                    return Err(EngineError::Source(err));
                }
                Err(EngineError::Aborted) => {
                    self.query().end_fetch_cycle_idle();
                    return Err(EngineError::Aborted);
                }
            }
        }
        self.query().end_fetch_cycle_idle();
        Ok(refreshed)
    }

    pub fn update_options(&self, new_options: InfiniteQueryOptions<P, Param, E>) {
        let was_enabled = self.0.options.read().enabled;
        *self.0.options.write() = new_options.clone();
        self.query().update_observer(
            self.0.id,
            new_options.meta.clone(),
            new_options.gc_time,
            new_options.enabled,
            new_options.stale_time == StaleTime::Static,
        );
        if !was_enabled && new_options.enabled {
            self.evaluate_mount_policy();
        }
        self.schedule_refetch_interval();
        self.on_query_update();
    }

    pub fn set_fetcher(&self, fetcher: PageFetcher<P, Param, E>) {
        *self.0.fetcher.write() = fetcher;
    }

    /// `dispose`/`onUnmount` (`spec.md` §4.5, shared by the infinite
    /// variant).
    pub fn dispose(&self) {
        self.cancel_refetch_interval();
        if let Some(listener_id) = self.0.query_listener_id.lock().take() {
            self.query().unsubscribe_raw(listener_id);
        }
        self.query().remove_observer(self.0.id);
        self.0.listeners.write().clear();
    }
}
