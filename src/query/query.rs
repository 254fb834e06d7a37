//! The per-key query state machine (`spec.md` §3.3 / §4.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, instrument, trace, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::ids::ObserverId;
use crate::query::context::QueryFnContext;
use crate::query::options::{GcTime, StaleTime};
use crate::query::state::{FetchStatus, QueryState, Status};
use crate::retry::{RetryHandle, RetryHooks, RetryPolicy};
use crate::value::{deep_merge, Key, Value};

/// `fn(ctx) -> Future<Output = Result<T, E>>` — an opaque, caller-supplied
/// fetcher (`spec.md` §1 Non-goals: "fetch functions are opaque callbacks").
pub type Fetcher<T, E> = Arc<dyn Fn(QueryFnContext<E>) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

#[derive(Clone, Copy)]
struct CancelRequest {
    revert: bool,
    silent: bool,
}

/// One observer's contribution to a query's aggregate bookkeeping: its meta
/// (merged via [`deep_merge`]), its requested GC duration (coalesced via
/// [`GcTime::coalesce`]), and the two observer-scoped flags
/// [`crate::query::cache::ErasedQuery::is_active`]/`is_static` need from an
/// otherwise type-erased query (`spec.md` §4.7 `refetchQueries`: "active
/// (≥1 observer, `enabled=true`) non-`static` query").
#[derive(Clone, Copy)]
struct ObserverFlags {
    enabled: bool,
    is_static: bool,
}

struct ObserverEntry {
    id: ObserverId,
    meta: Option<Value>,
    gc_time: GcTime,
    flags: ObserverFlags,
}

/// The handle returned by [`Query::fetch`]: clones of it resolve together,
/// which is exactly the "same in-flight Promise" dedup guarantee from
/// `spec.md` §4.2 step 1 / §8 property 6.
pub type FetchFuture<T, E> = Shared<BoxFuture<'static, Result<T, EngineError<E>>>>;

/// Per-key state machine: cached data/error, fetch coordination, GC timer,
/// observer registry (`spec.md` §3.3).
pub struct Query<T, E> {
    key: Key,
    clock: Arc<dyn Clock>,
    state: RwLock<QueryState<T, E>>,
    seed: Option<(T, Instant)>,
    snapshot: Mutex<Option<QueryState<T, E>>>,
    observers: RwLock<Vec<ObserverEntry>>,
    observer_meta: RwLock<Option<Value>>,
    default_gc_time: GcTime,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_listener_id: AtomicU64,
    changed: Notify,
    in_flight: Mutex<Option<FetchFuture<T, E>>>,
    retry_handle: Mutex<Option<RetryHandle<E>>>,
    pending_cancel: Mutex<Option<CancelRequest>>,
    cycle: AtomicU64,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_fetcher: Mutex<Option<Fetcher<T, E>>>,
    last_policy: Mutex<Option<RetryPolicy<E>>>,
    /// Invoked once this query has zero observers, no in-flight fetch, and
    /// its GC timer has fired — the cache is the only thing that removes a
    /// query from its map, never the query itself (`spec.md` §9 "Ownership
    /// of queries").
    on_gc: Arc<dyn Fn(&Key) + Send + Sync>,
}

impl<T, E> Query<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: Key,
        clock: Arc<dyn Clock>,
        default_gc_time: GcTime,
        seed: Option<(T, Instant)>,
        on_gc: Arc<dyn Fn(&Key) + Send + Sync>,
    ) -> Self {
        let state = match &seed {
            Some((data, at)) => QueryState::with_initial_data(data.clone(), *at),
            None => QueryState::idle(),
        };
        Self {
            key,
            clock,
            state: RwLock::new(state),
            seed,
            snapshot: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            observer_meta: RwLock::new(None),
            default_gc_time,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            changed: Notify::new(),
            in_flight: Mutex::new(None),
            retry_handle: Mutex::new(None),
            pending_cancel: Mutex::new(None),
            cycle: AtomicU64::new(0),
            gc_task: Mutex::new(None),
            last_fetcher: Mutex::new(None),
            last_policy: Mutex::new(None),
            on_gc,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn state(&self) -> QueryState<T, E> {
        self.state.read().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.read().is_invalidated
    }

    /// `spec.md` §4.5 "Staleness".
    pub fn is_stale(&self, stale_time: StaleTime) -> bool {
        let state = self.state.read();
        if state.is_invalidated {
            return !matches!(stale_time, StaleTime::Static);
        }
        match stale_time {
            StaleTime::Zero => true,
            StaleTime::Infinity | StaleTime::Static => false,
            StaleTime::After(d) => match state.data_updated_at {
                None => true,
                Some(updated_at) => self.clock.now().saturating_duration_since(updated_at) >= d,
            },
        }
    }

    pub fn subscribe_raw(&self, listener: Arc<dyn Fn() + Send + Sync>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe_raw(&self, id: u64) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    fn notify(&self) {
        let listeners: Vec<Arc<dyn Fn() + Send + Sync>> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener();
        }
        self.changed.notify_waiters();
    }

    /// Waits until `fetchStatus` leaves `fetching`. Used by
    /// `QueryClient::cancel_queries`, which must return once every match is
    /// idle regardless of whether cancellation was silent (silence only
    /// governs the outer fetch future, not the state transition).
    pub async fn wait_until_idle(&self) {
        loop {
            if self.state.read().fetch_status != FetchStatus::Fetching {
                return;
            }
            self.changed.notified().await;
        }
    }

    fn aggregated_meta(&self) -> Option<Value> {
        self.observer_meta.read().clone()
    }

    fn recompute_meta(&self) {
        let observers = self.observers.read();
        let mut aggregate: Option<Value> = None;
        for entry in observers.iter() {
            if let Some(meta) = &entry.meta {
                aggregate = Some(match aggregate {
                    Some(acc) => deep_merge(&acc, meta),
                    None => meta.clone(),
                });
            }
        }
        *self.observer_meta.write() = aggregate;
    }

    fn effective_gc_time(&self) -> GcTime {
        self.observers
            .read()
            .iter()
            .fold(self.default_gc_time, |acc, entry| acc.coalesce(entry.gc_time))
    }

    /// `spec.md` §4.2 `addObserver`: cancels a scheduled GC.
    pub fn add_observer(&self, id: ObserverId, meta: Option<Value>, gc_time: GcTime, enabled: bool, is_static: bool) {
        self.cancel_gc();
        self.observers.write().push(ObserverEntry {
            id,
            meta,
            gc_time,
            flags: ObserverFlags { enabled, is_static },
        });
        self.recompute_meta();
        trace!(key = ?self.key, observers = self.observer_count(), "observer attached");
    }

    /// Updates an already-registered observer's meta/gc/flags contribution
    /// in place (used by `QueryObserver::update_options`) instead of pushing
    /// a second entry for the same id.
    pub fn update_observer(&self, id: ObserverId, meta: Option<Value>, gc_time: GcTime, enabled: bool, is_static: bool) {
        let mut observers = self.observers.write();
        if let Some(entry) = observers.iter_mut().find(|e| e.id == id) {
            entry.meta = meta;
            entry.gc_time = gc_time;
            entry.flags = ObserverFlags { enabled, is_static };
        } else {
            observers.push(ObserverEntry {
                id,
                meta,
                gc_time,
                flags: ObserverFlags { enabled, is_static },
            });
        }
        drop(observers);
        self.recompute_meta();
    }

    /// `spec.md` §4.2 `removeObserver`: schedules one when the set empties.
    pub fn remove_observer(self: &Arc<Self>, id: ObserverId) {
        self.observers.write().retain(|e| e.id != id);
        self.recompute_meta();
        trace!(key = ?self.key, observers = self.observer_count(), "observer detached");
        if self.observers.read().is_empty() {
            self.schedule_gc();
        }
    }

    /// `spec.md` §4.7 `refetchQueries`/`resetQueries`: a query is "active"
    /// when at least one of its observers has `enabled = true`.
    pub fn is_active(&self) -> bool {
        self.observers.read().iter().any(|e| e.flags.enabled)
    }

    /// A query is treated as `static` only when it has at least one observer
    /// and every one of them opted into `static` (a query with zero
    /// observers has no opinion and is not considered static).
    pub fn is_static(&self) -> bool {
        let observers = self.observers.read();
        !observers.is_empty() && observers.iter().all(|e| e.flags.is_static)
    }

    fn cancel_gc(&self) {
        if let Some(handle) = self.gc_task.lock().take() {
            handle.abort();
        }
    }

    /// `spec.md` §4.4. `gcTime = Infinity` disables GC; `Zero` removes on
    /// the next tick.
    fn schedule_gc(self: &Arc<Self>) {
        self.cancel_gc();
        let gc_time = self.effective_gc_time();
        let Some(duration) = gc_time.as_duration() else {
            return;
        };
        let this = Arc::clone(self);
        let clock = self.clock.clone();
        let task = tokio::spawn(async move {
            clock.sleep(duration).await;
            if this.observers.read().is_empty() && this.state.read().fetch_status != FetchStatus::Fetching {
                debug!(key = ?this.key, "garbage collecting query");
                (this.on_gc)(&this.key);
            }
        });
        *self.gc_task.lock() = Some(task);
    }

    /// `spec.md` §4.2 `setData`.
    pub fn set_data(&self, updater: impl FnOnce(Option<&T>) -> Option<T>, updated_at: Option<Instant>) -> Option<T> {
        let mut state = self.state.write();
        let next = updater(state.data.as_ref());
        state.data = next.clone();
        state.error = None;
        state.is_invalidated = false;
        state.status = Status::Success;
        state.data_updated_at = Some(updated_at.unwrap_or_else(|| self.clock.now()));
        state.data_update_count += 1;
        drop(state);
        self.notify();
        next
    }

    /// Opens a manually-driven fetch cycle without an accompanying
    /// `Fetcher`/retry controller — used by
    /// [`crate::query::infinite::InfiniteQueryObserver`], whose
    /// `fetchNextPage`/`fetchPreviousPage`/`refetch` (`spec.md` §4.6) drive
    /// their own per-page retry loops and commit pages one at a time via
    /// [`Query::set_data`] rather than handing a single opaque `Fetcher` to
    /// [`Query::fetch`].
    pub fn begin_fetch_cycle(&self) {
        let mut state = self.state.write();
        state.fetch_status = FetchStatus::Fetching;
        state.fetch_failure_count = 0;
        state.fetch_failure_reason = None;
        drop(state);
        self.notify();
    }

    /// Counterpart to [`Query::begin_fetch_cycle`]: records a per-attempt
    /// failure without ending the cycle (`spec.md` §4.1 step 3 / §4.2 step 7
    /// "`fetchFailureCount` is bumped by the controller's `onError`").
    pub fn record_fetch_failure(&self, count: u32, err: &E) {
        let mut state = self.state.write();
        state.fetch_failure_count = count;
        state.fetch_failure_reason = Some(err.clone());
        drop(state);
        self.notify();
    }

    /// Ends a manually-driven fetch cycle opened with
    /// [`Query::begin_fetch_cycle`] without changing status/data/error —
    /// used after a successful sequence of [`Query::set_data`] calls.
    pub fn end_fetch_cycle_idle(&self) {
        let mut state = self.state.write();
        state.fetch_status = FetchStatus::Idle;
        drop(state);
        self.notify();
    }

    /// Ends a manually-driven fetch cycle in error, keeping whatever `data`
    /// is already present (`spec.md` §4.6 refetch law: "remaining pages are
    /// not refetched... `data` retains the partially refreshed pages").
    pub fn set_error(&self, err: E) {
        let mut state = self.state.write();
        state.error = Some(err.clone());
        state.error_update_count += 1;
        state.error_updated_at = Some(self.clock.now());
        state.status = Status::Error;
        state.fetch_status = FetchStatus::Idle;
        drop(state);
        self.notify();
    }

    /// `spec.md` §4.2 `invalidate`.
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        if state.is_invalidated {
            return;
        }
        state.is_invalidated = true;
        drop(state);
        self.notify();
    }

    /// `spec.md` §4.2 `reset`: forgets data/error, returns to pending,
    /// keeps the seed if one was provided.
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = match &self.seed {
            Some((data, at)) => QueryState::with_initial_data(data.clone(), *at),
            None => QueryState::idle(),
        };
        drop(state);
        self.notify();
    }

    /// `spec.md` §4.2 `cancel`. Fetch status transitions to idle promptly
    /// regardless of `silent`; `silent` only governs whether the
    /// [`FetchFuture`] returned by the cancelled [`Query::fetch`] call
    /// resolves at all.
    pub fn cancel(&self, revert: bool, silent: bool) {
        *self.pending_cancel.lock() = Some(CancelRequest { revert, silent });
        if let Some(handle) = self.retry_handle.lock().as_ref() {
            handle.cancel(None);
        }
    }

    /// `spec.md` §4.2 "Fetch cycle" / §8 property 6 (dedup). Also serves as
    /// `fetchOptimistic` for `QueryClient::fetch_query`/`prefetch_query`,
    /// which bypass observer listener semantics but share this same dedup
    /// and retry machinery.
    #[instrument(skip(self, fetcher, policy, call_meta), fields(key = ?self.key))]
    pub fn fetch(self: &Arc<Self>, fetcher: Fetcher<T, E>, policy: RetryPolicy<E>, call_meta: Option<Value>) -> FetchFuture<T, E> {
        {
            let guard = self.in_flight.lock();
            if self.state.read().fetch_status == FetchStatus::Fetching {
                if let Some(existing) = guard.as_ref() {
                    debug!("fetch already in flight, returning existing future");
                    return existing.clone();
                }
            }
        }
        self.start_cycle(fetcher, policy, call_meta)
    }

    /// Replays the most recently used fetcher/policy. Used by
    /// `QueryClient::refetch_queries`, which operates on type-erased
    /// [`crate::query::cache::ErasedQuery`] handles and so cannot supply a
    /// fresh typed fetcher itself. `None` if this query has never fetched.
    pub fn refetch(self: &Arc<Self>) -> Option<FetchFuture<T, E>> {
        let fetcher = self.last_fetcher.lock().clone()?;
        let policy = self
            .last_policy
            .lock()
            .clone()
            .unwrap_or_else(crate::retry::default_retry_policy);
        Some(self.fetch(fetcher, policy, None))
    }

    fn start_cycle(self: &Arc<Self>, fetcher: Fetcher<T, E>, policy: RetryPolicy<E>, call_meta: Option<Value>) -> FetchFuture<T, E> {
        *self.last_fetcher.lock() = Some(fetcher.clone());
        *self.last_policy.lock() = Some(policy.clone());
        *self.snapshot.lock() = Some(self.state.read().clone());

        let fetch_meta = call_meta.or_else(|| self.aggregated_meta());
        {
            let mut state = self.state.write();
            state.fetch_status = FetchStatus::Fetching;
            state.fetch_failure_count = 0;
            state.fetch_failure_reason = None;
            state.fetch_meta = fetch_meta.clone();
        }
        self.notify();

        let cycle_id = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = RetryHandle::new();
        *self.retry_handle.lock() = Some(handle.clone());
        *self.pending_cancel.lock() = None;

        let this = Arc::clone(self);
        let clock = self.clock.clone();
        let key = self.key.clone();
        let handle_for_closure = handle.clone();

        let run_fut: BoxFuture<'static, Result<T, EngineError<E>>> = Box::pin(async move {
            let attempt = {
                let fetcher = fetcher.clone();
                let key = key.clone();
                let meta = fetch_meta.clone();
                let handle = handle_for_closure.clone();
                move || {
                    let ctx = QueryFnContext {
                        key: key.clone(),
                        meta: meta.clone(),
                        signal: crate::query::context::CancelSignal(handle.clone()),
                    };
                    fetcher(ctx)
                }
            };

            let hooks = RetryHooks {
                on_error: Some(Arc::new({
                    let this = this.clone();
                    move |count: u32, err: &E| {
                        {
                            let mut state = this.state.write();
                            state.fetch_failure_count = count;
                            state.fetch_failure_reason = Some(err.clone());
                        }
                        this.notify();
                    }
                })),
                ..RetryHooks::default()
            };

            let can_run: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| true);
            let outcome = crate::retry::run(attempt, policy, hooks, can_run, clock, handle).await;
            this.complete_cycle(cycle_id, outcome).await
        });

        let shared = run_fut.shared();
        *self.in_flight.lock() = Some(shared.clone());

        tokio::spawn({
            let shared = shared.clone();
            async move {
                let _ = shared.await;
            }
        });

        shared
    }

    async fn complete_cycle(self: Arc<Self>, cycle_id: u64, outcome: Result<T, EngineError<E>>) -> Result<T, EngineError<E>> {
        if self.cycle.load(Ordering::SeqCst) != cycle_id {
            // A newer cycle has since started; this result must not
            // overwrite state it no longer represents (`spec.md` §5
            // "Ordering guarantees").
            warn!(key = ?self.key, "discarding stale fetch cycle result");
            return outcome;
        }

        *self.retry_handle.lock() = None;
        *self.in_flight.lock() = None;

        match outcome {
            Ok(value) => {
                {
                    let mut state = self.state.write();
                    state.data = Some(value.clone());
                    state.data_update_count += 1;
                    state.data_updated_at = Some(self.clock.now());
                    state.error = None;
                    state.is_invalidated = false;
                    state.status = Status::Success;
                    state.fetch_status = FetchStatus::Idle;
                    state.fetch_failure_count = 0;
                    state.fetch_failure_reason = None;
                }
                self.notify();
                Ok(value)
            }
            Err(EngineError::Aborted) => {
                let request = self.pending_cancel.lock().take().unwrap_or(CancelRequest {
                    revert: false,
                    silent: false,
                });
                if request.revert {
                    if let Some(snapshot) = self.snapshot.lock().take() {
                        *self.state.write() = snapshot;
                    } else {
                        self.state.write().fetch_status = FetchStatus::Idle;
                    }
                } else {
                    self.state.write().fetch_status = FetchStatus::Idle;
                }
                self.notify();
                if request.silent {
                    std::future::pending::<Result<T, EngineError<E>>>().await
                } else {
                    Err(EngineError::Aborted)
                }
            }
            Err(EngineError::Source(err)) => {
                {
                    let mut state = self.state.write();
                    state.error = Some(err.clone());
                    state.error_update_count += 1;
                    state.error_updated_at = Some(self.clock.now());
                    state.status = Status::Error;
                    state.fetch_status = FetchStatus::Idle;
                }
                self.notify();
                Err(EngineError::Source(err))
            }
        }
    }
}

impl<T, E> std::fmt::Debug for Query<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("key", &self.key).finish_non_exhaustive()
    }
}
