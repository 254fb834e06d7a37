//! Query observer (`spec.md` §4.5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::clock::Clock;
use crate::ids::ObserverId;
use crate::query::cache::QueryCache;
use crate::query::options::{QueryOptions, RefetchPolicy, StaleTime};
use crate::query::query::{FetchFuture, Fetcher, Query};
use crate::query::state::{FetchStatus, QueryState, Status};
use crate::value::Key;

/// Derived, consumer-facing projection of a query's state (`spec.md` §4.5
/// "Result projection").
#[derive(Clone)]
pub struct QueryObserverResult<T, E> {
    pub status: Status,
    pub fetch_status: FetchStatus,
    pub data: Option<T>,
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
    pub is_refetching: bool,
    pub is_stale: bool,
    pub is_placeholder_data: bool,
    pub is_fetched_after_mount: bool,
}

fn compute_result<T: Clone, E: Clone>(
    state: &QueryState<T, E>,
    options: &QueryOptions<T, E>,
    is_stale: bool,
    is_fetched_after_mount: bool,
    placeholder_active: bool,
) -> QueryObserverResult<T, E> {
    let show_placeholder = placeholder_active && state.data.is_none() && options.placeholder.is_some();
    let (data, status, is_placeholder_data) = if show_placeholder {
        (options.placeholder.clone(), Status::Success, true)
    } else {
        (state.data.clone(), state.status, false)
    };
    QueryObserverResult {
        status,
        fetch_status: state.fetch_status,
        data,
        error: state.error.clone(),
        data_updated_at: state.data_updated_at,
        error_updated_at: state.error_updated_at,
        data_update_count: state.data_update_count,
        error_update_count: state.error_update_count,
        failure_count: state.fetch_failure_count,
        failure_reason: state.fetch_failure_reason.clone(),
        is_invalidated: state.is_invalidated,
        is_pending: status == Status::Pending,
        is_success: status == Status::Success,
        is_error: status == Status::Error,
        is_fetching: state.fetch_status == FetchStatus::Fetching,
        is_refetching: state.fetch_status == FetchStatus::Fetching && state.data_update_count > 0,
        is_stale,
        is_placeholder_data,
        is_fetched_after_mount,
    }
}

struct ObserverInner<T, E> {
    id: ObserverId,
    clock: Arc<dyn Clock>,
    options: RwLock<QueryOptions<T, E>>,
    query: RwLock<Arc<Query<T, E>>>,
    fetcher: RwLock<Fetcher<T, E>>,
    result: RwLock<QueryObserverResult<T, E>>,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn(&QueryObserverResult<T, E>) + Send + Sync>)>>,
    next_listener_id: AtomicU64,
    query_listener_id: Mutex<Option<u64>>,
    fetched_after_mount: AtomicBool,
    last_seen_fetch_status: Mutex<FetchStatus>,
    interval_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    placeholder_active: AtomicBool,
}

/// Binds `options` + a fetcher to a query in `cache`, projecting its state
/// into a [`QueryObserverResult`] and driving mount/resume/interval
/// triggers (`spec.md` §4.5). Cheap to clone — all clones share one binding.
pub struct QueryObserver<T, E>(Arc<ObserverInner<T, E>>);

impl<T, E> Clone for QueryObserver<T, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, E> QueryObserver<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// `spec.md` §4.5 "Binding".
    pub fn new(cache: &QueryCache, clock: Arc<dyn Clock>, key: Key, fetcher: Fetcher<T, E>, options: QueryOptions<T, E>) -> Self {
        let id = ObserverId::new();
        let seed = options
            .seed
            .clone()
            .map(|data| (data, options.seed_updated_at.unwrap_or_else(|| clock.now())));
        let query = cache.build::<T, E>(&key, clock.clone(), options.gc_time, seed);
        query.add_observer(id, options.meta.clone(), options.gc_time, options.enabled, options.stale_time == StaleTime::Static);

        let placeholder_active = options.placeholder.is_some() && query.state().data.is_none();
        let initial_state = query.state();
        let is_stale = query.is_stale(options.stale_time);
        let initial_result = compute_result(&initial_state, &options, is_stale, false, placeholder_active);
        let initial_fetch_status = initial_state.fetch_status;

        let inner = Arc::new(ObserverInner {
            id,
            clock,
            options: RwLock::new(options),
            query: RwLock::new(query.clone()),
            fetcher: RwLock::new(fetcher),
            result: RwLock::new(initial_result),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            query_listener_id: Mutex::new(None),
            fetched_after_mount: AtomicBool::new(false),
            last_seen_fetch_status: Mutex::new(initial_fetch_status),
            interval_task: Mutex::new(None),
            placeholder_active: AtomicBool::new(placeholder_active),
        });

        let weak: Weak<ObserverInner<T, E>> = Arc::downgrade(&inner);
        let listener_id = query.subscribe_raw(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                QueryObserver(inner).on_query_update();
            }
        }));
        *inner.query_listener_id.lock() = Some(listener_id);

        let observer = Self(inner);
        observer.evaluate_mount_policy();
        observer.schedule_refetch_interval();
        observer
    }

    fn on_query_update(&self) {
        let query = self.0.query.read().clone();
        let state = query.state();

        if state.data.is_some() {
            self.0.placeholder_active.store(false, Ordering::SeqCst);
        }

        let mut became_terminal = false;
        {
            let mut last = self.0.last_seen_fetch_status.lock();
            if *last == FetchStatus::Fetching && state.fetch_status != FetchStatus::Fetching {
                became_terminal = true;
                self.0.fetched_after_mount.store(true, Ordering::SeqCst);
            }
            *last = state.fetch_status;
        }

        let options = self.0.options.read().clone();
        let is_stale = query.is_stale(options.stale_time);
        let result = compute_result(
            &state,
            &options,
            is_stale,
            self.0.fetched_after_mount.load(Ordering::SeqCst),
            self.0.placeholder_active.load(Ordering::SeqCst),
        );
        *self.0.result.write() = result.clone();

        let listeners: Vec<_> = self.0.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&result);
        }

        if became_terminal {
            self.schedule_refetch_interval();
        }
    }

    fn evaluate_mount_policy(&self) {
        let options = self.0.options.read().clone();
        if !options.enabled {
            return;
        }
        let query = self.0.query.read().clone();
        let last_was_error = query.state().status == Status::Error;
        let should_fetch = if last_was_error && options.retry_on_mount {
            true
        } else {
            match options.refetch_on_mount {
                RefetchPolicy::Always => true,
                RefetchPolicy::Never => false,
                RefetchPolicy::Stale => query.is_stale(options.stale_time),
            }
        };
        if should_fetch {
            trace!("mount policy triggered fetch");
            let _ = self.refetch();
        }
    }

    /// Re-evaluates the mount policy for `refetchOnResume` — called by a
    /// platform connectivity/focus adapter, which per `spec.md` §1 is an
    /// external collaborator outside this crate.
    pub fn on_resume(&self) {
        let options = self.0.options.read().clone();
        if !options.enabled {
            return;
        }
        let query = self.0.query.read().clone();
        let should_fetch = match options.refetch_on_resume {
            RefetchPolicy::Always => true,
            RefetchPolicy::Never => false,
            RefetchPolicy::Stale => query.is_stale(options.stale_time),
        };
        if should_fetch {
            let _ = self.refetch();
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
        let weak: Weak<ObserverInner<T, E>> = Arc::downgrade(&self.0);
        let clock = self.0.clock.clone();
        let task = tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let observer = QueryObserver(inner);
                if observer.0.options.read().enabled {
                    let _ = observer.refetch();
                }
            }
        });
        *self.0.interval_task.lock() = Some(task);
    }

    /// Manual refetch — bypasses `enabled` (`spec.md` §4.5 "Effective
    /// `enabled`": "manual `refetch`... still do[es]").
    pub fn refetch(&self) -> FetchFuture<T, E> {
        let fetcher = self.0.fetcher.read().clone();
        let options = self.0.options.read();
        let policy = options.retry.clone();
        let meta = options.meta.clone();
        drop(options);
        self.0.query.read().fetch(fetcher, policy, meta)
    }

    pub fn result(&self) -> QueryObserverResult<T, E> {
        self.0.result.read().clone()
    }

    /// `subscribe(listener): unsubscribe`. Not called synchronously on
    /// subscription (`spec.md` §5).
    pub fn subscribe(&self, listener: impl Fn(&QueryObserverResult<T, E>) + Send + Sync + 'static) -> impl FnOnce() {
        let id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().push((id, Arc::new(listener)));
        let inner = self.0.clone();
        move || {
            inner.listeners.write().retain(|(lid, _)| *lid != id);
        }
    }

    /// Reassigns options: resolves the new effective `enabled`/stale/gc
    /// settings, re-registers this observer's meta/gc contribution with the
    /// query, and re-evaluates the mount policy when `enabled` flips
    /// false→true (`spec.md` §4.5 "Effective `enabled`").
    pub fn update_options(&self, new_options: QueryOptions<T, E>) {
        let was_enabled = self.0.options.read().enabled;
        *self.0.options.write() = new_options.clone();
        self.0.query.read().update_observer(
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

    pub fn set_fetcher(&self, fetcher: Fetcher<T, E>) {
        *self.0.fetcher.write() = fetcher;
    }

    /// `dispose`/`onUnmount` (`spec.md` §4.5): cancels the interval, removes
    /// the observer from the query (scheduling GC as needed), drops all
    /// listeners.
    pub fn dispose(&self) {
        self.cancel_refetch_interval();
        let query = self.0.query.read().clone();
        if let Some(listener_id) = self.0.query_listener_id.lock().take() {
            query.unsubscribe_raw(listener_id);
        }
        query.remove_observer(self.0.id);
        self.0.listeners.write().clear();
    }
}
