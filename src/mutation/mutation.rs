//! Mutation state machine (`spec.md` §4.8).
//!
//! Unlike [`Query`](crate::query::query::Query), a `Mutation` is a one-shot
//! write: [`Mutation::execute`] drives exactly one `onMutate -> mutationFn ->
//! onSuccess|onError -> onSettled` cycle. The [`super::cache::MutationCache`]
//! holds many `Mutation`s per key (`spec.md` §4.9: mutation keys aren't
//! unique), each built fresh by a `MutationObserver::mutate` call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{instrument, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::ids::MutationId;
use crate::query::cache::QueryCache;
use crate::query::options::GcTime;
use crate::retry::{RetryHandle, RetryHooks};
use crate::value::Key;

use super::context::MutationFnContext;
use super::options::{MutationFn, MutationOptions};
use super::state::{MutationState, MutationStatus};

struct MutationInner<T, V, C, E> {
    id: MutationId,
    mutation_key: Option<Key>,
    clock: Arc<dyn Clock>,
    state: RwLock<MutationState<T, V, C, E>>,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_listener_id: AtomicU64,
    changed: Notify,
    observer_count: AtomicU64,
    gc_time: GcTime,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_gc: Arc<dyn Fn(MutationId) + Send + Sync>,
    cycle: AtomicU64,
}

/// A single mutation execution (`spec.md` §3.5/§4.8). Cheap to clone — all
/// clones share one state machine.
pub struct Mutation<T, V, C, E>(Arc<MutationInner<T, V, C, E>>);

impl<T, V, C, E> Clone for Mutation<T, V, C, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, V, C, E> Mutation<T, V, C, E>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, mutation_key: Option<Key>, gc_time: GcTime, on_gc: Arc<dyn Fn(MutationId) + Send + Sync>) -> Self {
        Self(Arc::new(MutationInner {
            id: MutationId::new(),
            mutation_key,
            clock,
            state: RwLock::new(MutationState::idle()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            changed: Notify::new(),
            observer_count: AtomicU64::new(0),
            gc_time,
            gc_task: Mutex::new(None),
            on_gc,
            cycle: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> MutationId {
        self.0.id
    }

    pub fn mutation_key(&self) -> Option<&Key> {
        self.0.mutation_key.as_ref()
    }

    pub fn state(&self) -> MutationState<T, V, C, E> {
        self.0.state.read().clone()
    }

    fn notify(&self) {
        let listeners: Vec<Arc<dyn Fn() + Send + Sync>> = self.0.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener();
        }
        self.0.changed.notify_waiters();
    }

    pub fn subscribe_raw(&self, listener: Arc<dyn Fn() + Send + Sync>) -> u64 {
        self.cancel_gc();
        self.0.observer_count.fetch_add(1, Ordering::SeqCst);
        let id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe_raw(&self, id: u64) {
        self.0.listeners.write().retain(|(lid, _)| *lid != id);
        if self.0.observer_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.schedule_gc();
        }
    }

    pub async fn wait_until_settled(&self) {
        loop {
            if !self.state().is_pending() {
                return;
            }
            let notified = self.0.changed.notified();
            if !self.state().is_pending() {
                return;
            }
            notified.await;
        }
    }

    fn cancel_gc(&self) {
        if let Some(task) = self.0.gc_task.lock().take() {
            task.abort();
        }
    }

    /// Pending mutations are never collected (`spec.md` §4.9a); scheduling is
    /// a no-op while `is_pending()`, and `execute` re-schedules on
    /// completion if still observerless.
    fn schedule_gc(&self) {
        self.cancel_gc();
        if self.state().is_pending() {
            return;
        }
        let Some(duration) = self.0.gc_time.as_duration() else {
            return;
        };
        let weak: Weak<MutationInner<T, V, C, E>> = Arc::downgrade(&self.0);
        let clock = self.0.clock.clone();
        let task = tokio::spawn(async move {
            clock.sleep(duration).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.observer_count.load(Ordering::SeqCst) == 0 && !inner.state.read().is_pending() {
                (inner.on_gc)(inner.id);
            }
        });
        *self.0.gc_task.lock() = Some(task);
    }

    fn ctx(&self, meta: Option<crate::value::Value>) -> MutationFnContext {
        MutationFnContext {
            mutation_key: self.0.mutation_key.clone(),
            meta,
        }
    }

    /// Drives the full `onMutate -> mutationFn -> onSuccess|onError ->
    /// onSettled` cycle (`spec.md` §4.8 steps 1-5). A later `execute` call on
    /// the same `Mutation` (unusual but not forbidden) bumps an internal
    /// cycle tag so a slow, stale completion cannot clobber a newer one.
    #[instrument(skip_all)]
    pub async fn execute(&self, variables: V, mutation_fn: MutationFn<T, V, E>, options: MutationOptions<T, V, C, E>, cache: &QueryCache) -> Result<T, EngineError<E>> {
        let cycle_id = self.0.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(mutation_id = ?self.0.id, "mutation execute started");

        {
            let mut state = self.0.state.write();
            state.status = MutationStatus::Pending;
            state.variables = Some(variables.clone());
            state.submitted_at = Some(self.0.clock.now());
            state.on_mutate_result = None;
            state.data = None;
            state.error = None;
            state.failure_count = 0;
            state.failure_reason = None;
        }
        self.notify();

        let ctx = self.ctx(options.meta.clone());

        let on_mutate_result = if let Some(on_mutate) = &options.on_mutate {
            match on_mutate(variables.clone(), ctx.clone()).await {
                Ok(value) => {
                    self.0.state.write().on_mutate_result = Some(value.clone());
                    self.notify();
                    Some(value)
                }
                Err(err) => {
                    self.finalize_error(cycle_id, err.clone(), variables, None, &options, cache).await;
                    return Err(EngineError::Source(err));
                }
            }
        } else {
            None
        };

        let handle: RetryHandle<E> = RetryHandle::default();
        let failure_mutation = self.clone();
        let hooks = RetryHooks {
            on_error: Some(Arc::new(move |count, err: &E| {
                let mut state = failure_mutation.0.state.write();
                state.failure_count = count;
                state.failure_reason = Some(err.clone());
                drop(state);
                failure_mutation.notify();
            })),
            ..Default::default()
        };

        let fn_variables = variables.clone();
        let fn_ctx = ctx.clone();
        let outcome = crate::retry::run(
            move || mutation_fn(fn_variables.clone(), fn_ctx.clone()),
            options.retry.clone(),
            hooks,
            Arc::new(|| true),
            self.0.clock.clone(),
            handle,
        )
        .await;

        match outcome {
            Ok(data) => {
                self.finalize_success(cycle_id, data.clone(), variables, on_mutate_result, &options, cache).await;
                Ok(data)
            }
            Err(EngineError::Source(err)) => {
                self.finalize_error(cycle_id, err.clone(), variables, on_mutate_result, &options, cache).await;
                Err(EngineError::Source(err))
            }
            Err(EngineError::Aborted) => {
                warn!("mutation aborted without a source error");
                Err(EngineError::Aborted)
            }
        }
    }

    async fn finalize_success(&self, cycle_id: u64, data: T, variables: V, on_mutate_result: Option<C>, options: &MutationOptions<T, V, C, E>, cache: &QueryCache) {
        if self.0.cycle.load(Ordering::SeqCst) != cycle_id {
            return;
        }
        {
            let mut state = self.0.state.write();
            state.status = MutationStatus::Success;
            state.data = Some(data.clone());
            state.error = None;
        }
        self.notify();

        if let Some(on_success) = &options.on_success {
            on_success(data.clone(), variables.clone(), on_mutate_result.clone()).await;
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(Some(data), None, variables, on_mutate_result).await;
        }
        for filter in &options.invalidates {
            for query in cache.find_all(filter) {
                query.invalidate();
            }
        }
        if self.0.observer_count.load(Ordering::SeqCst) == 0 {
            self.schedule_gc();
        }
    }

    async fn finalize_error(&self, cycle_id: u64, err: E, variables: V, on_mutate_result: Option<C>, options: &MutationOptions<T, V, C, E>, cache: &QueryCache) {
        if self.0.cycle.load(Ordering::SeqCst) != cycle_id {
            return;
        }
        {
            let mut state = self.0.state.write();
            state.status = MutationStatus::Error;
            state.error = Some(err.clone());
        }
        self.notify();

        if let Some(on_error) = &options.on_error {
            on_error(err.clone(), variables.clone(), on_mutate_result.clone()).await;
        }
        if let Some(on_settled) = &options.on_settled {
            on_settled(None, Some(err), variables, on_mutate_result).await;
        }
        let _ = cache;
        if self.0.observer_count.load(Ordering::SeqCst) == 0 {
            self.schedule_gc();
        }
    }
}

impl<T, V, C, E> std::fmt::Debug for Mutation<T, V, C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation").field("id", &self.0.id).field("mutation_key", &self.0.mutation_key).finish_non_exhaustive()
    }
}
