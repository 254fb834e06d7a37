//! Mutation observer (`spec.md` §4.10).
//!
//! Unlike [`crate::query::observer::QueryObserver`], which binds
//! permanently to one [`crate::query::query::Query`], a `MutationObserver`
//! rebinds to a **fresh** [`Mutation`] on every [`MutationObserver::mutate`]
//! call (`spec.md` §3.6 "a mutation may have zero observers", §4.10 "Holds
//! ... a reference to a freshly created mutation per `mutate(variables)`
//! call"). A late-arriving result from a superseded call must not overwrite
//! a newer one — enforced the same way [`Mutation::execute`] guards itself
//! internally (a monotonic cycle tag), plus here by only ever projecting
//! `result` from whichever `Mutation` is currently bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::ids::MutationId;
use crate::query::cache::QueryCache;
use crate::value::{deep_merge, Key, Value};

use super::cache::MutationCache;
use super::mutation::Mutation;
use super::options::{MutationFn, MutationOptions};
use super::state::{MutationState, MutationStatus};

/// Derived, consumer-facing projection of a mutation's state (`spec.md`
/// §4.10 "Holds ... result").
#[derive(Clone)]
pub struct MutationObserverResult<T, V, C, E> {
    pub status: MutationStatus,
    pub data: Option<T>,
    pub variables: Option<V>,
    pub error: Option<E>,
    pub on_mutate_result: Option<C>,
    pub failure_count: u32,
    pub failure_reason: Option<E>,
    pub is_idle: bool,
    pub is_pending: bool,
    pub is_success: bool,
    pub is_error: bool,
}

fn project<T: Clone, V: Clone, C: Clone, E: Clone>(state: &MutationState<T, V, C, E>) -> MutationObserverResult<T, V, C, E> {
    MutationObserverResult {
        status: state.status,
        data: state.data.clone(),
        variables: state.variables.clone(),
        error: state.error.clone(),
        on_mutate_result: state.on_mutate_result.clone(),
        failure_count: state.failure_count,
        failure_reason: state.failure_reason.clone(),
        is_idle: state.is_idle(),
        is_pending: state.is_pending(),
        is_success: state.is_success(),
        is_error: state.is_error(),
    }
}

struct Binding<T, V, C, E> {
    mutation: Mutation<T, V, C, E>,
    listener_id: u64,
}

struct ObserverInner<T, V, C, E> {
    clock: Arc<dyn Clock>,
    cache: MutationCache,
    query_cache: QueryCache,
    options: RwLock<MutationOptions<T, V, C, E>>,
    mutation_fn: RwLock<MutationFn<T, V, E>>,
    binding: RwLock<Option<Binding<T, V, C, E>>>,
    result: RwLock<MutationObserverResult<T, V, C, E>>,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn(&MutationObserverResult<T, V, C, E>) + Send + Sync>)>>,
    next_listener_id: AtomicU64,
}

/// `spec.md` §4.10. Cheap to clone — all clones share one binding.
pub struct MutationObserver<T, V, C, E>(Arc<ObserverInner<T, V, C, E>>);

impl<T, V, C, E> Clone for MutationObserver<T, V, C, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, V, C, E> MutationObserver<T, V, C, E>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        clock: Arc<dyn Clock>,
        cache: MutationCache,
        query_cache: QueryCache,
        mutation_fn: MutationFn<T, V, E>,
        options: MutationOptions<T, V, C, E>,
    ) -> Self {
        Self(Arc::new(ObserverInner {
            clock,
            cache,
            query_cache,
            options: RwLock::new(options),
            mutation_fn: RwLock::new(mutation_fn),
            binding: RwLock::new(None),
            result: RwLock::new(project(&MutationState::idle())),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }))
    }

    pub fn result(&self) -> MutationObserverResult<T, V, C, E> {
        self.0.result.read().clone()
    }

    /// `subscribe(listener): unsubscribe`. Not called synchronously on
    /// subscription (`spec.md` §5, same rule as the query observer).
    pub fn subscribe(&self, listener: impl Fn(&MutationObserverResult<T, V, C, E>) + Send + Sync + 'static) -> impl FnOnce() {
        let id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().push((id, Arc::new(listener)));
        let inner = self.0.clone();
        move || {
            inner.listeners.write().retain(|(lid, _)| *lid != id);
        }
    }

    fn publish(&self, result: MutationObserverResult<T, V, C, E>) {
        *self.0.result.write() = result.clone();
        let listeners: Vec<_> = self.0.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&result);
        }
    }

    fn detach_current(&self) {
        if let Some(binding) = self.0.binding.write().take() {
            binding.mutation.unsubscribe_raw(binding.listener_id);
        }
    }

    /// Observer-contributed `meta`, aggregated with the client default and
    /// per-call meta (`spec.md` §4.8 step 3: "deep-merge of client default
    /// meta, observers' meta ..., and the call-site meta").
    fn aggregated_meta(&self, call_meta: Option<&Value>) -> Option<Value> {
        let mut merged = self.0.options.read().meta.clone();
        if let Some(call_meta) = call_meta {
            merged = Some(match merged {
                Some(base) => deep_merge(&base, call_meta),
                None => call_meta.clone(),
            });
        }
        merged
    }

    /// `mutate(variables)`: fires and forgets, projecting state through this
    /// observer's listeners as it transitions. Returns a future the caller
    /// may await for the final `Result`, mirroring `mutateAsync`.
    pub fn mutate(&self, variables: V) -> impl std::future::Future<Output = Result<T, EngineError<E>>> + Send + 'static
    where
        T: 'static,
        V: 'static,
        C: 'static,
        E: 'static,
    {
        self.detach_current();

        let key = self.0.options.read().mutation_key.clone();
        let gc_time = self.0.options.read().gc_time;
        let mutation = self.0.cache.build::<T, V, C, E>(self.0.clock.clone(), key, gc_time);

        let this = self.clone();
        let listener_id = mutation.subscribe_raw(Arc::new({
            let this = this.clone();
            let mutation = mutation.clone();
            move || {
                this.publish(project(&mutation.state()));
            }
        }));
        *self.0.binding.write() = Some(Binding {
            mutation: mutation.clone(),
            listener_id,
        });
        self.publish(project(&mutation.state()));

        let mutation_fn = self.0.mutation_fn.read().clone();
        let options = self.0.options.read().clone();
        let query_cache = self.0.query_cache.clone();

        async move {
            let call_meta = options.meta.clone();
            let mut resolved_options = options;
            resolved_options.meta = this.aggregated_meta(call_meta.as_ref());
            mutation.execute(variables, mutation_fn, resolved_options, &query_cache).await
        }
    }

    /// Awaitable variant with the same semantics as [`MutationObserver::mutate`]
    /// (`spec.md` §4.10 "`mutateAsync` is the awaitable variant" — in this
    /// Rust rendition both forms are futures; this one is provided for
    /// parity with call sites that want the explicit name).
    pub async fn mutate_async(&self, variables: V) -> Result<T, EngineError<E>>
    where
        T: 'static,
        V: 'static,
        C: 'static,
        E: 'static,
    {
        self.mutate(variables).await
    }

    /// `reset()`: detaches from the current mutation (decrementing its
    /// observer count) and returns projected `result` to idle. A no-op if
    /// never mutated or already detached (`spec.md` §7 category 3).
    pub fn reset(&self) {
        self.detach_current();
        self.publish(project(&MutationState::idle()));
    }

    /// Reassigns options; client-default-backed fields (e.g. `gcTime`)
    /// re-resolve on the next `mutate` call (`spec.md` §4.10).
    pub fn update_options(&self, options: MutationOptions<T, V, C, E>) {
        *self.0.options.write() = options;
    }

    pub fn set_mutation_fn(&self, mutation_fn: MutationFn<T, V, E>) {
        *self.0.mutation_fn.write() = mutation_fn;
    }

    pub fn current_mutation_id(&self) -> Option<MutationId> {
        self.0.binding.read().as_ref().map(|b| b.mutation.id())
    }
}

impl<T, V, C, E> Drop for ObserverInner<T, V, C, E> {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.write().take() {
            binding.mutation.unsubscribe_raw(binding.listener_id);
        }
    }
}
