//! Type-erased mutation cache (`spec.md` §4.9).
//!
//! Unlike [`QueryCache`](crate::query::cache::QueryCache), this is a bag, not
//! a map: mutation keys aren't required to be unique, so a cache-wide
//! `isMutating`/`getAll`/filter-based query needs every execution kept side
//! by side, keyed only by its own [`MutationId`]. Erasure follows the same
//! dual-`Arc` approach as the query cache, and it mirrors the same
//! `{Added, Removed, Updated}` event bus (`spec.md` §4.9 "Mirrors §4.3").

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::clock::Clock;
use crate::ids::MutationId;
use crate::query::options::GcTime;
use crate::value::Key;

use super::mutation::Mutation;
use super::state::MutationStatus;

/// Type-agnostic view of a [`Mutation`], for cache-wide filters (`spec.md`
/// §4.9 "Filter semantics (mutation)").
pub trait ErasedMutation: Send + Sync {
    fn id(&self) -> MutationId;
    fn mutation_key(&self) -> Option<&Key>;
    fn status(&self) -> MutationStatus;
    fn is_pending(&self) -> bool;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<T, V, C, E> ErasedMutation for Mutation<T, V, C, E>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn id(&self) -> MutationId {
        Mutation::id(self)
    }

    fn mutation_key(&self) -> Option<&Key> {
        Mutation::mutation_key(self)
    }

    fn status(&self) -> MutationStatus {
        self.state().status
    }

    fn is_pending(&self) -> bool {
        self.state().is_pending()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// `spec.md` §4.9 "Filter semantics (mutation)".
#[derive(Clone, Default)]
pub struct MutationFilter {
    pub mutation_key: Option<Key>,
    pub exact: bool,
    pub status: Option<MutationStatus>,
    pub predicate: Option<Arc<dyn Fn(&dyn ErasedMutation) -> bool + Send + Sync>>,
}

impl MutationFilter {
    pub fn by_key(key: impl Into<Key>) -> Self {
        Self {
            mutation_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    pub fn status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, mutation: &dyn ErasedMutation) -> bool {
        if let Some(filter_key) = &self.mutation_key {
            let Some(actual_key) = mutation.mutation_key() else {
                return false;
            };
            let key_matches = if self.exact { actual_key == filter_key } else { actual_key.starts_with(filter_key) };
            if !key_matches {
                return false;
            }
        }
        if let Some(status) = self.status {
            if mutation.status() != status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

/// `spec.md` §4.9 "Mirrors §4.3" — this cache emits the same
/// `{Added, Removed, Updated}` events as [`QueryCache`](crate::query::cache::QueryCache),
/// keyed by [`MutationId`] instead of [`Key`].
#[derive(Clone)]
pub enum MutationCacheEvent {
    Added(MutationId),
    Removed(MutationId),
    Updated(MutationId),
}

struct MutationCacheInner {
    entries: RwLock<HashMap<MutationId, Arc<dyn ErasedMutation>>>,
    typed: RwLock<HashMap<MutationId, Arc<dyn Any + Send + Sync>>>,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn(&MutationCacheEvent) + Send + Sync>)>>,
    next_listener_id: AtomicU64,
}

/// Bag of in-flight and recently-settled mutations (`spec.md` §4.9). Cheap to
/// clone — every clone shares the same underlying storage.
#[derive(Clone)]
pub struct MutationCache(Arc<MutationCacheInner>);

impl Default for MutationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationCache {
    pub fn new() -> Self {
        Self(Arc::new(MutationCacheInner {
            entries: RwLock::new(HashMap::new()),
            typed: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }))
    }

    fn emit(&self, event: MutationCacheEvent) {
        let listeners: Vec<Arc<dyn Fn(&MutationCacheEvent) + Send + Sync>> =
            self.0.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&event);
        }
    }

    /// `subscribe(listener): unsubscribe`, mirroring
    /// [`QueryCache::subscribe`](crate::query::cache::QueryCache::subscribe):
    /// listeners run synchronously, in subscription order, during the
    /// emitting call.
    pub fn subscribe(&self, listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static) -> impl FnOnce() + '_ {
        let id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().push((id, Arc::new(listener)));
        let inner = self.0.clone();
        move || {
            inner.listeners.write().retain(|(lid, _)| *lid != id);
        }
    }

    /// Builds and registers a fresh [`Mutation`], wiring its GC callback back
    /// into this cache so a settled, observerless mutation removes itself
    /// after `gcTime`, and emits `Added`.
    pub fn build<T, V, C, E>(&self, clock: Arc<dyn Clock>, mutation_key: Option<Key>, gc_time: GcTime) -> Mutation<T, V, C, E>
    where
        T: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let weak: Weak<MutationCacheInner> = Arc::downgrade(&self.0);
        let on_gc = Arc::new(move |id: MutationId| {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.entries.write().remove(&id).is_some();
                inner.typed.write().remove(&id);
                if removed {
                    MutationCache(inner).emit(MutationCacheEvent::Removed(id));
                }
            }
        });
        let mutation = Mutation::new(clock, mutation_key, gc_time, on_gc);
        let id = mutation.id();
        self.0.entries.write().insert(id, Arc::new(mutation.clone()) as Arc<dyn ErasedMutation>);
        self.0.typed.write().insert(id, Arc::new(mutation.clone()) as Arc<dyn Any + Send + Sync>);

        let weak = Arc::downgrade(&self.0);
        mutation.subscribe_raw(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                MutationCache(inner).emit(MutationCacheEvent::Updated(id));
            }
        }));

        debug!(?id, "mutation built");
        self.emit(MutationCacheEvent::Added(id));
        mutation
    }

    pub fn get(&self, id: MutationId) -> Option<Arc<dyn ErasedMutation>> {
        self.0.entries.read().get(&id).cloned()
    }

    pub fn get_typed<T, V, C, E>(&self, id: MutationId) -> Option<Mutation<T, V, C, E>>
    where
        T: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.0
            .typed
            .read()
            .get(&id)
            .and_then(|any| any.clone().downcast::<Mutation<T, V, C, E>>().ok())
            .map(|arc| (*arc).clone())
    }

    pub fn get_all(&self) -> Vec<Arc<dyn ErasedMutation>> {
        self.0.entries.read().values().cloned().collect()
    }

    pub fn find_all(&self, filter: &MutationFilter) -> Vec<Arc<dyn ErasedMutation>> {
        self.0.entries.read().values().filter(|m| filter.matches(m.as_ref())).cloned().collect()
    }

    pub fn is_mutating(&self) -> bool {
        self.0.entries.read().values().any(|m| m.is_pending())
    }

    /// Unconditional removal, ignoring in-flight state — used by
    /// `QueryClient::clear`. Settled mutations remove themselves via GC; this
    /// is for callers that want an immediate reset. Emits `Removed` if an
    /// entry was actually present.
    pub fn remove(&self, id: MutationId) {
        let removed = self.0.entries.write().remove(&id).is_some();
        self.0.typed.write().remove(&id);
        if removed {
            self.emit(MutationCacheEvent::Removed(id));
        }
    }

    /// Emits a `Removed` per prior entry, mirroring
    /// [`QueryCache::clear`](crate::query::cache::QueryCache::clear).
    pub fn clear(&self) {
        let drained: Vec<MutationId> = self.0.entries.write().drain().map(|(id, _)| id).collect();
        self.0.typed.write().clear();
        for id in drained {
            self.emit(MutationCacheEvent::Removed(id));
        }
    }
}
