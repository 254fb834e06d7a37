//! Type-erased query cache (`spec.md` §4.3).
//!
//! The cache is homogeneous in the sense `spec.md` describes — `Map<Key,
//! Query>` — even though each `Query<T, E>` is a distinct Rust
//! monomorphization per caller-chosen `T`/`E`. We erase that difference with
//! a type-safe in-memory double index: each entry keeps an
//! `Arc<dyn Any + Send + Sync>` for typed lookups (`Arc::downcast`)
//! alongside an `Arc<dyn ErasedQuery>` for the bulk, type-agnostic filter
//! operations the client's `invalidateQueries`/`refetchQueries`/etc. need.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;

use crate::clock::Clock;
use crate::query::options::GcTime;
use crate::query::query::Query;
use crate::query::state::{FetchStatus, Status};
use crate::value::Key;

/// Type-agnostic view of a [`Query`], used for filter-based bulk operations
/// that don't know the query's `T`/`E` (`spec.md` §9 "Polymorphism").
pub trait ErasedQuery: Send + Sync {
    fn key(&self) -> &Key;
    fn observer_count(&self) -> usize;
    fn is_invalidated(&self) -> bool;
    /// `spec.md` §4.7: at least one observer with `enabled = true`.
    fn is_active(&self) -> bool;
    /// `spec.md` §4.7: has observers and all of them opted into `static`.
    fn is_static(&self) -> bool;
    fn status(&self) -> Status;
    fn fetch_status(&self) -> FetchStatus;
    fn invalidate(&self);
    fn cancel(&self, revert: bool, silent: bool);
    fn wait_until_idle<'a>(&'a self) -> BoxFuture<'a, ()>;
    fn refetch(self: Arc<Self>) -> BoxFuture<'static, ()>;
    fn reset(&self);
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<T, E> ErasedQuery for Query<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &Key {
        Query::key(self)
    }

    fn observer_count(&self) -> usize {
        Query::observer_count(self)
    }

    fn is_invalidated(&self) -> bool {
        Query::is_invalidated(self)
    }

    fn is_active(&self) -> bool {
        Query::is_active(self)
    }

    fn is_static(&self) -> bool {
        Query::is_static(self)
    }

    fn status(&self) -> Status {
        self.state().status
    }

    fn fetch_status(&self) -> FetchStatus {
        self.state().fetch_status
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn cancel(&self, revert: bool, silent: bool) {
        Query::cancel(self, revert, silent)
    }

    fn wait_until_idle<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Query::wait_until_idle(self))
    }

    fn refetch(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Some(fut) = Query::refetch(&self) {
                let _ = fut.await;
            }
        })
    }

    fn reset(&self) {
        Query::reset(self)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Matches `spec.md` §4.3 "Filter semantics".
#[derive(Clone, Default)]
pub struct Filter {
    pub query_key: Option<Key>,
    pub exact: bool,
    pub predicate: Option<Arc<dyn Fn(&Key, &dyn ErasedQuery) -> bool + Send + Sync>>,
}

impl Filter {
    pub fn by_key(key: impl Into<Key>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    pub fn predicate(mut self, pred: impl Fn(&Key, &dyn ErasedQuery) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(pred));
        self
    }

    pub fn matches(&self, key: &Key, query: &dyn ErasedQuery) -> bool {
        if let Some(query_key) = &self.query_key {
            let key_matches = if self.exact {
                key == query_key
            } else {
                key.starts_with(query_key)
            };
            if !key_matches {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(key, query) {
                return false;
            }
        }
        true
    }
}

/// `spec.md` §4.3 "Events: {Added, Removed, Updated}".
#[derive(Clone)]
pub enum CacheEvent {
    Added(Key),
    Removed(Key),
    Updated(Key),
}

struct CacheEntry {
    erased: Arc<dyn ErasedQuery>,
    any: Arc<dyn Any + Send + Sync>,
}

struct CacheInner {
    queries: RwLock<HashMap<Key, CacheEntry>>,
    listeners: RwLock<Vec<(u64, Arc<dyn Fn(&CacheEvent) + Send + Sync>)>>,
    next_listener_id: AtomicU64,
}

/// `Map<Key, Query>` plus an event bus (`spec.md` §4.3). Cheap to clone —
/// every clone shares the same underlying map.
#[derive(Clone)]
pub struct QueryCache(Arc<CacheInner>);

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self(Arc::new(CacheInner {
            queries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }))
    }

    fn downgrade(&self) -> Weak<CacheInner> {
        Arc::downgrade(&self.0)
    }

    fn emit(&self, event: CacheEvent) {
        let listeners: Vec<Arc<dyn Fn(&CacheEvent) + Send + Sync>> =
            self.0.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&event);
        }
    }

    /// `subscribe(listener): unsubscribe`. Listeners run synchronously, in
    /// subscription order, during the emitting call (`spec.md` §5 "Cache
    /// event subscribers are invoked synchronously in subscription order").
    pub fn subscribe(&self, listener: impl Fn(&CacheEvent) + Send + Sync + 'static) -> impl FnOnce() + '_ {
        let id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.write().push((id, Arc::new(listener)));
        let inner = self.0.clone();
        move || {
            inner.listeners.write().retain(|(lid, _)| *lid != id);
        }
    }

    /// `build(options)`: idempotent create. Returns the existing query if
    /// present (panicking on a `T`/`E` mismatch for the same key — a
    /// programmer error per `spec.md` §7 category 3), otherwise constructs
    /// one, wires its GC callback back into this cache, and emits `Added`.
    pub fn build<T, E>(
        &self,
        key: &Key,
        clock: Arc<dyn Clock>,
        default_gc_time: GcTime,
        seed: Option<(T, Instant)>,
    ) -> Arc<Query<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(entry) = self.0.queries.read().get(key) {
            return entry
                .any
                .clone()
                .downcast::<Query<T, E>>()
                .unwrap_or_else(|_| panic!("query type mismatch for key {key:?}"));
        }

        let weak_cache = self.downgrade();
        let gc_key = key.clone();
        let on_gc: Arc<dyn Fn(&Key) + Send + Sync> = Arc::new(move |k: &Key| {
            if let Some(inner) = weak_cache.upgrade() {
                let removed = inner.queries.write().remove(k).is_some();
                if removed {
                    QueryCache(inner).emit(CacheEvent::Removed(gc_key.clone()));
                }
            }
        });

        let query = Arc::new(Query::new(key.clone(), clock, default_gc_time, seed, on_gc));

        let weak_cache = self.downgrade();
        let updated_key = key.clone();
        query.subscribe_raw(Arc::new(move || {
            if let Some(inner) = weak_cache.upgrade() {
                QueryCache(inner).emit(CacheEvent::Updated(updated_key.clone()));
            }
        }));

        let mut queries = self.0.queries.write();
        let entry = queries.entry(key.clone()).or_insert_with(|| CacheEntry {
            erased: query.clone() as Arc<dyn ErasedQuery>,
            any: query.clone() as Arc<dyn Any + Send + Sync>,
        });
        let result = entry
            .any
            .clone()
            .downcast::<Query<T, E>>()
            .unwrap_or_else(|_| panic!("query type mismatch for key {key:?}"));
        drop(queries);
        debug!(?key, "query built");
        self.emit(CacheEvent::Added(key.clone()));
        result
    }

    pub fn get(&self, key: &Key) -> Option<Arc<dyn ErasedQuery>> {
        self.0.queries.read().get(key).map(|e| e.erased.clone())
    }

    /// Typed lookup that does NOT create a query if absent — unlike
    /// [`QueryCache::build`], used by read-only accessors like
    /// `QueryClient::get_query_data`.
    pub fn get_typed<T, E>(&self, key: &Key) -> Option<Arc<Query<T, E>>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.0.queries.read().get(key).and_then(|entry| entry.any.clone().downcast::<Query<T, E>>().ok())
    }

    pub fn get_all(&self) -> Vec<Arc<dyn ErasedQuery>> {
        self.0.queries.read().values().map(|e| e.erased.clone()).collect()
    }

    /// `removeByKey`: unconditional removal, a no-op if absent.
    pub fn remove_by_key(&self, key: &Key) {
        let removed = self.0.queries.write().remove(key).is_some();
        if removed {
            self.emit(CacheEvent::Removed(key.clone()));
        }
    }

    /// `clear()`: emits a `Removed` per prior entry.
    pub fn clear(&self) {
        let drained: Vec<Key> = self.0.queries.write().drain().map(|(k, _)| k).collect();
        for key in drained {
            self.emit(CacheEvent::Removed(key));
        }
    }

    pub fn find(&self, filter: &Filter) -> Option<Arc<dyn ErasedQuery>> {
        self.find_all(filter).into_iter().next()
    }

    pub fn find_all(&self, filter: &Filter) -> Vec<Arc<dyn ErasedQuery>> {
        self.0
            .queries
            .read()
            .iter()
            .filter(|(key, entry)| filter.matches(key, entry.erased.as_ref()))
            .map(|(_, entry)| entry.erased.clone())
            .collect()
    }
}
