//! Mutation configuration (`spec.md` §6 "Options (mutation)").

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::query::cache::Filter;
use crate::query::options::GcTime;
use crate::retry::{no_retry_policy, RetryPolicy};
use crate::value::{Key, Value};

use super::context::MutationFnContext;

pub type MutationFn<T, V, E> = Arc<dyn Fn(V, MutationFnContext) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

pub type OnMutate<V, C, E> = Arc<dyn Fn(V, MutationFnContext) -> BoxFuture<'static, Result<C, E>> + Send + Sync>;

pub type OnSuccess<T, V, C> = Arc<dyn Fn(T, V, Option<C>) -> BoxFuture<'static, ()> + Send + Sync>;

pub type OnError<V, C, E> = Arc<dyn Fn(E, V, Option<C>) -> BoxFuture<'static, ()> + Send + Sync>;

pub type OnSettled<T, V, C, E> = Arc<dyn Fn(Option<T>, Option<E>, V, Option<C>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Parallels [`QueryOptions`](crate::query::options::QueryOptions) for the
/// write side. `retry` defaults to [`no_retry_policy`] — `spec.md` §6: "mutation
/// `retry` defaults to null, meaning no retry" — unlike queries, which retry
/// three times with backoff by default.
#[derive(Clone)]
pub struct MutationOptions<T, V, C, E> {
    pub mutation_key: Option<Key>,
    pub meta: Option<Value>,
    pub retry: RetryPolicy<E>,
    pub gc_time: GcTime,
    pub on_mutate: Option<OnMutate<V, C, E>>,
    pub on_success: Option<OnSuccess<T, V, C>>,
    pub on_error: Option<OnError<V, C, E>>,
    pub on_settled: Option<OnSettled<T, V, C, E>>,
    /// Query-key filters to invalidate once the mutation settles
    /// successfully — the idiomatic-Rust stand-in for reaching back into a
    /// `client` handle from inside the mutation function itself (see
    /// `mutation::context`).
    pub invalidates: Vec<Filter>,
}

impl<T, V, C, E> Default for MutationOptions<T, V, C, E> {
    fn default() -> Self {
        Self {
            mutation_key: None,
            meta: None,
            retry: no_retry_policy(),
            gc_time: GcTime::default(),
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidates: Vec::new(),
        }
    }
}

impl<T, V, C, E> std::fmt::Debug for MutationOptions<T, V, C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("gc_time", &self.gc_time)
            .field("invalidates", &self.invalidates.len())
            .finish_non_exhaustive()
    }
}
