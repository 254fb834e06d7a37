//! Mutation fetcher-facing context (`spec.md` §6 "Fetcher context
//! (mutation)").
//!
//! `spec.md` §6 also has this context carry a `client` handle so a mutation
//! function can reach back into the query cache. We decompose that into a
//! first-class `invalidates` option on [`super::options::MutationOptions`]
//! instead (see `DESIGN.md`): idiomatic Rust code shouldn't thread an entire
//! façade through a plain data struct when the one thing callers actually do
//! with it — invalidate a set of queries after a successful write — already
//! has a dedicated, typed option.

use crate::value::{Key, Value};

#[derive(Clone)]
pub struct MutationFnContext {
    pub mutation_key: Option<Key>,
    pub meta: Option<Value>,
}
