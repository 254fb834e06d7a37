//! Mutation engine: cache, per-invocation state machine, and observer
//! (`spec.md` §2 "Mutation engine").

pub mod cache;
pub mod context;
pub mod mutation;
pub mod observer;
pub mod options;
pub mod state;
