//! Query engine: cache, per-key state machine, plain and infinite observers,
//! and the client façade (`spec.md` §2 "Query engine").

pub mod cache;
pub mod client;
pub mod context;
pub mod infinite;
pub mod observer;
pub mod options;
pub mod query;
pub mod state;
