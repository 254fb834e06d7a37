//! # query-engine
//!
//! An asynchronous data-fetching and caching engine: the query and mutation
//! state machines, retry controller, observer layer, and client façade
//! behind libraries like `@tanstack/query`, as plain generic Rust types with
//! no UI framework dependency.
//!
//! - Request deduplication: concurrent `fetch`es for the same key share one
//!   in-flight future ([`query::query::Query::fetch`]).
//! - Freshness tracking and background revalidation
//!   ([`query::observer::QueryObserver`]).
//! - Retries with backoff and cooperative cancellation ([`retry`]).
//! - Pagination of "infinite" lists ([`query::infinite`]).
//! - Optimistic, retryable mutations with lifecycle callbacks
//!   ([`mutation`]).
//! - Lifecycle-scoped garbage collection for both queries and mutations.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use query_engine::query::client::QueryClient;
//! use query_engine::query::query::Fetcher;
//! use query_engine::query::context::QueryFnContext;
//! use query_engine::key;
//!
//! # async fn run() {
//! let client = QueryClient::new();
//! let fetcher: Fetcher<i32, String> =
//!     Arc::new(|_ctx: QueryFnContext<String>| Box::pin(async move { Ok(42) }));
//! let result = client
//!     .fetch_query(key!["answer"], fetcher, client.default_query_options())
//!     .await;
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod ids;
pub mod mutation;
pub mod query;
pub mod retry;
pub mod value;

pub use error::EngineError;
pub use query::client::{QueryClient, QueryClientConfig};
pub use value::{Key, Value};
