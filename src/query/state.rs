//! Query state model (`spec.md` §3.2).

use std::time::Instant;

use crate::value::Value;

/// Data status: exactly one of pending/success/error at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No data has ever successfully resolved.
    Pending,
    Success,
    Error,
}

/// Fetch status: independent of [`Status`] — a query can be `Success` while
/// `Fetching` (a background refetch in flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    /// A retry delay is being held open by an offline/paused gate.
    Paused,
}

/// The full persisted state of a single [`super::query::Query`].
#[derive(Debug, Clone)]
pub struct QueryState<T, E> {
    pub status: Status,
    pub fetch_status: FetchStatus,
    pub data: Option<T>,
    pub error: Option<E>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    pub data_update_count: u64,
    pub error_update_count: u64,
    /// Consecutive failures of the *current* fetch cycle (reset on success).
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<E>,
    /// Set by `invalidate()`; cleared once a fetch driven by the
    /// invalidation starts (`spec.md` §4.2 step 5).
    pub is_invalidated: bool,
    /// `meta` aggregated from the observers active when the current/last
    /// fetch cycle started (`spec.md` §4.5 step 3).
    pub fetch_meta: Option<Value>,
}

impl<T, E> QueryState<T, E> {
    /// The state of a query that has never been fetched.
    pub fn idle() -> Self {
        Self {
            status: Status::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            data_update_count: 0,
            error_update_count: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            is_invalidated: false,
            fetch_meta: None,
        }
    }

    /// Seed state carrying an initial value supplied up front (`spec.md`
    /// §4.2 "Seeding" / `initialData`), counted as a success without a
    /// completed fetch cycle.
    pub fn with_initial_data(data: T, now: Instant) -> Self {
        Self {
            status: Status::Success,
            data: Some(data),
            data_updated_at: Some(now),
            ..Self::idle()
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == Status::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }
}
