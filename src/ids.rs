//! Identifiers handed out by the observer registries.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Identifies one [`crate::query::observer::QueryObserver`] registration with
/// a [`crate::query::query::Query`]. Opaque, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one raw state-change subscription on a [`Query`] or
/// [`crate::mutation::mutation::Mutation`] (distinct from [`ObserverId`]:
/// a cache's own listener and an observer's listener are both plain
/// subscriptions, not observers in the `spec.md` §4.5 sense).
///
/// [`Query`]: crate::query::query::Query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Auto-incrementing numeric mutation id (`spec.md` §3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(1);

impl MutationId {
    pub fn new() -> Self {
        Self(NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}
