//! Query configuration (`spec.md` §6 "Options (query)").

use std::time::Duration;

use crate::retry::{default_retry_policy, RetryPolicy};
use crate::value::Value;

/// How long data stays fresh after `dataUpdatedAt` (`spec.md` §4.5 "Staleness").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StaleTime {
    /// Fixed duration.
    After(Duration),
    /// Always stale (refetch on every trigger that consults staleness).
    Zero,
    /// Never stale except via explicit `invalidate()`.
    Infinity,
    /// Never stale, period — invalidation does not apply and refetch helpers
    /// that key off staleness skip this query entirely.
    Static,
}

impl Default for StaleTime {
    fn default() -> Self {
        StaleTime::Zero
    }
}

/// How long an observerless query survives before GC (`spec.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GcTime {
    After(Duration),
    /// Remove on the very next tick once observerless.
    Zero,
    /// GC disabled.
    Infinity,
}

impl Default for GcTime {
    fn default() -> Self {
        GcTime::After(Duration::from_secs(5 * 60))
    }
}

impl GcTime {
    fn rank(&self) -> Duration {
        match self {
            GcTime::Zero => Duration::ZERO,
            GcTime::After(d) => *d,
            GcTime::Infinity => Duration::MAX,
        }
    }

    /// Coalesce two requested durations by taking the maximum (`spec.md`
    /// §4.4: "coalesced: the maximum over its current observers' requested
    /// durations and any query-level default").
    pub fn coalesce(self, other: GcTime) -> GcTime {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            GcTime::Infinity => None,
            GcTime::Zero => Some(Duration::ZERO),
            GcTime::After(d) => Some(*d),
        }
    }
}

/// Refetch policy knob shared by mount/resume/interval triggers (`spec.md`
/// §4.5 "Refetch decision matrix").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchPolicy {
    Stale,
    Never,
    Always,
}

impl Default for RefetchPolicy {
    fn default() -> Self {
        RefetchPolicy::Stale
    }
}

/// `spec.md` §9 open question: connectivity-aware gating for `canRun()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Pause while offline, resume automatically on reconnect.
    Online,
    /// Ignore connectivity entirely.
    Always,
    /// Attempt the first try regardless of connectivity, then pause on
    /// failure until back online.
    OfflineFirst,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Online
    }
}

/// Configuration resolved for a single query observer (`spec.md` §6).
#[derive(Clone)]
pub struct QueryOptions<T, E> {
    pub enabled: bool,
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
    pub refetch_on_mount: RefetchPolicy,
    pub refetch_on_resume: RefetchPolicy,
    pub refetch_interval: Option<Duration>,
    pub retry: RetryPolicy<E>,
    pub retry_on_mount: bool,
    pub seed: Option<T>,
    pub seed_updated_at: Option<std::time::Instant>,
    pub placeholder: Option<T>,
    pub meta: Option<Value>,
    pub network_mode: NetworkMode,
}

impl<T, E> Default for QueryOptions<T, E> {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: StaleTime::default(),
            gc_time: GcTime::default(),
            refetch_on_mount: RefetchPolicy::default(),
            refetch_on_resume: RefetchPolicy::default(),
            refetch_interval: None,
            retry: default_retry_policy(),
            retry_on_mount: true,
            seed: None,
            seed_updated_at: None,
            placeholder: None,
            meta: None,
            network_mode: NetworkMode::default(),
        }
    }
}

impl<T, E> std::fmt::Debug for QueryOptions<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_on_resume", &self.refetch_on_resume)
            .field("refetch_interval", &self.refetch_interval)
            .field("retry_on_mount", &self.retry_on_mount)
            .field("network_mode", &self.network_mode)
            .finish_non_exhaustive()
    }
}
