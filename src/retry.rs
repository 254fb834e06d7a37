//! Retry controller (`spec.md` §4.1).
//!
//! Wraps an arbitrary async fetcher and drives it to completion, running an
//! initial attempt plus a caller-configured retry loop. Supports a `can_run`
//! gate that pauses the loop (e.g. "offline"), and external pause/resume/
//! cancel. One [`RetryController::run`] call models one fetch cycle; the
//! "same in-flight Promise" dedup guarantee from §4.2 step 1 is the
//! `Query`'s job (it memoizes the `run` future), not this controller's.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::error::EngineError;

/// `retry(attempt_index, error) -> Some(delay) | None`. `attempt_index` is
/// zero-based and counts completed failures, matching `spec.md` §4.1 step 3
/// ("ask `retry(failureCount-1, error)`").
pub type RetryPolicy<E> = Arc<dyn Fn(u32, &E) -> Option<Duration> + Send + Sync>;

/// Default policy: three retries, exponential backoff 1s/2s/4s.
pub fn default_retry_policy<E>() -> RetryPolicy<E> {
    Arc::new(|attempt_index: u32, _err: &E| match attempt_index {
        0 => Some(Duration::from_secs(1)),
        1 => Some(Duration::from_secs(2)),
        2 => Some(Duration::from_secs(4)),
        _ => None,
    })
}

/// A policy that never retries — the mutation engine's default (`spec.md`
/// §6: mutation `retry` defaults to "no retry").
pub fn no_retry_policy<E>() -> RetryPolicy<E> {
    Arc::new(|_attempt_index: u32, _err: &E| None)
}

/// Lifecycle hooks consulted during a run. All are optional.
#[derive(Clone)]
pub struct RetryHooks<T, E> {
    pub on_error: Option<Arc<dyn Fn(u32, &E) + Send + Sync>>,
    pub on_pause: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_resume: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_fail: Option<Arc<dyn Fn(&E) + Send + Sync>>,
    pub on_success: Option<Arc<dyn Fn(&T) + Send + Sync>>,
}

impl<T, E> Default for RetryHooks<T, E> {
    fn default() -> Self {
        Self {
            on_error: None,
            on_pause: None,
            on_resume: None,
            on_fail: None,
            on_success: None,
        }
    }
}

struct HandleInner<E> {
    paused: AtomicBool,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<E>>,
    changed: Notify,
}

/// External control surface for a [`RetryController::run`] in progress:
/// pause, resume, cancel. Cheap to clone; all clones observe the same run.
pub struct RetryHandle<E> {
    inner: Arc<HandleInner<E>>,
}

impl<E> Clone for RetryHandle<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for RetryHandle<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                cancel_reason: Mutex::new(None),
                changed: Notify::new(),
            }),
        }
    }
}

impl<E> RetryHandle<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause is a no-op once the run has reached a terminal state; callers
    /// don't need to check that themselves (`spec.md` §4.1 "Pausing a
    /// resolved/rejected controller is a no-op" — enforced by `run` not
    /// consulting the gate again after it returns).
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn cancel(&self, reason: Option<E>) {
        *self.inner.cancel_reason.lock() = reason;
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn take_cancel_reason(&self) -> Option<E> {
        self.inner.cancel_reason.lock().take()
    }

    async fn wait_for_change(&self) {
        self.inner.changed.notified().await;
    }
}

/// Drives `fetcher` to completion: initial attempt, then retries per
/// `policy`, gated by `can_run` and `handle`.
pub async fn run<F, Fut, T, E>(
    mut fetcher: F,
    policy: RetryPolicy<E>,
    hooks: RetryHooks<T, E>,
    can_run: Arc<dyn Fn() -> bool + Send + Sync>,
    clock: Arc<dyn Clock>,
    handle: RetryHandle<E>,
) -> Result<T, EngineError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failure_count: u32 = 0;

    loop {
        if handle.is_cancelled() {
            return Err(handle
                .take_cancel_reason()
                .map(EngineError::Source)
                .unwrap_or(EngineError::Aborted));
        }

        // Gate: pause while `can_run` is false or an explicit pause is held.
        while !can_run() || handle.is_paused() {
            if handle.is_cancelled() {
                return Err(handle
                    .take_cancel_reason()
                    .map(EngineError::Source)
                    .unwrap_or(EngineError::Aborted));
            }
            let was_already_paused = handle.is_paused();
            if !was_already_paused {
                handle.pause();
                if let Some(on_pause) = &hooks.on_pause {
                    on_pause();
                }
            }
            handle.wait_for_change().await;
            if !handle.is_paused() {
                if let Some(on_resume) = &hooks.on_resume {
                    on_resume();
                }
            }
        }

        // Race the attempt itself against cancellation so a fetcher that
        // never resolves (or ignores its cancel signal) cannot block
        // `cancel()` from returning promptly — the attempt's future is
        // simply dropped when cancellation wins.
        let cancel_wait = async {
            loop {
                if handle.is_cancelled() {
                    return;
                }
                handle.wait_for_change().await;
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel_wait => None,
            res = fetcher() => Some(res),
        };
        let Some(outcome) = outcome else {
            return Err(handle
                .take_cancel_reason()
                .map(EngineError::Source)
                .unwrap_or(EngineError::Aborted));
        };

        match outcome {
            Ok(value) => {
                if let Some(on_success) = &hooks.on_success {
                    on_success(&value);
                }
                return Ok(value);
            }
            Err(err) => {
                failure_count += 1;
                if let Some(on_error) = &hooks.on_error {
                    on_error(failure_count, &err);
                }

                match policy(failure_count - 1, &err) {
                    Some(delay) => {
                        // Always race the delay against pause/cancel
                        // notifications rather than gating the branch on
                        // current state — a guarded branch would miss a
                        // notification that arrives after the `select!` has
                        // already committed to polling only `clock.sleep`.
                        tokio::select! {
                            _ = clock.sleep(delay) => {}
                            _ = handle.wait_for_change() => {}
                        }
                        if handle.is_cancelled() {
                            return Err(handle
                                .take_cancel_reason()
                                .map(EngineError::Source)
                                .unwrap_or(EngineError::Aborted));
                        }
                    }
                    None => {
                        if let Some(on_fail) = &hooks.on_fail {
                            on_fail(&err);
                        }
                        return Err(EngineError::Source(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry_when_fetcher_resolves() {
        let handle = RetryHandle::default();
        let result = run(
            || async { Ok::<_, String>(42) },
            default_retry_policy(),
            RetryHooks::default(),
            Arc::new(|| true),
            Arc::new(crate::clock::SystemClock),
            handle,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff_then_fails() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy: RetryPolicy<String> = Arc::new(|n, _| if n < 3 { Some(Duration::from_secs(1)) } else { None });
        let handle = RetryHandle::default();

        let attempts_clone = attempts.clone();
        let fut = run(
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>("boom".to_string()) }
            },
            policy,
            RetryHooks::default(),
            Arc::new(|| true),
            Arc::new(crate::clock::SystemClock),
            handle,
        );

        let result = tokio::time::timeout(Duration::from_secs(10), fut).await.unwrap();
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_with_no_source_error() {
        let handle: RetryHandle<String> = RetryHandle::default();
        let handle_for_cancel = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            handle_for_cancel.cancel(None);
        });

        let result = run(
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<u32, String>(1)
            },
            default_retry_policy(),
            RetryHooks::default(),
            Arc::new(|| true),
            Arc::new(crate::clock::SystemClock),
            handle,
        )
        .await;

        assert!(matches!(result, Err(EngineError::Aborted)));
    }
}
