//! Injectable clock/timer abstraction.
//!
//! Time-sensitive behavior needs tests that can fast-forward virtual time
//! without real sleeps. We implement a `Clock` trait but keep the
//! production side a thin wrapper around `tokio::time`, because `tokio`
//! already exposes exactly this injectability via its paused test clock
//! (`tokio::time::pause`/`advance`, enabled by the `test-util` feature). A
//! hand-rolled manual clock would just duplicate that machinery.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;

/// Abstracts "what time is it" and "wait this long" so the engine never
/// calls `tokio::time` directly outside this module.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Production clock: real wall time, backed by the Tokio timer wheel.
/// Under `#[tokio::test(start_paused = true)]` this clock's `sleep` calls
/// resolve instantly until `tokio::time::advance` moves the virtual clock
/// forward, which is how every timing-sensitive test in this crate runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return immediate();
        }
        Box::pin(async move {
            tokio::time::sleep(duration).await;
        })
    }
}

/// A retry policy returning `Duration::ZERO` wants to yield control and come
/// straight back rather than arm a real timer; `tokio::time::sleep(ZERO)`
/// still registers with the timer wheel, so `SystemClock::sleep` takes this
/// path instead.
fn immediate() -> BoxFuture<'static, ()> {
    Box::pin(async {})
}
