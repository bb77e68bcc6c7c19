//! Time and task capabilities.
//!
//! Every component that sleeps, spawns or reads the clock does so through an
//! [`Env`], never through `tokio::time` directly.  This is what lets the whole
//! protocol stack run unmodified under the virtual-time scheduler in
//! [`crate::synthetic`]: tests swap the runtime, nothing else changes.
//!
//! ```text
//!  Conn / BackOff / Mux ──▶ Env ──▶ dyn Runtime ──▶ WallClock (tokio::time)
//!                            │                  └──▶ SyntheticRuntime
//!                            └──▶ MonotoneClock (shared, serialised)
//! ```
//!
//! Times are `i64` nanoseconds since an arbitrary per-runtime epoch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mono::MonotoneClock;

/// Boxed future, the coin of object-safe async traits.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

// ---------------------------------------------------------------------------
// Runtime trait
// ---------------------------------------------------------------------------

/// The capability a runtime must provide: a clock, a sleeper and a spawner.
pub trait Runtime: Send + Sync + 'static {
    /// Nanoseconds since this runtime's epoch.  Synchronous; never a
    /// scheduling point.
    fn now(&self) -> i64;

    /// Suspend the calling task for `nanos` nanoseconds.
    fn sleep(&self, nanos: i64) -> BoxFuture<()>;

    /// Start a background task.  `tag` identifies it in trace output.
    fn spawn(&self, tag: &'static str, task: BoxFuture<()>);
}

// ---------------------------------------------------------------------------
// WallClock
// ---------------------------------------------------------------------------

/// Real-time runtime backed by `tokio::time`.
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for WallClock {
    fn now(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    fn sleep(&self, nanos: i64) -> BoxFuture<()> {
        assert!(nanos >= 0, "sleeping for negative time");
        Box::pin(tokio::time::sleep(Duration::from_nanos(nanos as u64)))
    }

    fn spawn(&self, _tag: &'static str, task: BoxFuture<()>) {
        tokio::spawn(task);
    }
}

// ---------------------------------------------------------------------------
// Env
// ---------------------------------------------------------------------------

/// Cheap cloneable handle bundling a runtime with the shared monotone clock.
///
/// All protocol code takes an `Env`; the choice of wall-clock versus synthetic
/// time is made exactly once, where the `Env` is built.
#[derive(Clone)]
pub struct Env {
    rt: Arc<dyn Runtime>,
    mono: Arc<MonotoneClock>,
}

impl Env {
    /// Wrap an arbitrary runtime.
    pub fn with_runtime(rt: Arc<dyn Runtime>) -> Self {
        let mono = Arc::new(MonotoneClock::new(Arc::clone(&rt)));
        Self { rt, mono }
    }

    /// Real-time environment.
    pub fn real() -> Self {
        Self::with_runtime(Arc::new(WallClock::new()))
    }

    /// Current time through the monotone wrapper.
    pub fn now(&self) -> i64 {
        self.mono.now()
    }

    /// Suspend for `nanos` nanoseconds.
    pub async fn sleep(&self, nanos: i64) {
        self.rt.sleep(nanos).await
    }

    /// Spawn a tagged background task.
    pub fn go<F>(&self, tag: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::trace!("[env] go {tag}");
        self.rt.spawn(tag, Box::pin(task));
    }

    /// Deferred timeout: poll `predicate` every `interval` nanoseconds.  The
    /// task exits silently as soon as the predicate holds; once accumulated
    /// waiting reaches `timeout` without it holding, `on_timeout` runs once
    /// and the task exits.
    pub fn expire<P, T>(&self, predicate: P, on_timeout: T, timeout: i64, interval: i64, tag: &'static str)
    where
        P: Fn() -> bool + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        let env = self.clone();
        self.go(tag, async move {
            let mut waited: i64 = 0;
            loop {
                env.sleep(interval).await;
                if predicate() {
                    return;
                }
                waited += interval;
                if waited >= timeout {
                    log::debug!("[env] expire {tag} fired after {waited}ns");
                    on_timeout();
                    return;
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn wall_clock_advances() {
        let env = Env::real();
        let t0 = env.now();
        env.sleep(5_000_000).await; // 5 ms
        let t1 = env.now();
        assert!(t1 > t0);
    }

    #[tokio::test]
    async fn expire_skipped_when_predicate_holds() {
        let env = Env::real();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        env.expire(
            || true,
            move || fired2.store(true, Ordering::SeqCst),
            10_000_000,
            1_000_000,
            "test-expire",
        );
        env.sleep(30_000_000).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn expire_fires_on_timeout() {
        let env = Env::real();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        env.expire(
            || false,
            move || fired2.store(true, Ordering::SeqCst),
            5_000_000,
            1_000_000,
            "test-expire",
        );
        env.sleep(50_000_000).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
