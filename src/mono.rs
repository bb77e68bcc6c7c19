//! Strictly non-regressing clock.
//!
//! Wraps a runtime's raw clock and guarantees that consecutive observations
//! never decrease.  A runtime whose clock runs backwards is broken beyond
//! recovery, so a regression is a panic rather than an error value.

use std::sync::{Arc, Mutex};

use crate::runtime::Runtime;

/// Serialised monotone view of a runtime clock.  Shared by all users of one
/// [`crate::runtime::Env`].
pub struct MonotoneClock {
    rt: Arc<dyn Runtime>,
    last: Mutex<i64>,
}

impl MonotoneClock {
    pub fn new(rt: Arc<dyn Runtime>) -> Self {
        Self {
            rt,
            last: Mutex::new(0),
        }
    }

    /// Current time.  Panics if the underlying runtime reports a time earlier
    /// than a previous observation.
    pub fn now(&self) -> i64 {
        let mut last = self.last.lock().unwrap();
        let raw = self.rt.now();
        if raw < *last {
            panic!("monotone clock regression: {} < {}", raw, *last);
        }
        *last = raw;
        raw
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime whose clock reads from a scripted sequence of instants.
    struct Scripted {
        times: Vec<i64>,
        at: AtomicUsize,
    }

    impl Runtime for Scripted {
        fn now(&self) -> i64 {
            let i = self.at.fetch_add(1, Ordering::SeqCst);
            self.times[i.min(self.times.len() - 1)]
        }
        fn sleep(&self, _nanos: i64) -> BoxFuture<()> {
            Box::pin(async {})
        }
        fn spawn(&self, _tag: &'static str, _task: BoxFuture<()>) {}
    }

    #[test]
    fn passes_through_increasing_times() {
        let clock = MonotoneClock::new(Arc::new(Scripted {
            times: vec![1, 5, 5, 9],
            at: AtomicUsize::new(0),
        }));
        assert_eq!(clock.now(), 1);
        assert_eq!(clock.now(), 5);
        assert_eq!(clock.now(), 5); // equal is allowed
        assert_eq!(clock.now(), 9);
    }

    #[test]
    #[should_panic(expected = "monotone clock regression")]
    fn panics_on_regression() {
        let clock = MonotoneClock::new(Arc::new(Scripted {
            times: vec![10, 5],
            at: AtomicUsize::new(0),
        }));
        clock.now();
        clock.now(); // 5 after 10 — must die
    }
}
