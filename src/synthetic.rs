//! Virtual-time scheduler.
//!
//! [`SyntheticRuntime`] simulates the passage of time without sleeping.  The
//! scheduler task repeatedly yields to the tokio executor and drains sleep
//! registrations; once no registration has arrived for [`SPIN_THRESHOLD`]
//! consecutive yields it concludes every other task is parked, jumps the
//! clock to the earliest sleeper and wakes it.  When the sleeper heap runs dry
//! at a quiescent point the runtime terminates.
//!
//! The spin threshold is a heuristic: the executor offers no primitive to ask
//! "is every other task parked?".  One hundred cooperative yields with no
//! traffic is taken as proof of quiescence.  It requires a current-thread
//! tokio runtime — the default flavor of `#[tokio::test]` — so that a yield
//! actually runs every other ready task.
//!
//! Tasks that touch the runtime after termination panic; a late sleeper is a
//! leaked task, and hiding it would only move the hang somewhere harder to
//! see.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::runtime::{BoxFuture, Runtime};

/// Consecutive idle yields after which the scheduler assumes quiescence.
pub const SPIN_THRESHOLD: u32 = 100;

// ---------------------------------------------------------------------------
// Requests and the sleeper heap
// ---------------------------------------------------------------------------

struct SleepReq {
    nanos: i64,
    wake: oneshot::Sender<()>,
}

/// Heap entry; min-ordered by wake time, FIFO among equal wake times.
struct Sleeper {
    wake_at: i64,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}
impl Eq for Sleeper {}
impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert for earliest-first.
        other
            .wake_at
            .cmp(&self.wake_at)
            .then(other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// SyntheticRuntime
// ---------------------------------------------------------------------------

/// A [`Runtime`] that simulates time.  Build with [`SyntheticRuntime::start`]
/// from inside a current-thread tokio runtime.
pub struct SyntheticRuntime {
    now: Arc<AtomicI64>,
    req_tx: mpsc::UnboundedSender<SleepReq>,
    done_rx: watch::Receiver<bool>,
}

impl SyntheticRuntime {
    /// Spawn the scheduler task and return a handle to the runtime.
    pub fn start() -> Arc<Self> {
        let now = Arc::new(AtomicI64::new(0));
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let clock = Arc::clone(&now);
        tokio::spawn(scheduler_loop(clock, req_rx, done_tx));

        Arc::new(Self {
            now,
            req_tx,
            done_rx,
        })
    }

    /// Wait until the scheduler has terminated, i.e. until every task inside
    /// the runtime has completed in finite virtual time.
    pub async fn join(&self) {
        let mut rx = self.done_rx.clone();
        // Already-terminated runtimes resolve immediately.
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Runtime for SyntheticRuntime {
    fn now(&self) -> i64 {
        // Time only moves while every task is parked, so a plain load is a
        // consistent observation.
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, nanos: i64) -> BoxFuture<()> {
        assert!(nanos >= 0, "sleeping for negative time");
        let (wake_tx, wake_rx) = oneshot::channel();
        let sent = self.req_tx.send(SleepReq {
            nanos,
            wake: wake_tx,
        });
        Box::pin(async move {
            if sent.is_err() {
                panic!("sleep on a terminated synthetic runtime (leaked task?)");
            }
            wake_rx
                .await
                .expect("synthetic scheduler dropped a pending sleeper");
        })
    }

    fn spawn(&self, _tag: &'static str, task: BoxFuture<()>) {
        tokio::spawn(task);
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

async fn scheduler_loop(
    clock: Arc<AtomicI64>,
    mut req_rx: mpsc::UnboundedReceiver<SleepReq>,
    done_tx: watch::Sender<bool>,
) {
    let mut sleepers: BinaryHeap<Sleeper> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut idle: u32 = 0;

    loop {
        // Let every other ready task run before checking for traffic.
        tokio::task::yield_now().await;

        let mut got_any = false;
        loop {
            match req_rx.try_recv() {
                Ok(req) => {
                    got_any = true;
                    let now = clock.load(Ordering::SeqCst);
                    sleepers.push(Sleeper {
                        wake_at: now + req.nanos,
                        seq,
                        wake: req.wake,
                    });
                    seq += 1;
                }
                Err(_) => break,
            }
        }
        if got_any {
            idle = 0;
            continue;
        }

        idle += 1;
        if idle < SPIN_THRESHOLD {
            continue;
        }

        // Quiescent.  Advance to the earliest sleeper, or terminate.
        match sleepers.pop() {
            None => break,
            Some(next) => {
                let now = clock.load(Ordering::SeqCst);
                assert!(next.wake_at >= now, "waking in the past");
                clock.store(next.wake_at, Ordering::SeqCst);
                log::trace!("[synth] advance to {}ns", next.wake_at);
                // A dropped receiver means the sleeping task was cancelled;
                // nothing to wake.
                let _ = next.wake.send(());
                idle = 0;
            }
        }
    }

    log::trace!("[synth] quiescent, terminating");
    let _ = done_tx.send(true);
    // Dropping req_rx here makes any straggler's sleep() panic.
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Env;
    use std::sync::Mutex;
    use std::time::Instant;

    #[tokio::test]
    async fn sleepers_wake_in_deadline_order() {
        let rt = SyntheticRuntime::start();
        let env = Env::with_runtime(rt.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, nanos) in [("c", 30_000_000i64), ("a", 10_000_000), ("b", 20_000_000)] {
            let env2 = env.clone();
            let order2 = Arc::clone(&order);
            env.go("sleeper", async move {
                env2.sleep(nanos).await;
                order2.lock().unwrap().push((tag, env2.now()));
            });
        }

        rt.join().await;
        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec![
                ("a", 10_000_000),
                ("b", 20_000_000),
                ("c", 30_000_000),
            ]
        );
    }

    #[tokio::test]
    async fn hours_of_virtual_time_pass_instantly() {
        let rt = SyntheticRuntime::start();
        let env = Env::with_runtime(rt.clone());
        let started = Instant::now();

        let env2 = env.clone();
        env.go("long-sleeper", async move {
            env2.sleep(3_600 * 1_000_000_000).await; // one virtual hour
        });

        rt.join().await;
        assert_eq!(env.now(), 3_600 * 1_000_000_000);
        assert!(started.elapsed().as_secs() < 5, "virtual time must not be real");
    }

    #[tokio::test]
    async fn nested_sleeps_accumulate() {
        let rt = SyntheticRuntime::start();
        let env = Env::with_runtime(rt.clone());

        let env2 = env.clone();
        env.go("nested", async move {
            for _ in 0..10 {
                env2.sleep(1_000_000_000).await;
            }
        });

        rt.join().await;
        assert_eq!(env.now(), 10_000_000_000);
    }

    #[tokio::test]
    async fn empty_runtime_terminates() {
        let rt = SyntheticRuntime::start();
        rt.join().await;
    }
}
