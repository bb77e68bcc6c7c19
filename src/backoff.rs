//! Geometric back-off sleep generator.
//!
//! Drives retransmission in the non-steady connection states: the timer
//! starts with short sleeps, lengthens them by a factor of 4/3 once per
//! `backoff_freq` of accumulated lifetime, and expires when the lifetime
//! reaches `timeout`.  The gentle factor means roughly a 2.4× growth over a
//! 30 s lifetime with a 10 s back-off cadence.

use crate::runtime::Env;

/// Floor on any single back-off sleep.
pub const BACKOFF_MIN: i64 = 100_000_000; // 100 ms

/// One back-off sequence.  Not restartable; make a new one per state entry.
pub struct BackOff {
    env: Env,
    /// Duration of the next sleep interval.
    sleep: i64,
    /// Total time slept so far.
    lifetime: i64,
    /// Lifetime bound; expired once `lifetime >= timeout`.
    timeout: i64,
    /// Accumulated lifetime between lengthenings of `sleep`.
    backoff_freq: i64,
    /// Lifetime at the most recent lengthening.
    last_backoff: i64,
}

impl BackOff {
    pub fn new(env: Env, first_sleep: i64, timeout: i64, backoff_freq: i64) -> Self {
        Self {
            env,
            sleep: first_sleep,
            lifetime: 0,
            timeout,
            backoff_freq,
            last_backoff: 0,
        }
    }

    /// Block for the next interval in the sequence and return `Some(now)`.
    /// Returns `None` without sleeping once the total lifetime has been
    /// exhausted.
    pub async fn sleep(&mut self) -> Option<i64> {
        if self.lifetime >= self.timeout {
            return None;
        }
        let effective = self.sleep.max(BACKOFF_MIN);
        self.env.sleep(effective).await;
        self.lifetime += effective;
        if self.lifetime - self.last_backoff >= self.backoff_freq {
            self.sleep = 4 * self.sleep / 3;
            self.last_backoff = self.lifetime;
        }
        Some(self.env.now())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticRuntime;
    use std::sync::{Arc, Mutex};

    const SEC: i64 = 1_000_000_000;

    /// Run a back-off to exhaustion under virtual time, returning wake times.
    async fn run(first: i64, timeout: i64, freq: i64) -> Vec<i64> {
        let rt = SyntheticRuntime::start();
        let env = crate::runtime::Env::with_runtime(rt.clone());
        let wakes = Arc::new(Mutex::new(Vec::new()));

        let env2 = env.clone();
        let wakes2 = Arc::clone(&wakes);
        env.go("backoff-probe", async move {
            let mut b = BackOff::new(env2, first, timeout, freq);
            while let Some(now) = b.sleep().await {
                wakes2.lock().unwrap().push(now);
            }
        });

        rt.join().await;
        let wakes = wakes.lock().unwrap();
        wakes.clone()
    }

    #[tokio::test]
    async fn request_profile_wake_schedule() {
        // first=1s freq=10s timeout=30s: ten 1 s sleeps, then eight of 4/3 s,
        // then six of 16/9 s, exhausting just past 30 s.
        let wakes = run(SEC, 30 * SEC, 10 * SEC).await;
        assert_eq!(wakes.len(), 24);
        assert_eq!(wakes[0], SEC);
        assert_eq!(wakes[9], 10 * SEC);
        assert_eq!(wakes[10], 10 * SEC + 4 * SEC / 3);
        let last = *wakes.last().unwrap();
        assert!(last >= 30 * SEC, "must cover the full lifetime, got {last}");
        assert!(last < 32 * SEC, "overshoot bounded by one sleep, got {last}");
    }

    #[tokio::test]
    async fn wake_count_is_logarithmically_bounded() {
        let wakes = run(200_000_000, 30 * SEC, 200_000_000).await;
        // 200 ms first sleep backing off every 200 ms grows fast; far fewer
        // wakes than the 150 a flat 200 ms cadence would produce.
        assert!(wakes.len() < 40, "got {} wakes", wakes.len());
        assert!(*wakes.last().unwrap() >= 30 * SEC);
    }

    #[tokio::test]
    async fn minimum_sleep_is_enforced() {
        // A 1 ns first sleep is clamped to BACKOFF_MIN.
        let wakes = run(1, SEC, SEC).await;
        assert_eq!(wakes[0], BACKOFF_MIN);
    }

    #[tokio::test]
    async fn expired_timer_does_not_sleep() {
        let rt = SyntheticRuntime::start();
        let env = crate::runtime::Env::with_runtime(rt.clone());
        let out = Arc::new(Mutex::new((false, false, false, 0i64)));

        let env2 = env.clone();
        let out2 = Arc::clone(&out);
        env.go("spent", async move {
            let mut b = BackOff::new(env2.clone(), SEC, SEC, SEC);
            let first = b.sleep().await.is_some();
            let second = b.sleep().await.is_none();
            let third = b.sleep().await.is_none();
            *out2.lock().unwrap() = (first, second, third, env2.now());
        });

        rt.join().await;
        let (first, second, third, now) = *out.lock().unwrap();
        assert!(first);
        assert!(second && third, "stays expired");
        assert_eq!(now, SEC, "no extra time may pass");
    }
}
