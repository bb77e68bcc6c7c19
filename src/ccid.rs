//! Congestion-control seam.
//!
//! Each connection owns two pluggable modules, one per half-connection
//! direction: the sender-side module paces outgoing packets and annotates
//! them with CCVal and sender→receiver options; the receiver-side module
//! observes inbound data and answers with receiver→sender options.  The
//! engine never interprets options it did not produce — it validates the
//! direction partition and forwards.
//!
//! The concrete algorithms are out of scope; [`FixedRateSender`] and
//! [`NopReceiver`] are the stand-ins wired in by default.

use std::sync::{Arc, Mutex};

use crate::header::PacketType;
use crate::options::Opt;
use crate::runtime::{BoxFuture, Env};

/// Header fields shown to the CCID hooks right before a packet is encoded.
#[derive(Debug, Clone)]
pub struct PreHeader {
    pub ptype: PacketType,
    pub x: bool,
    pub seqno: i64,
    pub ackno: i64,
    /// Time the packet is being written, monotone nanoseconds.
    pub time_write: i64,
}

/// Inbound header summary handed to the CCID ingestion hooks.
#[derive(Debug, Clone)]
pub struct FeedbackHeader {
    pub ptype: PacketType,
    pub x: bool,
    pub seqno: i64,
    pub ackno: i64,
    pub options: Vec<Opt>,
    pub time_read: i64,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Sender-side congestion control (the "HC-Sender CCID").
///
/// Methods take `&self` and implementations use interior mutability, so that
/// [`strobe`](Self::strobe) can run while no connection lock is held.
pub trait SenderCongestionControl: Send + Sync + 'static {
    /// Start the module.  Must be idempotent.
    fn open(&self);

    /// Stop the module.  Must be idempotent.
    fn close(&self);

    /// Called under the connection lock for every outgoing packet.  Returns
    /// the CCVal nibble and sender→receiver options to attach.
    fn on_write(&self, pre: &PreHeader) -> (u8, Vec<Opt>);

    /// Called for inbound packets carrying acknowledgement feedback.
    fn on_read(&self, fb: &FeedbackHeader);

    /// Block until the rate limiter admits the next send.  Runs outside all
    /// locks.
    fn strobe(&self) -> BoxFuture<()>;
}

/// Receiver-side congestion control (the "HC-Receiver CCID").
pub trait ReceiverCongestionControl: Send + Sync + 'static {
    fn open(&self);
    fn close(&self);

    /// Called under the connection lock for every outgoing packet.  Returns
    /// receiver→sender options to attach.
    fn on_write(&self, pre: &PreHeader) -> Vec<Opt>;

    /// Called for inbound data-bearing packets.
    fn on_read(&self, fb: &FeedbackHeader);
}

// ---------------------------------------------------------------------------
// FixedRateSender
// ---------------------------------------------------------------------------

/// Sender control pacing at a fixed packet rate with a one-packet burst.
pub struct FixedRateSender {
    env: Env,
    /// Nanoseconds between admitted sends.
    interval: i64,
    inner: Arc<Mutex<RateState>>,
}

struct RateState {
    open: bool,
    /// Time of the most recent admitted send; None before any.
    last: Option<i64>,
}

impl FixedRateSender {
    /// `rate` is packets per second; must be positive.
    pub fn new(env: Env, rate: u32) -> Self {
        assert!(rate > 0, "rate must be positive");
        Self {
            env,
            interval: 1_000_000_000 / i64::from(rate),
            inner: Arc::new(Mutex::new(RateState {
                open: false,
                last: None,
            })),
        }
    }
}

impl SenderCongestionControl for FixedRateSender {
    fn open(&self) {
        self.inner.lock().unwrap().open = true;
    }

    fn close(&self) {
        self.inner.lock().unwrap().open = false;
    }

    fn on_write(&self, _pre: &PreHeader) -> (u8, Vec<Opt>) {
        (0, Vec::new())
    }

    fn on_read(&self, _fb: &FeedbackHeader) {}

    fn strobe(&self) -> BoxFuture<()> {
        let env = self.env.clone();
        let interval = self.interval;
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let wait = {
                let mut g = inner.lock().unwrap();
                if !g.open {
                    return; // pacing starts with the connection
                }
                let now = env.now();
                match g.last {
                    Some(last) if now < last + interval => last + interval - now,
                    _ => {
                        g.last = Some(now);
                        return;
                    }
                }
            };
            env.sleep(wait).await;
            let mut g = inner.lock().unwrap();
            g.last = Some(env.now());
        })
    }
}

// ---------------------------------------------------------------------------
// NopReceiver
// ---------------------------------------------------------------------------

/// Receiver control that observes nothing and emits nothing.
pub struct NopReceiver;

impl ReceiverCongestionControl for NopReceiver {
    fn open(&self) {}
    fn close(&self) {}
    fn on_write(&self, _pre: &PreHeader) -> Vec<Opt> {
        Vec::new()
    }
    fn on_read(&self, _fb: &FeedbackHeader) {}
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticRuntime;

    const SEC: i64 = 1_000_000_000;

    #[tokio::test]
    async fn strobe_respects_the_rate_bound() {
        let rt = SyntheticRuntime::start();
        let env = Env::with_runtime(rt.clone());
        let counted = Arc::new(Mutex::new((0u32, 0i64)));

        let env2 = env.clone();
        let counted2 = Arc::clone(&counted);
        env.go("strober", async move {
            // 10 packets/sec over 2 virtual seconds.
            let cc = FixedRateSender::new(env2.clone(), 10);
            cc.open();
            let mut sent = 0u32;
            while env2.now() < 2 * SEC {
                cc.strobe().await;
                sent += 1;
            }
            *counted2.lock().unwrap() = (sent, env2.now());
        });

        rt.join().await;
        let (sent, elapsed) = *counted.lock().unwrap();
        let seconds = elapsed / SEC;
        assert!(
            u64::from(sent) <= 10 * seconds as u64 + 1,
            "{sent} sends in {seconds}s exceeds rate bound"
        );
        assert!(sent >= 10, "pacer must actually admit sends");
    }

    #[tokio::test]
    async fn first_strobe_is_immediate() {
        let rt = SyntheticRuntime::start();
        let env = Env::with_runtime(rt.clone());
        let t = Arc::new(Mutex::new(-1i64));

        let env2 = env.clone();
        let t2 = Arc::clone(&t);
        env.go("one-shot", async move {
            let cc = FixedRateSender::new(env2.clone(), 1);
            cc.open();
            cc.strobe().await;
            *t2.lock().unwrap() = env2.now();
        });

        rt.join().await;
        assert_eq!(*t.lock().unwrap(), 0, "burst of one admitted at t=0");
    }
}
