//! Outbound pipeline: envelopes, injection and the three-phase writer.
//!
//! Sequence and acknowledgement numbers depend on socket state *at the moment
//! of sending*, not at the moment a packet is decided upon, so producers
//! enqueue a [`WriteEnvelope`] — a header skeleton plus resolution metadata —
//! and the writer fills the numbers in right before the bytes leave.
//!
//! The writer runs as one task over two conduits:
//!
//! ```text
//!  transitions / timers / reader ──▶ control conduit ──┐  (strict priority)
//!                                                      ├──▶ writer ──▶ link
//!  write_segment ─────────────────▶ data conduit ──────┘
//! ```
//!
//! and moves through three phases: drain control only until the connection
//! opens, then select between both conduits with control first, then drain
//! control again while the connection winds down.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ccid::{PreHeader, ReceiverCongestionControl, SenderCongestionControl};
use crate::conn::Conn;
use crate::error::Result;
use crate::header::{Header, PacketType};
use crate::options;
use crate::state::{Socket, State};

/// A control-conduit item: an envelope to send, or `None`, a pure wake-up
/// that lets the writer observe a state change.
pub(crate) type WriteItem = Option<WriteEnvelope>;

// ---------------------------------------------------------------------------
// WriteEnvelope
// ---------------------------------------------------------------------------

/// A header skeleton awaiting sequence-number resolution.
#[derive(Debug)]
pub(crate) struct WriteEnvelope {
    pub(crate) header: Header,
    /// Acknowledge this specific sequence number instead of GSR — used by
    /// SyncAck and Reset, which answer one particular packet.
    pub(crate) in_response_to: Option<i64>,
}

impl WriteEnvelope {
    fn of_type(ptype: PacketType) -> Self {
        Self {
            header: Header::of_type(ptype),
            in_response_to: None,
        }
    }

    pub(crate) fn request(service_code: u32) -> Self {
        let mut e = Self::of_type(PacketType::Request);
        e.header.service_code = service_code;
        e
    }

    pub(crate) fn response(service_code: u32) -> Self {
        let mut e = Self::of_type(PacketType::Response);
        e.header.service_code = service_code;
        e
    }

    pub(crate) fn ack() -> Self {
        Self::of_type(PacketType::Ack)
    }

    pub(crate) fn data_ack(payload: Vec<u8>) -> Self {
        let mut e = Self::of_type(PacketType::DataAck);
        e.header.payload = payload;
        e
    }

    pub(crate) fn close() -> Self {
        Self::of_type(PacketType::Close)
    }

    pub(crate) fn sync_ack(in_response_to: i64) -> Self {
        let mut e = Self::of_type(PacketType::SyncAck);
        e.in_response_to = Some(in_response_to);
        e
    }

    pub(crate) fn reset(code: u8, in_response_to: Option<i64>) -> Self {
        let mut e = Self::of_type(PacketType::Reset);
        e.header.reset_code = code;
        e.in_response_to = in_response_to;
        e
    }

    /// Fill seq/ack from the live socket.  Runs under the connection lock.
    fn resolve(&mut self, socket: &mut Socket) {
        self.header.x = true;
        self.header.seqno = socket.next_seqno();
        if self.header.ptype.has_ackno() {
            self.header.ackno = self.in_response_to.unwrap_or_else(|| socket.gsr());
        }
    }
}

// ---------------------------------------------------------------------------
// CCID annotation
// ---------------------------------------------------------------------------

/// Let both congestion-control halves see and annotate an outgoing header.
/// A module that emits options outside its direction of the code space is a
/// programmer bug and dies loudly.
pub(crate) fn annotate_cc(
    scc: &dyn SenderCongestionControl,
    rcc: &dyn ReceiverCongestionControl,
    h: &mut Header,
    time_write: i64,
) {
    let pre = PreHeader {
        ptype: h.ptype,
        x: h.x,
        seqno: h.seqno,
        ackno: h.ackno,
        time_write,
    };
    let (ccval, sr_opts) = scc.on_write(&pre);
    if !options::validate_sender_to_receiver(&sr_opts) {
        panic!("sender congestion control emitted receiver-direction options");
    }
    h.ccval = ccval;
    let rs_opts = rcc.on_write(&pre);
    if !options::validate_receiver_to_sender(&rs_opts) {
        panic!("receiver congestion control emitted sender-direction options");
    }
    if !sr_opts.is_empty() || !rs_opts.is_empty() {
        log::debug!("[writer] cc placed {} options", sr_opts.len() + rs_opts.len());
    }
    h.options.extend(sr_opts);
    h.options.extend(rs_opts);
}

// ---------------------------------------------------------------------------
// Injection and per-packet send
// ---------------------------------------------------------------------------

impl Conn {
    /// Enqueue a control item without blocking.  A full conduit drops the
    /// item; the paired write/drop events keep downstream trace reduction
    /// honest about what happened.
    pub(crate) fn inject(&self, item: WriteItem) {
        let guard = self.write_non_data.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return; // writer already torn down
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                if let Some(envelope) = item {
                    log::debug!("[writer] write {}", envelope.header.ptype);
                    log::debug!("[writer] drop {} (slow strobe)", envelope.header.ptype);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Send one envelope: strobe outside the lock, resolve numbers and run
    /// the CCID hooks under it, write to the link outside it again.
    async fn send_envelope(self: &Arc<Self>, mut envelope: WriteEnvelope) -> Result<()> {
        self.scc.strobe().await;

        let header = {
            let mut g = self.inner.lock().unwrap();
            envelope.resolve(&mut g.socket);
            // Stamping the header this late keeps the CCID's round-trip
            // bookkeeping free of the strobe wait above.
            annotate_cc(
                self.scc.as_ref(),
                self.rcc.as_ref(),
                &mut envelope.header,
                self.env.now(),
            );
            envelope.header
        };

        log::debug!(
            "[writer] → {} seq={} ack={} len={}",
            header.ptype,
            header.seqno,
            header.ackno,
            header.payload.len()
        );
        self.hc.write(&header).await
    }
}

// ---------------------------------------------------------------------------
// Three-phase write loop
// ---------------------------------------------------------------------------

enum Phase {
    /// Control only, watching for the connection to open.
    PreOpen,
    /// Control and data, control first.
    Open,
    /// Control only, until the conduit closes.
    Draining,
}

pub(crate) async fn write_loop(
    conn: Arc<Conn>,
    mut control_rx: mpsc::Receiver<WriteItem>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut phase = Phase::PreOpen;
    log::debug!("[writer] phase I");

    'run: loop {
        match phase {
            Phase::PreOpen => {
                let Some(item) = control_rx.recv().await else {
                    break 'run;
                };
                if let Some(envelope) = item {
                    if conn.send_envelope(envelope).await.is_err() {
                        conn.abort_quietly();
                        break 'run;
                    }
                }
                // A nil wake lands here too: re-check the state either way.
                if matches!(conn.state(), State::Open | State::PartOpen) {
                    log::debug!("[writer] phase II");
                    phase = Phase::Open;
                }
            }

            Phase::Open => {
                tokio::select! {
                    biased;

                    item = control_rx.recv() => match item {
                        None => break 'run,
                        Some(None) => {}
                        Some(Some(envelope)) => {
                            if conn.send_envelope(envelope).await.is_err() {
                                conn.abort_quietly();
                                break 'run;
                            }
                        }
                    },

                    payload = data_rx.recv() => match payload {
                        None => {
                            // User side is done writing; only control traffic
                            // remains.
                            log::debug!("[writer] phase III");
                            phase = Phase::Draining;
                        }
                        Some(payload) => {
                            // Having reached this phase the peer has spoken,
                            // so the DataAck's AckNo is meaningful.
                            let envelope = WriteEnvelope::data_ack(payload);
                            if conn.send_envelope(envelope).await.is_err() {
                                conn.abort_quietly();
                                break 'run;
                            }
                        }
                    },
                }
            }

            Phase::Draining => {
                let Some(item) = control_rx.recv().await else {
                    break 'run;
                };
                if let Some(envelope) = item {
                    if conn.send_envelope(envelope).await.is_err() {
                        conn.abort_quietly();
                        break 'run;
                    }
                }
            }
        }
    }

    conn.hc.close();
    log::debug!("[writer] exit");
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccid::{FeedbackHeader, NopReceiver};
    use crate::options::Opt;
    use crate::runtime::BoxFuture;

    /// Sender control that emits an option from the receiver's half of the
    /// code space — a contract violation.
    struct RogueSender;

    impl SenderCongestionControl for RogueSender {
        fn open(&self) {}
        fn close(&self) {}
        fn on_write(&self, _pre: &PreHeader) -> (u8, Vec<Opt>) {
            (0, vec![Opt::single(200)])
        }
        fn on_read(&self, _fb: &FeedbackHeader) {}
        fn strobe(&self) -> BoxFuture<()> {
            Box::pin(async {})
        }
    }

    /// Receiver control that trespasses into the sender's half.
    struct RogueReceiver;

    impl ReceiverCongestionControl for RogueReceiver {
        fn open(&self) {}
        fn close(&self) {}
        fn on_write(&self, _pre: &PreHeader) -> Vec<Opt> {
            vec![Opt::single(130)]
        }
        fn on_read(&self, _fb: &FeedbackHeader) {}
    }

    /// Well-behaved sender for the receiver-violation test.
    struct QuietSender;

    impl SenderCongestionControl for QuietSender {
        fn open(&self) {}
        fn close(&self) {}
        fn on_write(&self, _pre: &PreHeader) -> (u8, Vec<Opt>) {
            (3, vec![Opt::single(41)])
        }
        fn on_read(&self, _fb: &FeedbackHeader) {}
        fn strobe(&self) -> BoxFuture<()> {
            Box::pin(async {})
        }
    }

    #[test]
    #[should_panic(expected = "sender congestion control emitted")]
    fn rogue_sender_option_is_fatal() {
        let mut h = Header::of_type(PacketType::Ack);
        annotate_cc(&RogueSender, &NopReceiver, &mut h, 0);
    }

    #[test]
    #[should_panic(expected = "receiver congestion control emitted")]
    fn rogue_receiver_option_is_fatal() {
        let mut h = Header::of_type(PacketType::Ack);
        annotate_cc(&QuietSender, &RogueReceiver, &mut h, 0);
    }

    #[test]
    fn lawful_options_are_appended_in_order() {
        let mut h = Header::of_type(PacketType::Ack);
        annotate_cc(&QuietSender, &NopReceiver, &mut h, 7);
        assert_eq!(h.ccval, 3);
        assert_eq!(h.options.len(), 1);
        assert_eq!(h.options[0].kind, 41);
    }
}
