//! Connection finite-state machine types and the per-connection record.
//!
//! This module defines every state a [`crate::conn::Conn`] can occupy,
//! following the RFC 4340 state diagram, and the long-term sequence-number
//! variables the RFC attaches to a connection.  Transitions are *not*
//! implemented here — they live in [`crate::transitions`].
//!
//! ```text
//!  CLOSED ──listen──▶ LISTEN ──Request──▶ RESPOND ──Ack──▶ OPEN
//!     │                                                      │
//!     └──dial──▶ REQUEST ──Response──▶ PARTOPEN ──Ack──▶ OPEN │
//!                                                             ▼ local close
//!  CLOSED ◀──timer── TIMEWAIT ◀──Reset/timeout── CLOSING ◀────┘
//! ```
//!
//! CLOSEREQ (server-initiated close) is deliberately not modelled.

use crate::header::MAX_SEQNO;

/// All states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection exists; initial and terminal state.
    Closed,
    /// Server awaiting a Request.
    Listen,
    /// Client retransmitting its Request.
    Request,
    /// Server has answered a Request; awaiting the client's Ack.
    Respond,
    /// Client holds a Response but its first Ack is not yet acknowledged.
    PartOpen,
    /// Steady state; data flows.
    Open,
    /// Local close in progress; Close is being retransmitted.
    Closing,
    /// Quiet period absorbing stragglers before release.
    TimeWait,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Socket record
// ---------------------------------------------------------------------------

/// Round-trip estimate before any sample exists: 200 ms.
pub const RTT_DEFAULT: i64 = 200_000_000;

/// Half-width of the sequence window accepted around GSR in OPEN.
pub const SEQ_WINDOW: i64 = 100;

/// The RFC's per-connection variables.  Owned by exactly one connection and
/// mutated only under its lock.
#[derive(Debug)]
pub struct Socket {
    state: State,
    /// Client or server role.
    server: bool,
    service_code: u32,
    /// Initial sequence number sent / received.
    iss: i64,
    isr: i64,
    /// Greatest sequence number sent / received.
    gss: i64,
    gsr: i64,
    /// Greatest acknowledgement number received.
    gar: i64,
    /// Sequence number of the packet that moved this side into OPEN.
    osr: i64,
    /// Round-trip estimate, nanoseconds.
    rtt: i64,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self {
            state: State::Closed,
            server: false,
            service_code: 0,
            iss: 0,
            isr: 0,
            gss: 0,
            gsr: 0,
            gar: 0,
            osr: 0,
            rtt: RTT_DEFAULT,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }
    pub fn set_state(&mut self, s: State) {
        self.state = s;
    }

    pub fn is_server(&self) -> bool {
        self.server
    }
    pub fn set_server(&mut self, server: bool) {
        self.server = server;
    }

    pub fn service_code(&self) -> u32 {
        self.service_code
    }
    pub fn set_service_code(&mut self, sc: u32) {
        self.service_code = sc;
    }

    /// Draw a random initial sequence number and prime GSS so that the first
    /// packet sent carries exactly ISS.
    pub fn choose_iss(&mut self) -> i64 {
        let iss = (rand::random::<u64>() & MAX_SEQNO as u64).max(1) as i64;
        self.iss = iss;
        self.gss = sub_seqno(iss, 1);
        iss
    }

    pub fn iss(&self) -> i64 {
        self.iss
    }
    pub fn isr(&self) -> i64 {
        self.isr
    }
    pub fn set_isr(&mut self, isr: i64) {
        self.isr = isr;
    }

    /// Advance and return GSS: the sequence number for the next outgoing
    /// packet.  Wraps mod 2^48.
    pub fn next_seqno(&mut self) -> i64 {
        self.gss = add_seqno(self.gss, 1);
        self.gss
    }

    pub fn gss(&self) -> i64 {
        self.gss
    }

    pub fn gsr(&self) -> i64 {
        self.gsr
    }
    pub fn set_gsr(&mut self, gsr: i64) {
        self.gsr = gsr;
    }
    /// Record an inbound sequence number if it is the greatest seen.
    pub fn update_gsr(&mut self, seqno: i64) {
        if seqno > self.gsr {
            self.gsr = seqno;
        }
    }

    pub fn gar(&self) -> i64 {
        self.gar
    }
    pub fn set_gar(&mut self, gar: i64) {
        self.gar = gar;
    }
    pub fn update_gar(&mut self, ackno: i64) {
        if ackno > self.gar {
            self.gar = ackno;
        }
    }

    pub fn osr(&self) -> i64 {
        self.osr
    }
    pub fn set_osr(&mut self, osr: i64) {
        self.osr = osr;
    }

    pub fn rtt(&self) -> i64 {
        self.rtt
    }
    pub fn set_rtt(&mut self, rtt: i64) {
        if rtt > 0 {
            self.rtt = rtt;
        }
    }

    /// Whether an inbound sequence number is plausible in OPEN: within
    /// [`SEQ_WINDOW`] of GSR on either side.
    pub fn in_seq_window(&self, seqno: i64) -> bool {
        let lo = sub_seqno(self.gsr, SEQ_WINDOW);
        let hi = add_seqno(self.gsr, SEQ_WINDOW);
        if lo <= hi {
            (lo..=hi).contains(&seqno)
        } else {
            // Window straddles the 48-bit wrap.
            seqno >= lo || seqno <= hi
        }
    }
}

/// Addition mod 2^48.
pub fn add_seqno(a: i64, b: i64) -> i64 {
    (a + b) & MAX_SEQNO
}

/// Subtraction mod 2^48.
pub fn sub_seqno(a: i64, b: i64) -> i64 {
    (a - b) & MAX_SEQNO
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seqno_is_iss() {
        let mut s = Socket::new();
        let iss = s.choose_iss();
        assert_eq!(s.next_seqno(), iss);
        assert_eq!(s.next_seqno(), add_seqno(iss, 1));
    }

    #[test]
    fn seqno_wraps_at_48_bits() {
        let mut s = Socket::new();
        s.gss = MAX_SEQNO;
        assert_eq!(s.next_seqno(), 0);
    }

    #[test]
    fn gsr_only_moves_forward() {
        let mut s = Socket::new();
        s.update_gsr(50);
        s.update_gsr(30);
        assert_eq!(s.gsr(), 50);
        s.update_gsr(51);
        assert_eq!(s.gsr(), 51);
    }

    #[test]
    fn seq_window_straddles_wrap() {
        let mut s = Socket::new();
        s.set_gsr(MAX_SEQNO - 10);
        assert!(s.in_seq_window(MAX_SEQNO));
        assert!(s.in_seq_window(5)); // wrapped side
        assert!(s.in_seq_window(MAX_SEQNO - 100));
        assert!(!s.in_seq_window(1_000_000));
    }

    #[test]
    fn rtt_rejects_nonpositive_samples() {
        let mut s = Socket::new();
        s.set_rtt(0);
        assert_eq!(s.rtt(), RTT_DEFAULT);
        s.set_rtt(50_000_000);
        assert_eq!(s.rtt(), 50_000_000);
    }
}
