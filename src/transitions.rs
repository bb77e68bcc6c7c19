//! State transitions and their timers.
//!
//! Each `goto_*` function performs one legal transition of the connection
//! FSM: it updates the socket record, adjusts the congestion-control
//! lifecycle, enqueues whatever packet the new state requires, and spawns the
//! state's timer task.  Every function takes the connection's lock guard, so
//! calling one without the lock is a compile error rather than a race.
//!
//! Timer tasks re-read the state under the lock after every sleep and exit
//! silently once the connection has moved on — a later transition supersedes
//! the task that the earlier one spawned.

use std::sync::Arc;

use crate::backoff::BackOff;
use crate::conn::{Conn, Inner};
use crate::error::Error;
use crate::state::State;
use crate::writer::WriteEnvelope;

// ---------------------------------------------------------------------------
// Timing constants, nanoseconds
// ---------------------------------------------------------------------------

/// Initial re-send period for the client's Request.
pub const REQUEST_BACKOFF_FIRST: i64 = 1_000_000_000;
/// Request re-send period backs off every 10 s.
pub const REQUEST_BACKOFF_FREQ: i64 = 10_000_000_000;
/// Request re-sends quit after 30 s (shorter than the RFC recommendation).
pub const REQUEST_BACKOFF_TIMEOUT: i64 = 30_000_000_000;

/// Timeout in RESPOND.
pub const RESPOND_TIMEOUT: i64 = 30_000_000_000;
/// Timeout in LISTEN.
pub const LISTEN_TIMEOUT: i64 = REQUEST_BACKOFF_TIMEOUT;

/// Maximum segment lifetime; the RFC suggests 2 minutes.
pub const MSL: i64 = 120_000_000_000;

/// Back-off cadence of the CLOSING timer, RFC 4340 §8.3.
pub const CLOSING_BACKOFF_FREQ: i64 = 64_000_000_000;
/// Maximum time in CLOSING (the RFC recommends MSL, which seems too long).
pub const CLOSING_BACKOFF_TIMEOUT: i64 = MSL / 4;

/// Time spent in TIMEWAIT; §8.3 recommends 2×MSL.
pub const TIMEWAIT_TIMEOUT: i64 = MSL / 2;

/// Ack re-send cadence in PARTOPEN, RFC 4340 §8.1.5.
pub const PARTOPEN_BACKOFF_FIRST: i64 = 200_000_000;
pub const PARTOPEN_BACKOFF_FREQ: i64 = 200_000_000;
/// 30 s (§8.1.5 recommends 8 minutes).
pub const PARTOPEN_BACKOFF_TIMEOUT: i64 = 30_000_000_000;

/// Poll interval for the LISTEN/RESPOND expiration predicates.
pub const EXPIRE_INTERVAL: i64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// CCID lifecycle
// ---------------------------------------------------------------------------

pub(crate) fn open_ccid(conn: &Arc<Conn>, g: &mut Inner) {
    if g.ccid_open {
        return;
    }
    conn.scc.open();
    conn.rcc.open();
    g.ccid_open = true;
    log::debug!("[conn] ccid open");
}

pub(crate) fn close_ccid(conn: &Arc<Conn>, g: &mut Inner) {
    if !g.ccid_open {
        return;
    }
    conn.scc.close();
    conn.rcc.close();
    g.ccid_open = false;
    log::debug!("[conn] ccid close");
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

pub(crate) fn goto_listen(conn: &Arc<Conn>, g: &mut Inner) {
    g.socket.set_server(true);
    g.socket.set_state(State::Listen);
    conn.emit_state(g);

    let watcher = Arc::clone(conn);
    let on_timeout = Arc::clone(conn);
    conn.env.expire(
        move || watcher.state() != State::Listen,
        move || on_timeout.abort_quietly(),
        LISTEN_TIMEOUT,
        EXPIRE_INTERVAL,
        "goto-listen",
    );
}

pub(crate) fn goto_request(conn: &Arc<Conn>, g: &mut Inner, service_code: u32) {
    g.socket.set_server(false);
    g.socket.set_state(State::Request);
    conn.emit_state(g);
    g.socket.set_service_code(service_code);
    let iss = g.socket.choose_iss();
    g.socket.set_gar(iss);
    g.request_time = Some(conn.env.now());
    conn.inject(Some(WriteEnvelope::request(service_code)));

    // Re-send the Request with exponential back-off until answered.
    let c = Arc::clone(conn);
    let env = conn.env.clone();
    conn.env.go("goto-request", async move {
        let mut b = BackOff::new(
            env,
            REQUEST_BACKOFF_FIRST,
            REQUEST_BACKOFF_TIMEOUT,
            REQUEST_BACKOFF_FREQ,
        );
        loop {
            let slept = b.sleep().await;
            if c.state() != State::Request {
                break;
            }
            match slept {
                None => {
                    // Back-off exhausted with no Response.
                    c.abort();
                    break;
                }
                Some(_) => {
                    log::debug!("[conn] request resend");
                    c.inject(Some(WriteEnvelope::request(service_code)));
                }
            }
        }
    });
}

pub(crate) fn goto_respond(conn: &Arc<Conn>, g: &mut Inner, service_code: u32, seqno: i64) {
    g.socket.set_state(State::Respond);
    conn.emit_state(g);
    let iss = g.socket.choose_iss();
    g.socket.set_gar(iss);
    g.socket.set_isr(seqno);
    g.socket.set_gsr(seqno);
    g.socket.set_service_code(service_code);

    let watcher = Arc::clone(conn);
    let on_timeout = Arc::clone(conn);
    conn.env.expire(
        move || watcher.state() != State::Respond,
        move || on_timeout.abort_quietly(),
        RESPOND_TIMEOUT,
        EXPIRE_INTERVAL,
        "goto-respond",
    );
}

pub(crate) fn goto_partopen(conn: &Arc<Conn>, g: &mut Inner) {
    g.socket.set_state(State::PartOpen);
    conn.emit_state(g);
    open_ccid(conn, g);
    // Unblock the writer so it observes the state change.
    conn.inject(None);

    // Ack re-send timer, RFC 4340 §8.1.5.
    let c = Arc::clone(conn);
    let env = conn.env.clone();
    conn.env.go("goto-partopen", async move {
        let mut b = BackOff::new(
            env,
            PARTOPEN_BACKOFF_FIRST,
            PARTOPEN_BACKOFF_TIMEOUT,
            PARTOPEN_BACKOFF_FREQ,
        );
        loop {
            let slept = b.sleep().await;
            if c.state() != State::PartOpen {
                break;
            }
            match slept {
                None => {
                    c.abort();
                    break;
                }
                Some(_) => {
                    log::debug!("[conn] partopen ack resend");
                    c.inject(Some(WriteEnvelope::ack()));
                }
            }
        }
    });
}

pub(crate) fn goto_open(conn: &Arc<Conn>, g: &mut Inner, seqno: i64) {
    g.socket.set_osr(seqno);
    g.socket.set_state(State::Open);
    conn.emit_state(g);
    open_ccid(conn, g);
    conn.inject(None);
}

pub(crate) fn goto_closing(conn: &Arc<Conn>, g: &mut Inner) {
    conn.set_error(Error::Eof);
    conn.teardown_user();
    g.socket.set_state(State::Closing);
    conn.emit_state(g);
    close_ccid(conn, g);

    let rtt = g.socket.rtt();
    let c = Arc::clone(conn);
    let env = conn.env.clone();
    conn.env.go("goto-closing", async move {
        log::debug!("[conn] closing rtt={rtt}ns");
        let mut b = BackOff::new(env, 2 * rtt, CLOSING_BACKOFF_TIMEOUT, CLOSING_BACKOFF_FREQ);
        loop {
            let slept = b.sleep().await;
            if c.state() != State::Closing {
                break;
            }
            match slept {
                None => {
                    // Give up on a Reset ever arriving; the quiet period
                    // starts now.  Re-check the state under the lock: a
                    // concurrent transition wins.
                    let mut g = c.inner.lock().unwrap();
                    if g.socket.state() == State::Closing {
                        goto_timewait(&c, &mut g);
                    }
                    break;
                }
                Some(_) => {
                    log::debug!("[conn] close resend");
                    c.inject(Some(WriteEnvelope::close()));
                }
            }
        }
    });
}

pub(crate) fn goto_timewait(conn: &Arc<Conn>, g: &mut Inner) {
    conn.set_error(Error::Eof);
    conn.teardown_user();
    g.socket.set_state(State::TimeWait);
    conn.emit_state(g);
    close_ccid(conn, g);

    let c = Arc::clone(conn);
    let env = conn.env.clone();
    conn.env.go("goto-timewait", async move {
        env.sleep(TIMEWAIT_TIMEOUT).await;
        c.abort_quietly();
    });
}

/// Must stay idempotent: it is reachable from the reader, the writer and
/// every timer task.
pub(crate) fn goto_closed(conn: &Arc<Conn>, g: &mut Inner) {
    if g.socket.state() == State::Closed {
        return;
    }
    g.socket.set_state(State::Closed);
    conn.emit_state(g);
    conn.set_error(Error::Abort);
    conn.teardown_user();
    conn.teardown_write_loop();
    close_ccid(conn, g);
}
