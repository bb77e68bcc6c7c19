//! Per-connection engine.
//!
//! A [`Conn`] owns one DCCP connection over one multiplexer flow:
//!
//! ```text
//!           read loop ──▶ process() ──▶ goto_* transitions
//!               ▲              │              │ spawn
//!  HeaderConn ──┘              ▼              ▼
//!      ▲              socket record      timer tasks
//!      │              (one mutex)             │ inject
//!      └── writer ◀── control/data conduits ◀─┘
//! ```
//!
//! Three task families share the record: the read loop (packet intake and
//! transitions), the writer (see [`crate::writer`]) and one timer task per
//! timed state (see [`crate::transitions`]).  The mutex is never held across
//! link I/O or a strobe.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::ccid::{FeedbackHeader, ReceiverCongestionControl, SenderCongestionControl};
use crate::error::{Error, Result};
use crate::header::{Header, PacketType, RESET_CLOSED, RESET_SEQUENCE};
use crate::mux::Flow;
use crate::runtime::Env;
use crate::state::{Socket, State};
use crate::transitions;
use crate::writer::{self, WriteEnvelope, WriteItem};

/// Control-conduit depth; injection never blocks, overflow drops.
const CONTROL_BUF: usize = 32;
/// Data-conduit depth; user writes block here before the connection opens.
const DATA_BUF: usize = 32;
/// Inbound datagrams buffered for a slow application before dropping.
const APP_BUF: usize = 32;

/// Headroom reserved for the encoded header and its options inside one
/// flow datagram.
const HEADER_ALLOWANCE: usize = 48;

// ---------------------------------------------------------------------------
// HeaderConn
// ---------------------------------------------------------------------------

/// A flow that speaks [`Header`] instead of raw bytes.
pub struct HeaderConn {
    flow: Flow,
}

impl HeaderConn {
    pub fn new(flow: Flow) -> Self {
        Self { flow }
    }

    pub fn payload_mtu(&self) -> usize {
        self.flow.payload_mtu()
    }

    /// Next decoded header.  `Malformed` marks one bad datagram; any other
    /// error means the flow is dead.
    pub async fn read(&self) -> Result<Header> {
        let datagram = self.flow.read().await?;
        Header::decode(&datagram)
    }

    pub async fn write(&self, h: &Header) -> Result<()> {
        let wire = h.encode()?;
        if wire.len() > self.flow.payload_mtu() {
            return Err(Error::Oversize);
        }
        self.flow.write(&wire).await?;
        Ok(())
    }

    pub fn close(&self) {
        self.flow.close()
    }
}

// ---------------------------------------------------------------------------
// Conn
// ---------------------------------------------------------------------------

/// Fields guarded by the connection mutex.
pub(crate) struct Inner {
    pub(crate) socket: Socket,
    pub(crate) ccid_open: bool,
    /// When the Request went out, for the handshake round-trip sample.
    pub(crate) request_time: Option<i64>,
}

/// One DCCP connection.  Cheap to share: every loop and timer holds an `Arc`.
pub struct Conn {
    pub(crate) env: Env,
    pub(crate) hc: HeaderConn,
    pub(crate) scc: Arc<dyn SenderCongestionControl>,
    pub(crate) rcc: Arc<dyn ReceiverCongestionControl>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) write_non_data: Mutex<Option<mpsc::Sender<WriteItem>>>,
    write_data: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    read_app_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    read_app_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    err: Mutex<Option<Error>>,
}

impl Conn {
    fn build(
        env: &Env,
        hc: HeaderConn,
        scc: Arc<dyn SenderCongestionControl>,
        rcc: Arc<dyn ReceiverCongestionControl>,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUF);
        let (data_tx, data_rx) = mpsc::channel(DATA_BUF);
        let (app_tx, app_rx) = mpsc::channel(APP_BUF);

        let conn = Arc::new(Self {
            env: env.clone(),
            hc,
            scc,
            rcc,
            inner: Mutex::new(Inner {
                socket: Socket::new(),
                ccid_open: false,
                request_time: None,
            }),
            write_non_data: Mutex::new(Some(control_tx)),
            write_data: Mutex::new(Some(data_tx)),
            read_app_tx: Mutex::new(Some(app_tx)),
            read_app_rx: tokio::sync::Mutex::new(app_rx),
            err: Mutex::new(None),
        });

        env.go(
            "conn-writer",
            writer::write_loop(Arc::clone(&conn), control_rx, data_rx),
        );
        let reader = Arc::clone(&conn);
        env.go("conn-reader", async move { reader.read_loop().await });
        conn
    }

    /// Active open: enter REQUEST and start soliciting `service_code`.
    pub fn client(
        env: &Env,
        hc: HeaderConn,
        scc: Arc<dyn SenderCongestionControl>,
        rcc: Arc<dyn ReceiverCongestionControl>,
        service_code: u32,
    ) -> Arc<Self> {
        let conn = Self::build(env, hc, scc, rcc);
        {
            let mut g = conn.inner.lock().unwrap();
            transitions::goto_request(&conn, &mut g, service_code);
        }
        conn
    }

    /// Passive open: enter LISTEN and wait for a Request.
    pub fn server(
        env: &Env,
        hc: HeaderConn,
        scc: Arc<dyn SenderCongestionControl>,
        rcc: Arc<dyn ReceiverCongestionControl>,
    ) -> Arc<Self> {
        let conn = Self::build(env, hc, scc, rcc);
        {
            let mut g = conn.inner.lock().unwrap();
            transitions::goto_listen(&conn, &mut g);
        }
        conn
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().socket.state()
    }

    /// The terminal error, once one is recorded.
    pub fn error(&self) -> Option<Error> {
        *self.err.lock().unwrap()
    }

    /// Record the terminal error.  The first one sticks.
    pub(crate) fn set_error(&self, e: Error) {
        let mut err = self.err.lock().unwrap();
        if err.is_none() {
            *err = Some(e);
        }
    }

    pub(crate) fn emit_state(&self, g: &Inner) {
        log::debug!(
            "[conn] {} state → {}",
            if g.socket.is_server() { "server" } else { "client" },
            g.socket.state()
        );
    }

    /// Largest payload accepted by [`write_segment`](Self::write_segment).
    pub fn payload_mtu(&self) -> usize {
        self.hc.payload_mtu().saturating_sub(HEADER_ALLOWANCE)
    }

    // -----------------------------------------------------------------------
    // User API
    // -----------------------------------------------------------------------

    /// Queue one datagram payload for congestion-controlled, unreliable
    /// delivery.  Blocks while the connection has not opened yet.
    pub async fn write_segment(&self, data: Vec<u8>) -> Result<()> {
        if data.len() > self.payload_mtu() {
            return Err(Error::Oversize);
        }
        let tx = self.write_data.lock().unwrap().as_ref().cloned();
        match tx {
            None => Err(self.error().unwrap_or(Error::Bad)),
            Some(tx) => tx
                .send(data)
                .await
                .map_err(|_| self.error().unwrap_or(Error::Bad)),
        }
    }

    /// Next inbound datagram payload.  After teardown, yields the terminal
    /// error: `Eof` for a graceful close, `Abort` for a reset or timeout.
    pub async fn read_segment(&self) -> Result<Vec<u8>> {
        let mut rx = self.read_app_rx.lock().await;
        match rx.recv().await {
            Some(payload) => Ok(payload),
            None => Err(self.error().unwrap_or(Error::Eof)),
        }
    }

    /// Graceful close: drain, retransmit Close, quiet period, gone.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        match g.socket.state() {
            State::Closed => Err(Error::Bad),
            State::Closing | State::TimeWait => Ok(()),
            State::Open | State::PartOpen => {
                self.inject(Some(WriteEnvelope::close()));
                transitions::goto_closing(self, &mut g);
                Ok(())
            }
            // Nothing established to drain; tell the peer and go away.
            State::Listen | State::Request | State::Respond => {
                self.inject(Some(WriteEnvelope::reset(RESET_CLOSED, None)));
                transitions::goto_closed(self, &mut g);
                Ok(())
            }
        }
    }

    /// Teardown with a Reset on the wire.  Idempotent.
    pub fn abort(self: &Arc<Self>) {
        let mut g = self.inner.lock().unwrap();
        if g.socket.state() != State::Closed {
            log::debug!("[conn] abort");
            self.inject(Some(WriteEnvelope::reset(
                crate::header::RESET_ABORTED,
                None,
            )));
        }
        transitions::goto_closed(self, &mut g);
    }

    /// Teardown without telling the peer.  Idempotent.
    pub fn abort_quietly(self: &Arc<Self>) {
        let mut g = self.inner.lock().unwrap();
        transitions::goto_closed(self, &mut g);
    }

    // -----------------------------------------------------------------------
    // Teardown plumbing
    // -----------------------------------------------------------------------

    /// Detach the application: no more reads or writes.
    pub(crate) fn teardown_user(&self) {
        self.read_app_tx.lock().unwrap().take();
        self.write_data.lock().unwrap().take();
    }

    /// Close the control conduit; the writer drains what is buffered — the
    /// farewell Reset included — and exits.
    pub(crate) fn teardown_write_loop(&self) {
        self.write_non_data.lock().unwrap().take();
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.hc.read().await {
                Ok(h) => self.process(h),
                Err(Error::Malformed) => {
                    log::debug!("[conn] dropping malformed packet");
                }
                Err(e) => {
                    log::debug!("[conn] read loop exit: {e}");
                    self.abort_quietly();
                    return;
                }
            }
        }
    }

    /// Dispatch one inbound header.  All socket mutation and every `goto_*`
    /// happens under the lock taken here.
    fn process(self: &Arc<Self>, h: Header) {
        let now = self.env.now();
        let mut g = self.inner.lock().unwrap();
        let state = g.socket.state();
        log::trace!(
            "[conn] ← {} seq={} ack={} in {}",
            h.ptype,
            h.seqno,
            h.ackno,
            state
        );

        match state {
            State::Closed => {}

            State::Listen => {
                if h.ptype == PacketType::Request {
                    transitions::goto_respond(self, &mut g, h.service_code, h.seqno);
                    self.inject(Some(WriteEnvelope::response(g.socket.service_code())));
                }
            }

            State::Request => match h.ptype {
                PacketType::Response => {
                    g.socket.set_isr(h.seqno);
                    g.socket.set_gsr(h.seqno);
                    g.socket.update_gar(h.ackno);
                    if let Some(t0) = g.request_time.take() {
                        g.socket.set_rtt(now - t0);
                    }
                    transitions::goto_partopen(self, &mut g);
                    self.inject(Some(WriteEnvelope::ack()));
                }
                PacketType::Reset => transitions::goto_closed(self, &mut g),
                _ => {}
            },

            State::Respond => match h.ptype {
                // The client did not hear our Response yet.
                PacketType::Request => {
                    g.socket.update_gsr(h.seqno);
                    self.inject(Some(WriteEnvelope::response(g.socket.service_code())));
                }
                PacketType::Ack | PacketType::DataAck => {
                    g.socket.update_gsr(h.seqno);
                    g.socket.update_gar(h.ackno);
                    transitions::goto_open(self, &mut g, h.seqno);
                    // Answer so the client can leave PARTOPEN without
                    // waiting for application data.
                    self.inject(Some(WriteEnvelope::ack()));
                    if h.ptype.carries_data() {
                        self.feed_receiver(&h, now);
                        self.deliver(h.payload);
                    }
                }
                PacketType::Reset => transitions::goto_closed(self, &mut g),
                _ => {}
            },

            State::PartOpen => match h.ptype {
                // Our Ack has not reached the server yet.
                PacketType::Response => {
                    g.socket.update_gsr(h.seqno);
                    self.inject(Some(WriteEnvelope::ack()));
                }
                PacketType::Ack | PacketType::DataAck | PacketType::Data => {
                    g.socket.update_gsr(h.seqno);
                    if h.ptype.has_ackno() {
                        g.socket.update_gar(h.ackno);
                        self.feed_sender(&h, now);
                    }
                    transitions::goto_open(self, &mut g, h.seqno);
                    if h.ptype.carries_data() {
                        self.feed_receiver(&h, now);
                        self.deliver(h.payload);
                    }
                }
                PacketType::Sync => {
                    g.socket.update_gsr(h.seqno);
                    self.inject(Some(WriteEnvelope::sync_ack(h.seqno)));
                }
                PacketType::Reset => transitions::goto_closed(self, &mut g),
                _ => {}
            },

            State::Open => {
                if h.ptype == PacketType::Reset {
                    transitions::goto_closed(self, &mut g);
                    return;
                }
                if !g.socket.in_seq_window(h.seqno) {
                    log::debug!(
                        "[conn] seq {} outside window around gsr {}",
                        h.seqno,
                        g.socket.gsr()
                    );
                    self.inject(Some(WriteEnvelope::reset(RESET_SEQUENCE, Some(h.seqno))));
                    transitions::goto_closed(self, &mut g);
                    return;
                }
                g.socket.update_gsr(h.seqno);
                if h.ptype.has_ackno() {
                    g.socket.update_gar(h.ackno);
                    self.feed_sender(&h, now);
                }
                match h.ptype {
                    PacketType::Data | PacketType::DataAck => {
                        self.feed_receiver(&h, now);
                        self.deliver(h.payload);
                    }
                    PacketType::Close => {
                        self.inject(Some(WriteEnvelope::reset(RESET_CLOSED, Some(h.seqno))));
                        transitions::goto_timewait(self, &mut g);
                    }
                    PacketType::CloseReq => {
                        self.inject(Some(WriteEnvelope::close()));
                        transitions::goto_closing(self, &mut g);
                    }
                    PacketType::Sync => {
                        self.inject(Some(WriteEnvelope::sync_ack(h.seqno)));
                    }
                    _ => {}
                }
            }

            State::Closing => match h.ptype {
                PacketType::Reset => transitions::goto_timewait(self, &mut g),
                // Simultaneous close.
                PacketType::Close => {
                    self.inject(Some(WriteEnvelope::reset(RESET_CLOSED, Some(h.seqno))));
                    transitions::goto_timewait(self, &mut g);
                }
                _ => {}
            },

            State::TimeWait => {
                // A straggling Close still deserves its Reset.
                if h.ptype == PacketType::Close {
                    self.inject(Some(WriteEnvelope::reset(RESET_CLOSED, Some(h.seqno))));
                }
            }
        }
    }

    fn feed_sender(&self, h: &Header, now: i64) {
        self.scc.on_read(&FeedbackHeader {
            ptype: h.ptype,
            x: h.x,
            seqno: h.seqno,
            ackno: h.ackno,
            options: h.options.clone(),
            time_read: now,
        });
    }

    fn feed_receiver(&self, h: &Header, now: i64) {
        self.rcc.on_read(&FeedbackHeader {
            ptype: h.ptype,
            x: h.x,
            seqno: h.seqno,
            ackno: h.ackno,
            options: h.options.clone(),
            time_read: now,
        });
    }

    /// Hand a payload to the application.  The transport is unreliable;
    /// a full buffer means the datagram evaporates.
    fn deliver(&self, payload: Vec<u8>) {
        let guard = self.read_app_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if tx.try_send(payload).is_err() {
            log::debug!("[conn] slow reader, dropping datagram");
        }
    }
}
