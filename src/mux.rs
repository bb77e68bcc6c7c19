//! Labelled flow multiplexer.
//!
//! A [`Mux`] turns one datagram [`Link`] into many bidirectional flows.  Each
//! flow endpoint is named by an opaque fixed-width [`Label`]; every datagram
//! on the link is prefixed with a [`MuxMsg`] — the source and sink labels —
//! and routed on arrival:
//!
//! ```text
//!             ┌──────── dial() ───────▶ Flow (local label L, sink unknown)
//!   Link ◀──▶ Mux                          │  first datagrams carry sink=0
//!             └──────── accept() ──────▶ Flow (local label M, remote L)
//! ```
//!
//! A datagram whose sink matches a local flow is delivered there (teaching
//! the flow its peer's label and address).  A zero sink is first contact:
//! it routes to the flow already accepted for that source, or creates a new
//! one.  Anything else is dropped.
//!
//! Outbound payloads are fragmented at the link MTU minus the label prefix.
//! Reassembly is deliberately absent — flows carry datagrams, not streams.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::link::Link;
use crate::runtime::Env;

/// Encoded size of one label.
pub const LABEL_FOOTPRINT: usize = 8;

/// Encoded size of the per-datagram prefix.
pub const MUX_MSG_FOOTPRINT: usize = 2 * LABEL_FOOTPRINT;

const ACCEPT_BACKLOG: usize = 32;

// ---------------------------------------------------------------------------
// Label and MuxMsg
// ---------------------------------------------------------------------------

/// Fixed-width opaque flow-endpoint identifier.  The all-zero label is
/// reserved as the first-contact sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label([u8; LABEL_FOOTPRINT]);

impl Label {
    pub const ZERO: Label = Label([0; LABEL_FOOTPRINT]);

    /// A random, never-zero label.
    pub fn fresh() -> Self {
        loop {
            let l = Label(rand::random());
            if !l.is_zero() {
                return l;
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; LABEL_FOOTPRINT]
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    pub fn read(p: &[u8]) -> Result<(Label, usize)> {
        let b = p.get(..LABEL_FOOTPRINT).ok_or(Error::Malformed)?;
        let mut l = [0u8; LABEL_FOOTPRINT];
        l.copy_from_slice(b);
        Ok((Label(l), LABEL_FOOTPRINT))
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The source and sink labels of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxMsg {
    pub source: Label,
    pub sink: Label,
}

impl MuxMsg {
    pub fn write(&self, buf: &mut Vec<u8>) {
        self.source.write(buf);
        self.sink.write(buf);
    }

    pub fn read(p: &[u8]) -> Result<(MuxMsg, usize)> {
        let (source, n0) = Label::read(p)?;
        let (sink, n1) = Label::read(&p[n0..])?;
        Ok((MuxMsg { source, sink }, n0 + n1))
    }
}

// ---------------------------------------------------------------------------
// Mux
// ---------------------------------------------------------------------------

struct FlowEntry {
    shared: Arc<FlowShared>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct FlowTable {
    /// Local label → flow.
    by_local: HashMap<Label, FlowEntry>,
    /// Remote label → local label, for routing repeated first contacts.
    by_remote: HashMap<Label, Label>,
    closed: bool,
}

struct MuxInner {
    link: Arc<dyn Link>,
    table: Mutex<FlowTable>,
    accept_tx: Mutex<Option<mpsc::Sender<Flow>>>,
}

/// Flow multiplexer over one link.
pub struct Mux {
    inner: Arc<MuxInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Flow>>,
}

impl Mux {
    /// Wrap `link` and start the demux task.
    pub fn new(env: &Env, link: Arc<dyn Link>) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let inner = Arc::new(MuxInner {
            link,
            table: Mutex::new(FlowTable {
                by_local: HashMap::new(),
                by_remote: HashMap::new(),
                closed: false,
            }),
            accept_tx: Mutex::new(Some(accept_tx)),
        });
        let demux = Arc::clone(&inner);
        env.go("mux-demux", async move { demux_loop(demux).await });
        Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a flow towards `addr` (ignored on point-to-point links).  The
    /// peer's label is learned from its first reply.
    pub fn dial(&self, addr: Option<SocketAddr>) -> Result<Flow> {
        let mut table = self.inner.table.lock().unwrap();
        if table.closed {
            return Err(Error::Bad);
        }
        let flow = make_flow(&self.inner, &mut table, Label::fresh(), None, addr);
        log::debug!("[mux] dial local={}", flow.shared.local);
        Ok(flow)
    }

    /// Next inbound flow.  Fails with `Io` once the mux is closed.
    pub async fn accept(&self) -> Result<Flow> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(Error::Io)
    }

    /// Close the link and every flow.  Idempotent.
    pub fn close(&self) {
        close_inner(&self.inner);
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_inner(inner: &Arc<MuxInner>) {
    let mut table = inner.table.lock().unwrap();
    if table.closed {
        return;
    }
    table.closed = true;
    table.by_local.clear(); // dropping senders fails pending flow reads
    table.by_remote.clear();
    drop(table);
    inner.accept_tx.lock().unwrap().take();
    inner.link.close();
    log::debug!("[mux] closed");
}

fn make_flow(
    inner: &Arc<MuxInner>,
    table: &mut FlowTable,
    local: Label,
    remote: Option<Label>,
    addr: Option<SocketAddr>,
) -> Flow {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(FlowShared {
        local,
        remote: Mutex::new(remote),
        addr: Mutex::new(addr),
        mux: Arc::clone(inner),
    });
    if let Some(r) = remote {
        table.by_remote.insert(r, local);
    }
    table.by_local.insert(
        local,
        FlowEntry {
            shared: Arc::clone(&shared),
            inbound_tx,
        },
    );
    Flow {
        shared,
        inbound_rx: tokio::sync::Mutex::new(inbound_rx),
    }
}

// ---------------------------------------------------------------------------
// Demux loop
// ---------------------------------------------------------------------------

async fn demux_loop(inner: Arc<MuxInner>) {
    loop {
        let (datagram, addr) = match inner.link.recv_from().await {
            Ok(v) => v,
            Err(_) => {
                log::debug!("[mux] link down, stopping demux");
                close_inner(&inner);
                return;
            }
        };
        let (msg, n) = match MuxMsg::read(&datagram) {
            Ok(v) => v,
            Err(_) => {
                log::debug!("[mux] dropping runt datagram ({} bytes)", datagram.len());
                continue;
            }
        };
        let payload = datagram[n..].to_vec();

        let mut table = inner.table.lock().unwrap();
        if table.closed {
            return;
        }

        let hit = table
            .by_local
            .get(&msg.sink)
            .map(|e| (Arc::clone(&e.shared), e.inbound_tx.clone()));
        if let Some((shared, inbound_tx)) = hit {
            // Established direction; learn the peer on first sight.
            {
                let mut remote = shared.remote.lock().unwrap();
                if remote.is_none() {
                    *remote = Some(msg.source);
                    table.by_remote.insert(msg.source, msg.sink);
                    log::debug!("[mux] flow {} learned peer {}", msg.sink, msg.source);
                }
            }
            if addr.is_some() {
                *shared.addr.lock().unwrap() = addr;
            }
            let _ = inbound_tx.send(payload);
            continue;
        }

        if msg.sink.is_zero() {
            // First contact: route to the flow already accepted for this
            // source, or accept a new one.
            if let Some(local) = table.by_remote.get(&msg.source).copied() {
                if let Some(entry) = table.by_local.get(&local) {
                    let _ = entry.inbound_tx.send(payload);
                }
                continue;
            }
            let accept_tx = inner.accept_tx.lock().unwrap().clone();
            match accept_tx {
                None => log::debug!("[mux] not accepting, dropping first contact from {}", msg.source),
                Some(tx) => {
                    let flow = make_flow(&inner, &mut table, Label::fresh(), Some(msg.source), addr);
                    let local = flow.shared.local;
                    if let Some(entry) = table.by_local.get(&local) {
                        let _ = entry.inbound_tx.send(payload);
                    }
                    if tx.try_send(flow).is_err() {
                        log::debug!("[mux] accept backlog full, dropping flow from {}", msg.source);
                        table.by_local.remove(&local);
                        table.by_remote.remove(&msg.source);
                    } else {
                        log::debug!("[mux] accepted {} from {}", local, msg.source);
                    }
                }
            }
            continue;
        }

        log::debug!("[mux] no flow for sink {}, dropping", msg.sink);
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

struct FlowShared {
    local: Label,
    remote: Mutex<Option<Label>>,
    addr: Mutex<Option<SocketAddr>>,
    mux: Arc<MuxInner>,
}

/// One labelled datagram flow.
pub struct Flow {
    shared: Arc<FlowShared>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Flow {
    /// Largest payload one datagram can carry.
    pub fn payload_mtu(&self) -> usize {
        self.shared.mux.link.mtu() - MUX_MSG_FOOTPRINT
    }

    /// Next inbound datagram payload.  `Io` once the flow or mux is closed.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(Error::Io)
    }

    /// Send `buf`, fragmenting at the payload MTU.  Returns `buf.len()`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let msg = MuxMsg {
            source: self.shared.local,
            sink: self
                .shared
                .remote
                .lock()
                .unwrap()
                .unwrap_or(Label::ZERO),
        };
        let addr = *self.shared.addr.lock().unwrap();
        let chunk = self.payload_mtu().max(1);

        let mut sent = 0;
        let mut first = true;
        // An empty write still produces one (empty) datagram.
        while first || sent < buf.len() {
            first = false;
            let end = (sent + chunk).min(buf.len());
            let mut datagram = Vec::with_capacity(MUX_MSG_FOOTPRINT + end - sent);
            msg.write(&mut datagram);
            datagram.extend_from_slice(&buf[sent..end]);
            self.shared.mux.link.send_to(datagram, addr).await?;
            sent = end;
        }
        Ok(buf.len())
    }

    /// Detach from the mux; pending and future reads fail.  Idempotent.
    pub fn close(&self) {
        let mut table = self.shared.mux.table.lock().unwrap();
        table.by_local.remove(&self.shared.local);
        if let Some(r) = *self.shared.remote.lock().unwrap() {
            table.by_remote.remove(&r);
        }
        log::debug!("[mux] flow {} closed", self.shared.local);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
