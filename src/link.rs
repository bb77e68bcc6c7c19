//! Datagram carrier abstraction.
//!
//! A [`Link`] moves opaque datagrams between two endpoints with an MTU and no
//! delivery guarantees.  Everything above it — the flow multiplexer, the
//! header codec, the connection engine — is link-agnostic.  Two concretes:
//!
//! - [`UdpLink`] — thin wrapper around `tokio::net::UdpSocket`; the real
//!   transport.
//! - [`ChanLink`] — one side of an in-process channel pair from
//!   [`ChanPipe::new`]; the deterministic transport used by protocol tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::runtime::BoxFuture;

/// Datagram link contract.  `recv_from` blocks until a datagram arrives or
/// the link dies (`Io`); sends on a locally closed link fail with `Bad`;
/// `close` is idempotent.
pub trait Link: Send + Sync + 'static {
    /// Largest datagram this link can carry.
    fn mtu(&self) -> usize;

    /// Next inbound datagram and, when the link is addressed, its origin.
    fn recv_from(&self) -> BoxFuture<Result<(Vec<u8>, Option<SocketAddr>)>>;

    /// Send one datagram.  `addr` is required on addressed links and ignored
    /// on point-to-point ones.
    fn send_to(&self, datagram: Vec<u8>, addr: Option<SocketAddr>) -> BoxFuture<Result<usize>>;

    /// Stop the outbound side.  Safe to call more than once.
    fn close(&self);
}

const LINK_MTU: usize = 1500;

// ---------------------------------------------------------------------------
// UdpLink
// ---------------------------------------------------------------------------

/// A UDP socket as a [`Link`].
pub struct UdpLink {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    closed: Mutex<bool>,
}

impl UdpLink {
    /// Bind to `local_addr`; `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self> {
        let inner = UdpSocket::bind(local_addr).await.map_err(|e| {
            log::debug!("[link] udp bind {local_addr} failed: {e}");
            Error::Io
        })?;
        let local_addr = inner.local_addr().map_err(|_| Error::Io)?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            closed: Mutex::new(false),
        })
    }
}

impl Link for UdpLink {
    fn mtu(&self) -> usize {
        LINK_MTU
    }

    fn recv_from(&self) -> BoxFuture<Result<(Vec<u8>, Option<SocketAddr>)>> {
        let sock = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut buf = vec![0u8; LINK_MTU];
            let (n, addr) = sock.recv_from(&mut buf).await.map_err(|e| {
                log::debug!("[link] udp recv failed: {e}");
                Error::Io
            })?;
            buf.truncate(n);
            Ok((buf, Some(addr)))
        })
    }

    fn send_to(&self, datagram: Vec<u8>, addr: Option<SocketAddr>) -> BoxFuture<Result<usize>> {
        if *self.closed.lock().unwrap() {
            return Box::pin(async { Err(Error::Bad) });
        }
        let sock = Arc::clone(&self.inner);
        Box::pin(async move {
            let addr = addr.ok_or(Error::Bad)?;
            sock.send_to(&datagram, addr).await.map_err(|e| {
                log::debug!("[link] udp send failed: {e}");
                Error::Io
            })
        })
    }

    fn close(&self) {
        // The socket itself closes on drop; just refuse further sends.
        *self.closed.lock().unwrap() = true;
    }
}

// ---------------------------------------------------------------------------
// ChanLink / ChanPipe
// ---------------------------------------------------------------------------

/// One side of an in-process datagram pipe.
///
/// Closing a side stops its outbound direction: the peer's pending and future
/// reads fail with [`Error::Io`], while this side can keep reading whatever
/// the peer still sends.  Read deadlines are not supported.
pub struct ChanLink {
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// Constructor of crossed [`ChanLink`] pairs.
pub struct ChanPipe;

impl ChanPipe {
    /// A connected pair: datagrams written to one side are read on the other.
    pub fn new() -> (ChanLink, ChanLink) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            ChanLink {
                inbound: Arc::new(tokio::sync::Mutex::new(rx_a)),
                outbound: Mutex::new(Some(tx_b)),
            },
            ChanLink {
                inbound: Arc::new(tokio::sync::Mutex::new(rx_b)),
                outbound: Mutex::new(Some(tx_a)),
            },
        )
    }
}

impl Link for ChanLink {
    fn mtu(&self) -> usize {
        LINK_MTU
    }

    fn recv_from(&self) -> BoxFuture<Result<(Vec<u8>, Option<SocketAddr>)>> {
        let inbound = Arc::clone(&self.inbound);
        Box::pin(async move {
            let mut rx = inbound.lock().await;
            match rx.recv().await {
                Some(datagram) => Ok((datagram, None)),
                None => Err(Error::Io),
            }
        })
    }

    fn send_to(&self, datagram: Vec<u8>, _addr: Option<SocketAddr>) -> BoxFuture<Result<usize>> {
        let out = self.outbound.lock().unwrap().clone();
        Box::pin(async move {
            match out {
                None => Err(Error::Bad),
                Some(tx) => {
                    let n = datagram.len();
                    tx.send(datagram).map_err(|_| Error::Io)?;
                    Ok(n)
                }
            }
        })
    }

    fn close(&self) {
        // Dropping the sender closes the peer's inbound stream.
        self.outbound.lock().unwrap().take();
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipe_carries_datagrams_both_ways() {
        let (a, b) = ChanPipe::new();
        a.send_to(vec![1, 2, 3], None).await.unwrap();
        b.send_to(vec![9], None).await.unwrap();

        let (got, addr) = b.recv_from().await.unwrap();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(addr.is_none());
        let (got, _) = a.recv_from().await.unwrap();
        assert_eq!(got, vec![9]);
    }

    #[tokio::test]
    async fn read_fails_after_peer_close() {
        let (a, b) = ChanPipe::new();
        a.send_to(vec![7], None).await.unwrap();
        a.close();
        a.close(); // idempotent

        // Buffered datagram still delivered, then Io.
        assert_eq!(b.recv_from().await.unwrap().0, vec![7]);
        assert_eq!(b.recv_from().await.unwrap_err(), Error::Io);
    }

    #[tokio::test]
    async fn send_fails_after_local_close() {
        let (a, _b) = ChanPipe::new();
        a.close();
        assert_eq!(a.send_to(vec![0], None).await.unwrap_err(), Error::Bad);
    }
}
