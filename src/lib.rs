//! `dccp-over-udp` — the Datagram Congestion Control Protocol (RFC 4340)
//! in user space, layered over an unreliable packet link.
//!
//! DCCP is connection-oriented, congestion-controlled and deliberately
//! unreliable: datagrams may vanish, but their rate is governed.  The crate
//! centres on the connection engine — a nine-state protocol machine, its
//! packet-driven read loop, a priority write pipeline and an exponential
//! back-off timer family — all written against a swappable clock so the
//! whole protocol can be tested in virtual time.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ write_segment / read_segment
//!  ┌───▼──────────────────────────────┐
//!  │            Conn                  │  state machine, timers,
//!  │  (reader · writer · goto_*)      │  congestion-control seam
//!  └───┬──────────────────────────────┘
//!      │ headers                 ┌─────────────┐
//!  ┌───▼───────┐   labelled      │  Runtime    │ wall clock or
//!  │    Mux    │   flows         │  (Env)      │ synthetic time
//!  └───┬───────┘                 └─────────────┘
//!      │ raw datagrams
//!  ┌───▼───────┐
//!  │   Link    │  UDP socket or in-process channel pipe
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`runtime`]     — clock/sleep/spawn capability and the `Env` handle
//! - [`synthetic`]   — virtual-time scheduler for deterministic tests
//! - [`mono`]        — strictly non-regressing clock wrapper
//! - [`backoff`]     — geometric retransmission timer
//! - [`link`]        — datagram carrier contract (UDP, channel pipe)
//! - [`mux`]         — labelled flow multiplexing over one link
//! - [`header`]      — wire format (serialise / deserialise)
//! - [`options`]     — header options and direction partitioning
//! - [`state`]       — finite-state-machine types and the socket record
//! - [`ccid`]        — congestion-control seam and stand-in modules
//! - [`conn`]        — per-connection lifecycle and read path
//! - [`writer`]      — write envelopes and the three-phase writer
//! - [`transitions`] — `goto_*` functions and protocol timing constants

pub mod backoff;
pub mod ccid;
pub mod conn;
pub mod error;
pub mod header;
pub mod link;
pub mod mono;
pub mod mux;
pub mod options;
pub mod runtime;
pub mod state;
pub mod synthetic;
pub mod transitions;
pub mod writer;

pub use conn::{Conn, HeaderConn};
pub use error::{Error, Result};
pub use runtime::Env;
