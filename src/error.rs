//! User-visible error taxonomy.
//!
//! Connections terminate with exactly one of these; the first terminal error
//! recorded on a connection sticks and is what every later user call returns.

use thiserror::Error;

/// Errors surfaced by links, flows and connections.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Peer closed the connection gracefully.
    #[error("end of file")]
    Eof,
    /// Connection was reset or timed out.
    #[error("connection aborted")]
    Abort,
    /// The underlying link failed or was closed mid-operation.
    #[error("i/o error")]
    Io,
    /// Operation on a closed or never-opened object.
    #[error("bad state")]
    Bad,
    /// A datagram or header could not be decoded.
    #[error("malformed packet")]
    Malformed,
    /// Payload exceeds what a single datagram can carry.
    #[error("payload too large")]
    Oversize,
}

pub type Result<T> = std::result::Result<T, Error>;
