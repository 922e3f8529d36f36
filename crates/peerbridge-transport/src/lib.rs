//! Transport layer for peerbridge.
//!
//! Turns raw bidirectional byte streams into newline-delimited frames.
//! A [`Connection`] owns one stream and splits into a [`LineReader`] (the
//! receive side, consumed by an endpoint's pump) and a [`LineWriter`] (the
//! send side, owned by a single writer task so frames never interleave).
//!
//! - [`TcpTransport`] accepts inbound TCP connections.
//! - [`TcpDialer`] opens outbound ones; the [`Dialer`] trait lets callers
//!   substitute their own (tests use it to script refusals).
//! - [`Connection::in_memory_pair`] builds a connected pair without sockets.

mod connection;
mod error;
mod tcp;

pub use connection::{Connection, LineReader, LineWriter, MAX_FRAME_BYTES};
pub use error::TransportError;
pub use tcp::{TcpDialer, TcpTransport};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Connection, Self::Error>> + Send;

    /// The address the transport is listening on.
    fn local_addr(&self) -> SocketAddr;
}

/// Opens outbound connections.
///
/// The returned future must be `Send` because connection loops run on
/// spawned tasks.
pub trait Dialer: Send + Sync + 'static {
    /// Connects to `host:port`.
    ///
    /// # Errors
    /// - [`TransportError::UnknownHost`] if `host` cannot be resolved
    ///   (fatal, see [`TransportError::is_fatal`])
    /// - [`TransportError::ConnectFailed`] for refused or failed dials
    fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Connection, TransportError>> + Send;
}
