//! Error types for the peerbridge framework.

use peerbridge_protocol::ProtocolError;
use peerbridge_session::SessionError;
use peerbridge_transport::{ConnectionId, TransportError};

/// Errors returned synchronously by [`Endpoint`](crate::Endpoint)
/// operations.
///
/// Everything else that can go wrong on a connection (timeouts, protocol
/// violations, malformed input) is reported to the endpoint's
/// [`Manager`](crate::Manager) instead.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The endpoint is closed and can no longer send.
    #[error("endpoint {0} is unavailable")]
    Unavailable(ConnectionId),

    /// A protocol with this name is already registered or started.
    #[error("protocol {0} is already running")]
    ProtocolAlreadyRunning(String),

    /// The operation needs a protocol that is not running.
    #[error("protocol {0} is not running")]
    ProtocolNotRunning(String),

    /// The envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum PeerbridgeError {
    /// A transport-level error (bind, dial, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (auth, state transition).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An endpoint operation failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The client gave up reconnecting.
    #[error("gave up after {attempts} failed connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// The client has no open endpoint.
    #[error("not connected")]
    NotConnected,

    /// The manager has been shut down.
    #[error("manager is shut down")]
    Shutdown,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
