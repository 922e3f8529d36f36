//! Error types for the session layer.

use peerbridge_transport::ConnectionId;

use crate::SessionState;

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The presented secret was missing or did not match.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No session is tracked for the given connection.
    #[error("no session for {0}")]
    NotFound(ConnectionId),

    /// The connection already has an established session.
    #[error("{0} already has an established session")]
    AlreadyEstablished(ConnectionId),

    /// The state machine does not allow this move.
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}
