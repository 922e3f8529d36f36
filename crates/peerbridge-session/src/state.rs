//! Session state machine and configuration.

use std::fmt;
use std::time::Duration;

use crate::SessionError;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session establishment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shared secret a client must present. `None` accepts everyone.
    ///
    /// On the client side this is the secret sent in `SessionStart`.
    pub secret: Option<String>,

    /// How long either side waits for the other to start (or stop) a
    /// session before giving up on the endpoint.
    ///
    /// Default: 20 seconds.
    pub timeout: Duration,
}

impl SessionConfig {
    /// Default handshake timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Config that requires (or presents) the given secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Normalises the config: an empty secret means no secret, and a zero
    /// timeout falls back to the default.
    pub fn validated(mut self) -> Self {
        if self.secret.as_deref().is_some_and(str::is_empty) {
            self.secret = None;
        }
        if self.timeout.is_zero() {
            tracing::warn!(
                default = ?Self::DEFAULT_TIMEOUT,
                "session timeout of zero, using default"
            );
            self.timeout = Self::DEFAULT_TIMEOUT;
        }
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Where a connection is in its session lifecycle.
///
/// ```text
///   NotStarted ──(start)──→ AwaitingPeer ──(ack / accept)──→ Established
///        │                       │                               │
///        └───────────────────────┴──────────(stop)───────────────┴──→ Stopped
/// ```
///
/// `Stopped` is terminal: a stopped session is never restarted on the
/// same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    NotStarted,
    AwaitingPeer,
    Established,
    Stopped,
}

impl SessionState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NotStarted, AwaitingPeer)
                | (AwaitingPeer, Established)
                | (NotStarted | AwaitingPeer | Established, Stopped)
        )
    }

    /// Returns `next` if the move is allowed.
    ///
    /// # Errors
    /// [`SessionError::InvalidTransition`] otherwise.
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SessionError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_established(self) -> bool {
        self == SessionState::Established
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::AwaitingPeer => "awaiting-peer",
            Self::Established => "established",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
