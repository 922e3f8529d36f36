//! The session table: the server's record of every connection's session.
//!
//! # Concurrency note
//!
//! `SessionTable` is a plain `HashMap` wrapper with `&mut self` methods.
//! The server manager keeps it behind a single mutex and holds that lock
//! only for one call at a time.

use std::collections::HashMap;
use std::time::Instant;

use peerbridge_transport::ConnectionId;
use rand::Rng;

use crate::{SessionError, SessionState};

/// One connection's session as seen by the server.
#[derive(Debug, Clone)]
pub struct Session {
    /// The connection this session runs on.
    pub connection: ConnectionId,

    /// Id handed to the client in `SessionStartAck`. Set on establish.
    pub session_id: Option<String>,

    pub state: SessionState,

    /// When the session was established.
    pub started_at: Option<Instant>,
}

/// Tracks sessions by connection.
///
/// ## Lifecycle
///
/// ```text
/// insert_pending() ──→ establish() ──→ stop() ──→ remove()
///   [AwaitingPeer]      [Established]   [Stopped]
/// ```
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a connection whose session has not been opened yet.
    ///
    /// Replaces any stale entry for the same connection.
    pub fn insert_pending(&mut self, connection: ConnectionId) {
        self.sessions.insert(
            connection,
            Session {
                connection,
                session_id: None,
                state: SessionState::AwaitingPeer,
                started_at: None,
            },
        );
    }

    /// Marks the connection's session as established under `session_id`.
    ///
    /// A connection that was never inserted is tracked from here on.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyEstablished`] if it already is
    /// - [`SessionError::InvalidTransition`] if the session was stopped
    pub fn establish(
        &mut self,
        connection: ConnectionId,
        session_id: String,
    ) -> Result<&Session, SessionError> {
        let session = self.sessions.entry(connection).or_insert_with(|| Session {
            connection,
            session_id: None,
            state: SessionState::AwaitingPeer,
            started_at: None,
        });

        if session.state.is_established() {
            return Err(SessionError::AlreadyEstablished(connection));
        }
        session.state = session.state.transition(SessionState::Established)?;
        session.session_id = Some(session_id);
        session.started_at = Some(Instant::now());

        tracing::info!(%connection, "session established");
        Ok(session)
    }

    /// Marks the session stopped. Returns whether it had been established.
    ///
    /// Stopping an already stopped session is a no-op returning `false`.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the connection is not tracked.
    pub fn stop(&mut self, connection: ConnectionId) -> Result<bool, SessionError> {
        let session = self
            .sessions
            .get_mut(&connection)
            .ok_or(SessionError::NotFound(connection))?;

        let was_established = session.state.is_established();
        if session.state != SessionState::Stopped {
            session.state = SessionState::Stopped;
            tracing::debug!(%connection, was_established, "session stopped");
        }
        Ok(was_established)
    }

    /// Stops tracking the connection.
    pub fn remove(&mut self, connection: ConnectionId) -> Option<Session> {
        self.sessions.remove(&connection)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection)
    }

    pub fn is_established(&self, connection: ConnectionId) -> bool {
        self.sessions
            .get(&connection)
            .is_some_and(|s| s.state.is_established())
    }

    /// Connections with an established session, in id order.
    pub fn established_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.state.is_established())
            .map(|s| s.connection)
            .collect();
        ids.sort();
        ids
    }

    /// Number of tracked sessions (any state).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Generates a random 32-character hex session id (128 bits).
pub fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Tests
// =========================================================================
