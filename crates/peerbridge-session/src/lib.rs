//! Session management for peerbridge.
//!
//! Every connection must establish a session before any other protocol
//! may run on it. This crate holds the pieces of that policy that do not
//! depend on an endpoint:
//!
//! 1. **State**: the per-connection [`SessionState`] machine
//! 2. **Authentication**: checking the optional shared secret
//!    ([`Authenticator`], [`SharedSecret`], [`OpenAccess`])
//! 3. **Tracking**: the server's table of sessions by connection
//!    ([`SessionTable`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Managers / SessionProtocol (above)  ← drive the state machine
//!     ↕
//! Session Layer (this crate)
//!     ↕
//! Transport Layer (below)  ← provides ConnectionId
//! ```

mod auth;
mod error;
mod state;
mod table;

pub use auth::{Authenticator, OpenAccess, SharedSecret, authenticator_for};
pub use error::SessionError;
pub use state::{SessionConfig, SessionState};
pub use table::{Session, SessionTable, generate_session_id};
