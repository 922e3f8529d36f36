//! # Peerbridge
//!
//! Session-oriented peer-to-peer messaging over line-framed connections.
//!
//! Every connection is wrapped in an [`Endpoint`] that routes JSON
//! envelopes to the protocols registered on it: the session handshake,
//! keep-alive liveness checks, and named application events. Managers own
//! the policy around endpoints:
//!
//! - [`ServerManager`] accepts connections and tracks their sessions;
//! - [`ClientManager`] connects out and reconnects with bounded retries;
//! - [`PeerManager`] does both, sharing one timer service.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerbridge::prelude::*;
//!
//! # async fn run() -> Result<(), PeerbridgeError> {
//! let client = ClientManager::new("localhost", 3100, ManagerConfig::with_secret("s3cret"));
//! client.on(LifecycleKind::SessionStarted, |event| {
//!     event.endpoint().on("SHARING_BOARD", |args| println!("board: {args:?}"));
//! });
//! client.establish_connection().await
//! # }
//! ```

mod client;
mod config;
mod endpoint;
mod error;
mod events;
mod manager;
mod peer;
pub mod protocols;
mod server;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::ClientManager;
pub use config::{ManagerConfig, ReconnectPolicy};
pub use endpoint::Endpoint;
pub use error::{EndpointError, PeerbridgeError};
pub use events::{LifecycleEvent, LifecycleKind};
pub use manager::Manager;
pub use peer::PeerManager;
pub use protocols::{EventProtocol, KeepAliveProtocol, Protocol, RegisteredProtocol, Role, SessionProtocol};
pub use server::ServerManager;

pub use peerbridge_protocol as protocol;
pub use peerbridge_session as session;
pub use peerbridge_timer as timer;
pub use peerbridge_transport as transport;

/// Locks a mutex, recovering the data if a handler panicked while holding
/// it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub mod prelude {
    pub use crate::{
        ClientManager, Endpoint, EndpointError, LifecycleEvent, LifecycleKind, Manager,
        ManagerConfig, PeerManager, PeerbridgeError, ReconnectPolicy, ServerManager,
    };
    pub use crate::protocols::{Protocol, Role};
    pub use peerbridge_protocol::{Envelope, MessageKind, ProtocolKind};
    pub use peerbridge_session::{SessionConfig, SessionState};
    pub use peerbridge_timer::TimerService;
    pub use peerbridge_transport::{Connection, Dialer, TcpDialer};
}
