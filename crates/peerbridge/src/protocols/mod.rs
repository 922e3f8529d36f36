//! The protocol abstraction and the built-in protocols.
//!
//! A protocol is a small state machine that lives on one endpoint and
//! exchanges request/reply envelopes with its counterpart on the peer.
//! Several protocols share a connection; the endpoint routes each incoming
//! envelope to the protocol whose name it carries.
//!
//! Built-in protocols are held as concrete variants of
//! [`RegisteredProtocol`]; anything else goes through
//! [`RegisteredProtocol::Custom`].

mod event;
mod keepalive;
mod session;

pub use event::EventProtocol;
pub use keepalive::KeepAliveProtocol;
pub use session::SessionProtocol;

use std::sync::Arc;

use peerbridge_protocol::{Envelope, MessageKind};
use serde::Serialize;

use crate::{Endpoint, EndpointError};

/// Which side of the exchange a protocol instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that initiated the connection.
    Client,
    /// The side that accepted it.
    Server,
}

/// One protocol instance bound to one endpoint.
///
/// Receive methods run on the endpoint's pump, one envelope at a time.
/// Failures are reported to the endpoint's manager, never returned.
pub trait Protocol: Send + Sync + 'static {
    /// Wire name, matched against the envelope's `protocol` field.
    fn name(&self) -> &'static str;

    /// The endpoint this instance belongs to.
    fn endpoint(&self) -> &Endpoint;

    /// Begins the protocol on the connecting side.
    fn start_as_client(&self) -> Result<(), EndpointError>;

    /// Begins the protocol on the accepting side.
    fn start_as_server(&self) -> Result<(), EndpointError>;

    /// Stops the protocol. Must be idempotent and must not call back into
    /// the manager.
    fn stop_protocol(&self);

    fn receive_request(&self, msg: &Envelope);

    fn receive_reply(&self, msg: &Envelope);

    /// Sends a request envelope carrying `payload`.
    fn send_request<P: Serialize>(&self, payload: &P) -> Result<(), EndpointError>
    where
        Self: Sized,
    {
        let envelope = Envelope::new(self.name(), MessageKind::Request, payload)?;
        self.endpoint().send(&envelope)
    }

    /// Sends a reply envelope carrying `payload`.
    fn send_reply<P: Serialize>(&self, payload: &P) -> Result<(), EndpointError>
    where
        Self: Sized,
    {
        let envelope = Envelope::new(self.name(), MessageKind::Reply, payload)?;
        self.endpoint().send(&envelope)
    }

    /// Reports an unexpected or malformed message to the manager.
    fn report_violation(&self, detail: &str) {
        let endpoint = self.endpoint();
        tracing::warn!(
            endpoint = %endpoint.id(),
            protocol = self.name(),
            detail,
            "protocol violation"
        );
        endpoint.manager().protocol_violation(endpoint, self.name());
    }
}

/// A protocol as stored in an endpoint's registry.
#[derive(Clone)]
pub enum RegisteredProtocol {
    Session(Arc<SessionProtocol>),
    KeepAlive(Arc<KeepAliveProtocol>),
    Event(Arc<EventProtocol>),
    Custom(Arc<dyn Protocol>),
}

impl RegisteredProtocol {
    pub fn as_protocol(&self) -> &dyn Protocol {
        match self {
            Self::Session(p) => p.as_ref(),
            Self::KeepAlive(p) => p.as_ref(),
            Self::Event(p) => p.as_ref(),
            Self::Custom(p) => p.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.as_protocol().name()
    }
}

impl std::fmt::Debug for RegisteredProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RegisteredProtocol").field(&self.name()).finish()
    }
}

impl From<Arc<SessionProtocol>> for RegisteredProtocol {
    fn from(p: Arc<SessionProtocol>) -> Self {
        Self::Session(p)
    }
}

impl From<Arc<KeepAliveProtocol>> for RegisteredProtocol {
    fn from(p: Arc<KeepAliveProtocol>) -> Self {
        Self::KeepAlive(p)
    }
}

impl From<Arc<EventProtocol>> for RegisteredProtocol {
    fn from(p: Arc<EventProtocol>) -> Self {
        Self::Event(p)
    }
}

impl From<Arc<dyn Protocol>> for RegisteredProtocol {
    fn from(p: Arc<dyn Protocol>) -> Self {
        Self::Custom(p)
    }
}
