//! The manager abstraction: policy for an endpoint's life cycle.
//!
//! Endpoints and protocols report everything that happens on a connection
//! to the endpoint's [`Manager`]. The defaults close the endpoint on every
//! failure; concrete managers layer session tracking, events, and
//! reconnection on top.

use std::sync::Arc;

use peerbridge_protocol::ProtocolKind;
use peerbridge_session::{Authenticator, OpenAccess};
use peerbridge_timer::TimerService;

use crate::config::ManagerConfig;
use crate::protocols::{EventProtocol, KeepAliveProtocol, RegisteredProtocol, SessionProtocol};
use crate::Endpoint;

/// Receives life-cycle callbacks from endpoints and their protocols.
///
/// Callbacks run on the endpoint's pump or on a timer task and must not
/// block.
pub trait Manager: Send + Sync + 'static {
    /// The endpoint's stream is ready; start the session protocol here.
    fn endpoint_ready(&self, endpoint: &Endpoint);

    /// The endpoint closed. Called exactly once, and never after
    /// [`endpoint_disconnected_abruptly`](Self::endpoint_disconnected_abruptly).
    fn endpoint_closed(&self, _endpoint: &Endpoint) {}

    /// The stream failed with an I/O error.
    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint) {
        endpoint.close();
    }

    /// The peer sent something that could not be decoded or routed.
    fn endpoint_sent_invalid_message(&self, endpoint: &Endpoint) {
        endpoint.close();
    }

    /// A protocol gave up waiting on the peer.
    fn endpoint_timed_out(&self, endpoint: &Endpoint, _protocol: &str) {
        endpoint.close();
    }

    /// A protocol received a message that breaks its rules.
    fn protocol_violation(&self, endpoint: &Endpoint, _protocol: &str) {
        endpoint.close();
    }

    fn session_started(&self, _endpoint: &Endpoint) {}

    fn session_stopped(&self, endpoint: &Endpoint) {
        endpoint.close();
    }

    /// The session was refused (by the server, or by the client's
    /// reading of the server's answer).
    fn session_rejected(&self, endpoint: &Endpoint, _reason: &str) {
        endpoint.close();
    }

    /// The peer is using a protocol this side has not registered.
    ///
    /// Return `true` after registering and starting it; the envelope is
    /// then routed to it. Returning `false` makes the envelope invalid.
    fn protocol_requested(&self, _endpoint: &Endpoint, _kind: ProtocolKind) -> bool {
        false
    }
}

/// Builds a built-in protocol instance for `endpoint`.
pub(crate) fn build_protocol(
    kind: ProtocolKind,
    endpoint: &Endpoint,
    timer: &TimerService,
    config: &ManagerConfig,
    authenticator: &Arc<dyn Authenticator>,
) -> RegisteredProtocol {
    match kind {
        ProtocolKind::Session => SessionProtocol::new(
            endpoint.clone(),
            timer.clone(),
            config.session.clone(),
            Arc::clone(authenticator),
        )
        .into(),
        ProtocolKind::KeepAlive => {
            KeepAliveProtocol::new(endpoint.clone(), timer.clone(), config.keep_alive_interval)
                .into()
        }
        ProtocolKind::Event => EventProtocol::new(endpoint.clone()).into(),
    }
}

/// Authenticator for the connecting side, which never checks secrets.
pub(crate) fn client_authenticator() -> Arc<dyn Authenticator> {
    Arc::new(OpenAccess)
}
