//! The event protocol: named application events with string arguments.
//!
//! `Endpoint::emit` sends an `Event` request; the receiving side hands it
//! to the endpoint's subscribers and answers with `EventAck`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use peerbridge_protocol::{EVENT_PROTOCOL, Envelope, EventMessage};
use tracing::{debug, trace};

use super::Protocol;
use crate::{Endpoint, EndpointError};

pub struct EventProtocol {
    endpoint: Endpoint,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl EventProtocol {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Sends one event to the peer.
    pub fn emit(&self, name: &str, args: Vec<String>) -> Result<(), EndpointError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EndpointError::ProtocolNotRunning(EVENT_PROTOCOL.to_string()));
        }
        trace!(endpoint = %self.endpoint.id(), event = name, "emitting event");
        self.send_request(&EventMessage::Event {
            name: name.to_string(),
            args,
        })
    }

    fn start(&self) -> Result<(), EndpointError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EndpointError::ProtocolAlreadyRunning(EVENT_PROTOCOL.to_string()));
        }
        Ok(())
    }
}

impl Protocol for EventProtocol {
    fn name(&self) -> &'static str {
        EVENT_PROTOCOL
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn start_as_client(&self) -> Result<(), EndpointError> {
        self.start()
    }

    fn start_as_server(&self) -> Result<(), EndpointError> {
        self.start()
    }

    fn stop_protocol(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn receive_request(&self, msg: &Envelope) {
        let Ok(EventMessage::Event { name, args }) = msg.payload::<EventMessage>() else {
            self.report_violation("expected Event");
            return;
        };
        if let Err(e) = self.send_reply(&EventMessage::EventAck { name: name.clone() }) {
            debug!(endpoint = %self.endpoint.id(), error = %e, "event ack not sent");
        }
        self.endpoint.deliver_event(&name, &args);
    }

    fn receive_reply(&self, msg: &Envelope) {
        match msg.payload::<EventMessage>() {
            Ok(EventMessage::EventAck { name }) => {
                trace!(endpoint = %self.endpoint.id(), event = %name, "event acknowledged");
            }
            _ => self.report_violation("expected EventAck"),
        }
    }
}
