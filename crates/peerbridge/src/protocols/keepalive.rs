//! The keep-alive protocol.
//!
//! The client sends `KeepAliveRequest` once per interval and expects a
//! reply before the next one is due; the server expects at least one
//! request per interval. Either side that sees nothing for a full interval
//! reports the endpoint as timed out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use peerbridge_protocol::{Envelope, KEEP_ALIVE_PROTOCOL, KeepAliveMessage};
use peerbridge_timer::{TimeoutHandle, TimerService};
use tracing::{debug, trace, warn};

use super::Protocol;
use crate::{Endpoint, EndpointError, lock};

pub struct KeepAliveProtocol {
    endpoint: Endpoint,
    timer: TimerService,
    interval: Duration,
    me: Weak<KeepAliveProtocol>,
    started: AtomicBool,
    stopped: AtomicBool,
    received_reply: AtomicBool,
    received_request: AtomicBool,
    next_check: Mutex<Option<TimeoutHandle>>,
}

impl KeepAliveProtocol {
    pub fn new(endpoint: Endpoint, timer: TimerService, interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            endpoint,
            timer,
            interval,
            me: me.clone(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            received_reply: AtomicBool::new(false),
            received_request: AtomicBool::new(false),
            next_check: Mutex::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn mark_started(&self) -> Result<(), EndpointError> {
        if self.started.swap(true, Ordering::AcqRel) || self.is_stopped() {
            return Err(EndpointError::ProtocolAlreadyRunning(KEEP_ALIVE_PROTOCOL.to_string()));
        }
        Ok(())
    }

    /// Timer callbacks act only while the protocol and its endpoint live.
    fn inactive(&self) -> bool {
        self.is_stopped() || self.endpoint.is_closed()
    }

    fn schedule(&self, check: fn(&KeepAliveProtocol)) {
        let me = self.me.clone();
        let handle = self.timer.set_timeout(self.interval, move || {
            if let Some(protocol) = me.upgrade() {
                check(&protocol);
            }
        });
        *lock(&self.next_check) = Some(handle);
    }

    fn client_check(&self) {
        if self.inactive() {
            return;
        }
        if !self.received_reply.swap(false, Ordering::AcqRel) {
            self.timed_out();
            return;
        }
        if let Err(e) = self.send_request(&KeepAliveMessage::KeepAliveRequest) {
            debug!(endpoint = %self.endpoint.id(), error = %e, "keep-alive request not sent");
            return;
        }
        self.schedule(Self::client_check);
    }

    fn server_check(&self) {
        if self.inactive() {
            return;
        }
        if !self.received_request.swap(false, Ordering::AcqRel) {
            self.timed_out();
            return;
        }
        self.schedule(Self::server_check);
    }

    fn timed_out(&self) {
        warn!(
            endpoint = %self.endpoint.id(),
            interval = ?self.interval,
            "keep-alive timed out"
        );
        self.endpoint.remove_protocol(KEEP_ALIVE_PROTOCOL);
        self.stop_protocol();
        if !self.endpoint.is_closed() {
            self.endpoint
                .manager()
                .endpoint_timed_out(&self.endpoint, KEEP_ALIVE_PROTOCOL);
        }
    }
}

impl Protocol for KeepAliveProtocol {
    fn name(&self) -> &'static str {
        KEEP_ALIVE_PROTOCOL
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn start_as_client(&self) -> Result<(), EndpointError> {
        self.mark_started()?;
        self.send_request(&KeepAliveMessage::KeepAliveRequest)?;
        self.schedule(Self::client_check);
        Ok(())
    }

    fn start_as_server(&self) -> Result<(), EndpointError> {
        self.mark_started()?;
        self.schedule(Self::server_check);
        Ok(())
    }

    fn stop_protocol(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(check) = lock(&self.next_check).take() {
            check.cancel();
        }
        debug!(endpoint = %self.endpoint.id(), "keep-alive stopped");
    }

    fn receive_request(&self, msg: &Envelope) {
        match msg.payload::<KeepAliveMessage>() {
            Ok(KeepAliveMessage::KeepAliveRequest) => {
                trace!(endpoint = %self.endpoint.id(), "keep-alive request");
                self.received_request.store(true, Ordering::Release);
                if let Err(e) = self.send_reply(&KeepAliveMessage::KeepAliveReply) {
                    debug!(endpoint = %self.endpoint.id(), error = %e, "keep-alive reply not sent");
                }
            }
            _ => self.report_violation("expected KeepAliveRequest"),
        }
    }

    fn receive_reply(&self, msg: &Envelope) {
        match msg.payload::<KeepAliveMessage>() {
            Ok(KeepAliveMessage::KeepAliveReply) => {
                trace!(endpoint = %self.endpoint.id(), "keep-alive reply");
                self.received_reply.store(true, Ordering::Release);
            }
            _ => self.report_violation("expected KeepAliveReply"),
        }
    }
}
