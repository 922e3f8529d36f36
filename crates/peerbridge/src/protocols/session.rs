//! The session protocol.
//!
//! Opens and closes the session that gates every other protocol on a
//! connection:
//!
//! ```text
//! client                         server
//!   │ ── SessionStart{secret} ──→ │  authenticate
//!   │ ←─ SessionStartAck ──────── │  accepted: Established / rejected: Stopped
//!   ⋮                             ⋮
//!   │ ── SessionStop ───────────→ │  (either side may start this)
//!   │ ←─ SessionStopAck ───────── │  both Stopped
//! ```
//!
//! Both sides arm a timeout while waiting on the other. State lives behind
//! one mutex, which is never held while the manager is called.

use std::sync::{Arc, Mutex, Weak};

use peerbridge_protocol::{Envelope, SESSION_PROTOCOL, SessionMessage};
use peerbridge_session::{Authenticator, SessionConfig, SessionState, generate_session_id};
use peerbridge_timer::{TimeoutHandle, TimerService};
use tracing::{debug, info, warn};

use super::{Protocol, Role};
use crate::{Endpoint, EndpointError, lock};

pub struct SessionProtocol {
    endpoint: Endpoint,
    timer: TimerService,
    config: SessionConfig,
    authenticator: Arc<dyn Authenticator>,
    me: Weak<SessionProtocol>,
    state: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    role: Option<Role>,
    session_id: Option<String>,
    /// A local `SessionStop` is waiting for its ack.
    stopping: bool,
    timeout: Option<TimeoutHandle>,
}

impl SessionInner {
    fn cancel_timeout(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
    }
}

/// What to tell the manager once the state lock is released.
enum Outcome {
    Started,
    Stopped,
    Rejected(String),
    TimedOut,
    Violation(&'static str),
}

impl SessionProtocol {
    /// Creates the protocol for `endpoint`.
    ///
    /// `config.secret` is what a client presents; `authenticator` is what
    /// a server checks it with.
    pub fn new(
        endpoint: Endpoint,
        timer: TimerService,
        config: SessionConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            endpoint,
            timer,
            config,
            authenticator,
            me: me.clone(),
            state: Mutex::new(SessionInner::default()),
        })
    }

    pub fn state(&self) -> SessionState {
        lock(&self.state).state
    }

    /// The id the server assigned, once established.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.state).session_id.clone()
    }

    pub fn role(&self) -> Option<Role> {
        lock(&self.state).role
    }

    /// Begins a graceful stop: sends `SessionStop` and waits (up to the
    /// session timeout) for the peer's ack.
    ///
    /// # Errors
    /// [`EndpointError::ProtocolNotRunning`] unless the session is
    /// established and not already stopping.
    pub fn stop_session(&self) -> Result<(), EndpointError> {
        {
            let mut inner = lock(&self.state);
            if !inner.state.is_established() || inner.stopping {
                return Err(EndpointError::ProtocolNotRunning(SESSION_PROTOCOL.to_string()));
            }
            inner.stopping = true;
            inner.cancel_timeout();
            inner.timeout = Some(self.arm_timeout());
        }
        info!(endpoint = %self.endpoint.id(), "stopping session");
        self.send_request(&SessionMessage::SessionStop)
    }

    fn begin(&self, role: Role) -> Result<(), EndpointError> {
        let mut inner = lock(&self.state);
        inner.state = inner
            .state
            .transition(SessionState::AwaitingPeer)
            .map_err(|_| EndpointError::ProtocolAlreadyRunning(SESSION_PROTOCOL.to_string()))?;
        inner.role = Some(role);
        inner.timeout = Some(self.arm_timeout());
        Ok(())
    }

    fn arm_timeout(&self) -> TimeoutHandle {
        let me = self.me.clone();
        self.timer.set_timeout(self.config.timeout, move || {
            if let Some(protocol) = me.upgrade() {
                protocol.timed_out();
            }
        })
    }

    fn timed_out(&self) {
        let outcome = {
            let mut inner = lock(&self.state);
            inner.timeout = None;
            match inner.state {
                SessionState::AwaitingPeer => {
                    inner.state = SessionState::Stopped;
                    Outcome::TimedOut
                }
                SessionState::Established if inner.stopping => {
                    inner.state = SessionState::Stopped;
                    Outcome::Stopped
                }
                _ => return,
            }
        };
        if self.endpoint.is_closed() {
            return;
        }
        if matches!(outcome, Outcome::TimedOut) {
            warn!(endpoint = %self.endpoint.id(), "session handshake timed out");
        } else {
            warn!(endpoint = %self.endpoint.id(), "no ack for session stop, stopping anyway");
        }
        self.report(outcome);
    }

    fn report(&self, outcome: Outcome) {
        let endpoint = &self.endpoint;
        let manager = endpoint.manager();
        match outcome {
            Outcome::Started => {
                info!(endpoint = %endpoint.id(), "session established");
                manager.session_started(endpoint);
            }
            Outcome::Stopped => {
                info!(endpoint = %endpoint.id(), "session stopped");
                manager.session_stopped(endpoint);
            }
            Outcome::Rejected(reason) => {
                warn!(endpoint = %endpoint.id(), %reason, "session rejected");
                manager.session_rejected(endpoint, &reason);
            }
            Outcome::TimedOut => manager.endpoint_timed_out(endpoint, SESSION_PROTOCOL),
            Outcome::Violation(detail) => self.report_violation(detail),
        }
    }

    fn send_or_log(&self, msg: &SessionMessage) {
        if let Err(e) = self.send_request_or_reply(msg) {
            debug!(endpoint = %self.endpoint.id(), error = %e, "session message not sent");
        }
    }

    fn send_request_or_reply(&self, msg: &SessionMessage) -> Result<(), EndpointError> {
        match msg {
            SessionMessage::SessionStart { .. } | SessionMessage::SessionStop => {
                self.send_request(msg)
            }
            SessionMessage::SessionStartAck { .. } | SessionMessage::SessionStopAck => {
                self.send_reply(msg)
            }
        }
    }

    /// Server side: authenticate and answer a `SessionStart`.
    fn on_session_start(&self, secret: Option<String>) -> Outcome {
        let mut inner = lock(&self.state);
        if inner.role != Some(Role::Server) || inner.state != SessionState::AwaitingPeer {
            return Outcome::Violation("unexpected SessionStart");
        }
        inner.cancel_timeout();

        match self.authenticator.authenticate(secret.as_deref()) {
            Ok(()) => {
                let session_id = generate_session_id();
                inner.state = SessionState::Established;
                inner.session_id = Some(session_id.clone());
                drop(inner);
                self.send_or_log(&SessionMessage::SessionStartAck {
                    accepted: true,
                    session_id: Some(session_id),
                    reason: None,
                });
                Outcome::Started
            }
            Err(e) => {
                inner.state = SessionState::Stopped;
                drop(inner);
                let reason = e.to_string();
                self.send_or_log(&SessionMessage::SessionStartAck {
                    accepted: false,
                    session_id: None,
                    reason: Some(reason.clone()),
                });
                Outcome::Rejected(reason)
            }
        }
    }

    /// Either side: the peer asked to stop.
    fn on_session_stop(&self) -> Outcome {
        {
            let mut inner = lock(&self.state);
            if !inner.state.is_established() {
                return Outcome::Violation("SessionStop without a session");
            }
            inner.cancel_timeout();
            inner.state = SessionState::Stopped;
        }
        self.send_or_log(&SessionMessage::SessionStopAck);
        Outcome::Stopped
    }

    /// Client side: the server answered our `SessionStart`.
    fn on_start_ack(
        &self,
        accepted: bool,
        session_id: Option<String>,
        reason: Option<String>,
    ) -> Outcome {
        let mut inner = lock(&self.state);
        if inner.role != Some(Role::Client) || inner.state != SessionState::AwaitingPeer {
            return Outcome::Violation("unexpected SessionStartAck");
        }
        inner.cancel_timeout();
        if accepted {
            inner.state = SessionState::Established;
            inner.session_id = session_id;
            Outcome::Started
        } else {
            inner.state = SessionState::Stopped;
            Outcome::Rejected(reason.unwrap_or_else(|| "session rejected".to_string()))
        }
    }

    /// The peer acknowledged our `SessionStop`.
    fn on_stop_ack(&self) -> Outcome {
        let mut inner = lock(&self.state);
        if !inner.state.is_established() || !inner.stopping {
            return Outcome::Violation("unexpected SessionStopAck");
        }
        inner.cancel_timeout();
        inner.state = SessionState::Stopped;
        Outcome::Stopped
    }
}

impl Protocol for SessionProtocol {
    fn name(&self) -> &'static str {
        SESSION_PROTOCOL
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn start_as_client(&self) -> Result<(), EndpointError> {
        self.begin(Role::Client)?;
        debug!(endpoint = %self.endpoint.id(), "requesting session");
        self.send_request(&SessionMessage::SessionStart {
            secret: self.config.secret.clone(),
        })
    }

    fn start_as_server(&self) -> Result<(), EndpointError> {
        self.begin(Role::Server)?;
        debug!(endpoint = %self.endpoint.id(), "awaiting session start");
        Ok(())
    }

    fn stop_protocol(&self) {
        let mut inner = lock(&self.state);
        inner.cancel_timeout();
        inner.state = SessionState::Stopped;
    }

    fn receive_request(&self, msg: &Envelope) {
        let outcome = match msg.payload::<SessionMessage>() {
            Ok(SessionMessage::SessionStart { secret }) => self.on_session_start(secret),
            Ok(SessionMessage::SessionStop) => self.on_session_stop(),
            Ok(_) => Outcome::Violation("reply payload sent as request"),
            Err(_) => Outcome::Violation("malformed session request"),
        };
        self.report(outcome);
    }

    fn receive_reply(&self, msg: &Envelope) {
        let outcome = match msg.payload::<SessionMessage>() {
            Ok(SessionMessage::SessionStartAck {
                accepted,
                session_id,
                reason,
            }) => self.on_start_ack(accepted, session_id, reason),
            Ok(SessionMessage::SessionStopAck) => self.on_stop_ack(),
            Ok(_) => Outcome::Violation("request payload sent as reply"),
            Err(_) => Outcome::Violation("malformed session reply"),
        };
        self.report(outcome);
    }
}
