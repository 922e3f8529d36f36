//! The endpoint: one connection, its receive pump, and its protocols.
//!
//! An [`Endpoint`] is a cheap, cloneable handle. Starting it spawns two
//! tasks:
//!
//! - the **pump** reads envelopes off the connection and routes each one,
//!   by protocol name and message kind, to a registered protocol;
//! - the **writer** drains the endpoint's outbound queue onto the wire, so
//!   envelopes sent from any protocol or timer never interleave.
//!
//! Life-cycle changes are reported to the endpoint's [`Manager`]; protocol
//! failures never escape the pump.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::StreamExt;
use peerbridge_protocol::{Codec, Envelope, JsonCodec, MessageKind, ProtocolKind};
use peerbridge_session::SessionState;
use peerbridge_transport::{Connection, ConnectionId, LineReader, LineWriter, TransportError};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::events::Subscribers;
use crate::protocols::{EventProtocol, RegisteredProtocol, Role, SessionProtocol};
use crate::{EndpointError, Manager, lock};

/// Handle to one connection and the protocols running on it.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    id: ConnectionId,
    peer: String,
    manager: Arc<dyn Manager>,
    codec: JsonCodec,
    /// Sending half of the writer queue. `None` once closed.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Connection halves and queue receiver, taken by `start`.
    io: Mutex<Option<PendingIo>>,
    protocols: Mutex<HashMap<&'static str, RegisteredProtocol>>,
    handlers: Subscribers<String, [String]>,
    closed: AtomicBool,
    stop_pump: Notify,
    finished: Arc<watch::Sender<bool>>,
}

struct PendingIo {
    reader: LineReader,
    writer: LineWriter,
    queue: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Endpoint {
    /// Wraps a connection. Nothing is read or written until
    /// [`start`](Self::start); envelopes sent before then are queued.
    pub fn new(conn: Connection, manager: Arc<dyn Manager>) -> Self {
        let id = conn.id();
        let peer = conn.peer().to_string();
        let (reader, writer) = conn.into_split();
        let (tx, queue) = mpsc::unbounded_channel();
        let (finished, _) = watch::channel(false);

        Self {
            inner: Arc::new(EndpointInner {
                id,
                peer,
                manager,
                codec: JsonCodec,
                outbound: Mutex::new(Some(tx)),
                io: Mutex::new(Some(PendingIo {
                    reader,
                    writer,
                    queue,
                })),
                protocols: Mutex::new(HashMap::new()),
                handlers: Subscribers::new(),
                closed: AtomicBool::new(false),
                stop_pump: Notify::new(),
                finished: Arc::new(finished),
            }),
        }
    }

    // -- Accessors --------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The peer's address (or in-memory label).
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn manager(&self) -> &Arc<dyn Manager> {
        &self.inner.manager
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // -- Running ----------------------------------------------------------

    /// Spawns the pump and writer tasks. Does not block.
    ///
    /// The pump calls [`Manager::endpoint_ready`] before reading anything.
    /// Starting twice, or starting a closed endpoint, does nothing.
    pub fn start(&self) {
        let io = {
            let mut io = lock(&self.inner.io);
            if self.is_closed() {
                None
            } else {
                io.take()
            }
        };
        let Some(PendingIo {
            reader,
            writer,
            queue,
        }) = io
        else {
            warn!(endpoint = %self.id(), "endpoint already started or closed");
            return;
        };

        info!(endpoint = %self.id(), peer = %self.peer(), "endpoint starting");
        tokio::spawn(run_writer(
            Arc::downgrade(&self.inner),
            writer,
            queue,
            Arc::clone(&self.inner.finished),
        ));
        tokio::spawn(run_pump(self.clone(), reader));
    }

    /// Encodes and queues one envelope for the writer.
    ///
    /// Never blocks; envelopes leave in the order they were queued.
    ///
    /// # Errors
    /// - [`EndpointError::Unavailable`] once the endpoint is closed
    /// - [`EndpointError::Protocol`] if the envelope fails to encode
    pub fn send(&self, envelope: &Envelope) -> Result<(), EndpointError> {
        let frame = self.inner.codec.encode(envelope)?;
        let outbound = lock(&self.inner.outbound);
        let tx = outbound
            .as_ref()
            .ok_or(EndpointError::Unavailable(self.id()))?;
        tx.send(frame)
            .map_err(|_| EndpointError::Unavailable(self.id()))?;
        trace!(
            endpoint = %self.id(),
            protocol = %envelope.protocol,
            payload = envelope.payload_type().unwrap_or("?"),
            "envelope queued"
        );
        Ok(())
    }

    /// Closes the endpoint. Idempotent.
    ///
    /// Stops every registered protocol and the pump, lets the writer flush
    /// whatever is already queued before shutting the stream, then calls
    /// [`Manager::endpoint_closed`] exactly once.
    pub fn close(&self) {
        if !self.shut_down() {
            return;
        }
        info!(endpoint = %self.id(), "endpoint closed");
        self.inner.manager.endpoint_closed(self);
    }

    /// Tears the endpoint down after an I/O failure.
    ///
    /// Like [`close`](Self::close), but reports
    /// [`Manager::endpoint_disconnected_abruptly`] instead of
    /// `endpoint_closed`. Does nothing if the endpoint is already closed.
    pub fn disconnected_abruptly(&self, error: &TransportError) {
        if !self.shut_down() {
            return;
        }
        warn!(endpoint = %self.id(), error = %error, "endpoint disconnected abruptly");
        self.inner.manager.endpoint_disconnected_abruptly(self);
    }

    /// Shared teardown. Returns `false` if already closed.
    fn shut_down(&self) -> bool {
        // Flag and drain under the table lock so no registration slips in
        // between them.
        let protocols: Vec<_> = {
            let mut table = lock(&self.inner.protocols);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            table.drain().map(|(_, p)| p).collect()
        };
        for protocol in &protocols {
            protocol.as_protocol().stop_protocol();
        }

        // Dropping the sender lets the writer drain and then finish.
        lock(&self.inner.outbound).take();
        self.inner.stop_pump.notify_one();

        // Never started: no writer will report completion.
        if lock(&self.inner.io).take().is_some() {
            self.inner.finished.send_replace(true);
        }
        true
    }

    /// Resolves once the endpoint is closed and its writer has finished.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    // -- Protocols --------------------------------------------------------

    /// Registers a protocol instance.
    ///
    /// # Errors
    /// - [`EndpointError::ProtocolAlreadyRunning`] if one with the same
    ///   name is registered
    /// - [`EndpointError::Unavailable`] if the endpoint is closed
    pub fn handle_protocol(
        &self,
        protocol: impl Into<RegisteredProtocol>,
    ) -> Result<(), EndpointError> {
        let protocol = protocol.into();
        let name = protocol.name();
        let mut protocols = lock(&self.inner.protocols);
        if self.is_closed() {
            return Err(EndpointError::Unavailable(self.id()));
        }
        if protocols.contains_key(name) {
            return Err(EndpointError::ProtocolAlreadyRunning(name.to_string()));
        }
        protocols.insert(name, protocol);
        debug!(endpoint = %self.id(), protocol = name, "protocol registered");
        Ok(())
    }

    /// Registers a protocol, then starts it in the given role.
    ///
    /// If starting fails the protocol is unregistered again.
    pub fn start_protocol(
        &self,
        protocol: impl Into<RegisteredProtocol>,
        role: Role,
    ) -> Result<(), EndpointError> {
        let protocol = protocol.into();
        let name = protocol.name();
        self.handle_protocol(protocol.clone())?;
        let started = match role {
            Role::Client => protocol.as_protocol().start_as_client(),
            Role::Server => protocol.as_protocol().start_as_server(),
        };
        if let Err(e) = started {
            self.remove_protocol(name);
            return Err(e);
        }
        debug!(endpoint = %self.id(), protocol = name, ?role, "protocol started");
        Ok(())
    }

    /// Unregisters and stops the named protocol, returning it if it was
    /// registered.
    pub fn remove_protocol(&self, name: &str) -> Option<RegisteredProtocol> {
        let removed = lock(&self.inner.protocols).remove(name);
        if let Some(protocol) = &removed {
            protocol.as_protocol().stop_protocol();
            debug!(endpoint = %self.id(), protocol = name, "protocol removed");
        }
        removed
    }

    /// The registered protocol with this name, if any.
    pub fn protocol(&self, name: &str) -> Option<RegisteredProtocol> {
        lock(&self.inner.protocols).get(name).cloned()
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        lock(&self.inner.protocols).contains_key(name)
    }

    /// The registered session protocol, if any.
    pub fn session(&self) -> Option<Arc<SessionProtocol>> {
        match self.protocol(ProtocolKind::Session.name())? {
            RegisteredProtocol::Session(session) => Some(session),
            _ => None,
        }
    }

    /// Current session state; `NotStarted` without a session protocol.
    pub fn session_state(&self) -> SessionState {
        self.session()
            .map_or(SessionState::NotStarted, |s| s.state())
    }

    /// Gracefully ends the session (see [`SessionProtocol::stop_session`]).
    pub fn stop_session(&self) -> Result<(), EndpointError> {
        let session = self.session().ok_or_else(|| {
            EndpointError::ProtocolNotRunning(ProtocolKind::Session.name().to_string())
        })?;
        session.stop_session()
    }

    // -- Application events -----------------------------------------------

    /// Sends a named application event to the peer.
    ///
    /// # Errors
    /// [`EndpointError::ProtocolNotRunning`] if no event protocol is
    /// registered (before the session is established, for example).
    pub fn emit<I, S>(&self, name: &str, args: I) -> Result<(), EndpointError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let event = self.event_protocol().ok_or_else(|| {
            EndpointError::ProtocolNotRunning(ProtocolKind::Event.name().to_string())
        })?;
        event.emit(name, args.into_iter().map(Into::into).collect())
    }

    /// Subscribes to a named application event from the peer.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.inner.handlers.subscribe(name.into(), Arc::new(handler));
    }

    /// Hands an event received from the peer to local subscribers.
    /// Returns how many handlers ran.
    pub fn deliver_event(&self, name: &str, args: &[String]) -> usize {
        let delivered = self.inner.handlers.emit(name, args);
        if delivered == 0 {
            debug!(endpoint = %self.id(), event = name, "event has no subscribers");
        }
        delivered
    }

    fn event_protocol(&self) -> Option<Arc<EventProtocol>> {
        match self.protocol(ProtocolKind::Event.name())? {
            RegisteredProtocol::Event(event) => Some(event),
            _ => None,
        }
    }

    // -- Dispatch ---------------------------------------------------------

    /// Routes one frame. Returns `false` if the pump must stop.
    fn dispatch(&self, frame: &[u8]) -> bool {
        let envelope: Envelope = match self.inner.codec.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(endpoint = %self.id(), error = %e, "malformed envelope");
                self.inner.manager.endpoint_sent_invalid_message(self);
                return false;
            }
        };

        let Some(protocol) = self.route(&envelope.protocol) else {
            warn!(
                endpoint = %self.id(),
                protocol = %envelope.protocol,
                "envelope for unavailable protocol"
            );
            self.inner.manager.endpoint_sent_invalid_message(self);
            return false;
        };

        trace!(
            endpoint = %self.id(),
            protocol = %envelope.protocol,
            kind = ?envelope.kind,
            payload = envelope.payload_type().unwrap_or("?"),
            "envelope received"
        );
        match envelope.kind {
            MessageKind::Request => protocol.as_protocol().receive_request(&envelope),
            MessageKind::Reply => protocol.as_protocol().receive_reply(&envelope),
        }
        !self.is_closed()
    }

    /// Finds the protocol for `name`, asking the manager to start a known
    /// protocol the peer is using but this side has not registered.
    fn route(&self, name: &str) -> Option<RegisteredProtocol> {
        if let Some(protocol) = self.protocol(name) {
            return Some(protocol);
        }
        let kind = ProtocolKind::from_name(name)?;
        if self.inner.manager.protocol_requested(self, kind) {
            self.protocol(name)
        } else {
            None
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Endpoint {}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn run_pump(endpoint: Endpoint, reader: LineReader) {
    endpoint.inner.manager.endpoint_ready(&endpoint);

    let mut frames = std::pin::pin!(reader.into_stream());
    loop {
        if endpoint.is_closed() {
            break;
        }
        let next = tokio::select! {
            biased;
            () = endpoint.inner.stop_pump.notified() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if !endpoint.dispatch(&frame) {
                    break;
                }
            }
            Some(Err(e @ (TransportError::FrameTooLarge { .. } | TransportError::MalformedFrame(_)))) => {
                warn!(endpoint = %endpoint.id(), error = %e, "unreadable frame");
                endpoint.inner.manager.endpoint_sent_invalid_message(&endpoint);
                break;
            }
            Some(Err(e)) => {
                endpoint.disconnected_abruptly(&e);
                break;
            }
            None => {
                debug!(endpoint = %endpoint.id(), "peer closed the stream");
                endpoint.close();
                break;
            }
        }
    }
    trace!(endpoint = %endpoint.id(), "pump stopped");
}

async fn run_writer(
    endpoint: Weak<EndpointInner>,
    mut writer: LineWriter,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    finished: Arc<watch::Sender<bool>>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.send(&frame).await {
            if let Some(inner) = endpoint.upgrade() {
                Endpoint { inner }.disconnected_abruptly(&e);
            }
            finished.send_replace(true);
            return;
        }
    }
    if let Err(e) = writer.close().await {
        debug!(error = %e, "stream shutdown failed");
    }
    finished.send_replace(true);
}
