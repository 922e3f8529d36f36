//! Shared fixtures: in-memory dialers, a recording manager, raw wire peers.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use peerbridge::prelude::*;
use peerbridge::transport::{LineReader, LineWriter, TransportError};
use serde_json::Value;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// Dialers
// =========================================================================

/// Dials straight into a [`ServerManager`] over an in-memory pipe.
///
/// Refuses the first `refusals` attempts. Every connection it hands out
/// can be tripped to fail its next read.
#[derive(Clone)]
pub struct MemoryDialer {
    server: ServerManager,
    refusals: Arc<AtomicU32>,
    dials: Arc<AtomicU32>,
    trip: Arc<AtomicBool>,
}

impl MemoryDialer {
    pub fn new(server: ServerManager) -> Self {
        Self::refusing(server, 0)
    }

    pub fn refusing(server: ServerManager, refusals: u32) -> Self {
        Self {
            server,
            refusals: Arc::new(AtomicU32::new(refusals)),
            dials: Arc::new(AtomicU32::new(0)),
            trip: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Total dial attempts, refused or not.
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Makes the current client connection fail its next read.
    pub fn trip(&self) {
        self.trip.store(true, Ordering::SeqCst);
    }
}

impl Dialer for MemoryDialer {
    async fn dial(&self, _host: &str, _port: u16) -> Result<Connection, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(refused_error());
        }

        self.trip.store(false, Ordering::SeqCst);
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        self.server
            .serve_connection(Connection::new("memory:server", server_read, server_write))
            .map_err(|e| TransportError::ConnectFailed(io::Error::other(e.to_string())))?;

        let (client_read, client_write) = tokio::io::split(client_io);
        let reader = Tripwire {
            inner: client_read,
            trip: Arc::clone(&self.trip),
        };
        Ok(Connection::new("memory:client", reader, client_write))
    }
}

/// Refuses every dial.
#[derive(Clone, Default)]
pub struct RefusingDialer {
    dials: Arc<AtomicU32>,
}

impl RefusingDialer {
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Dialer for RefusingDialer {
    async fn dial(&self, _host: &str, _port: u16) -> Result<Connection, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(refused_error())
    }
}

/// Hands the far end of every dialed connection to the test as a
/// [`RawPeer`].
#[derive(Clone)]
pub struct PipeDialer {
    peers: mpsc::UnboundedSender<RawPeer>,
}

impl PipeDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RawPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

impl Dialer for PipeDialer {
    async fn dial(&self, _host: &str, _port: u16) -> Result<Connection, TransportError> {
        let (near, far) = Connection::in_memory_pair();
        self.peers
            .send(RawPeer::new(far))
            .map_err(|_| TransportError::ConnectFailed(io::Error::other("test gone")))?;
        Ok(near)
    }
}

fn refused_error() -> TransportError {
    TransportError::ConnectFailed(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

// =========================================================================
// Faulty streams
// =========================================================================

/// Passes reads through until tripped, then fails them.
///
/// A tripped reader only notices on its next poll, so the peer must send
/// something to wake it.
pub struct Tripwire<S> {
    inner: S,
    trip: Arc<AtomicBool>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Tripwire<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.trip.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// A reader whose every read fails.
pub struct BrokenReader;

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

// =========================================================================
// Raw wire peer
// =========================================================================

/// The far end of a connection, driven line by line from a test.
pub struct RawPeer {
    reader: LineReader,
    writer: LineWriter,
}

impl RawPeer {
    pub fn new(conn: Connection) -> Self {
        let (reader, writer) = conn.into_split();
        Self { reader, writer }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.send(line.as_bytes()).await.expect("raw send");
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_line(&value.to_string()).await;
    }

    /// The next envelope as JSON, or `None` once the stream ends.
    pub async fn recv_json(&mut self) -> Option<Value> {
        self.recv_json_within(WAIT).await
    }

    pub async fn recv_json_within(&mut self, limit: Duration) -> Option<Value> {
        let frame = tokio::time::timeout(limit, self.reader.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("raw recv");
        frame.map(|frame| serde_json::from_slice(&frame).expect("frame is JSON"))
    }

    /// Completes the client half of the session handshake.
    pub async fn open_session(&mut self, secret: Option<&str>) -> Value {
        let mut start = serde_json::json!({
            "protocol": "SessionProtocol",
            "type": "request",
            "payload": "SessionStart",
        });
        if let Some(secret) = secret {
            start["secret"] = Value::from(secret);
        }
        self.send_json(start).await;
        self.recv_json().await.expect("session ack")
    }

    /// Answers a `SessionStart` as an accepting server would.
    pub async fn accept_session(&mut self) {
        let start = self.recv_json().await.expect("session start");
        assert_eq!(start["payload"], "SessionStart");
        self.send_json(serde_json::json!({
            "protocol": "SessionProtocol",
            "type": "reply",
            "payload": "SessionStartAck",
            "accepted": true,
            "session_id": "0123456789abcdef0123456789abcdef",
        }))
        .await;
    }
}

// =========================================================================
// Recording manager
// =========================================================================

/// Records every manager callback by name and applies the default policy.
pub struct Recorder {
    calls: mpsc::UnboundedSender<String>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls }), rx)
    }

    fn note(&self, call: impl Into<String>) {
        let _ = self.calls.send(call.into());
    }
}

impl Manager for Recorder {
    fn endpoint_ready(&self, _endpoint: &Endpoint) {
        self.note("ready");
    }

    fn endpoint_closed(&self, _endpoint: &Endpoint) {
        self.note("closed");
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint) {
        self.note("abrupt");
        endpoint.close();
    }

    fn endpoint_sent_invalid_message(&self, endpoint: &Endpoint) {
        self.note("invalid");
        endpoint.close();
    }

    fn endpoint_timed_out(&self, endpoint: &Endpoint, protocol: &str) {
        self.note(format!("timed_out:{protocol}"));
        endpoint.close();
    }

    fn protocol_violation(&self, endpoint: &Endpoint, protocol: &str) {
        self.note(format!("violation:{protocol}"));
        endpoint.close();
    }

    fn protocol_requested(&self, _endpoint: &Endpoint, kind: ProtocolKind) -> bool {
        self.note(format!("requested:{kind}"));
        false
    }
}

pub async fn next_call(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a manager call")
        .expect("recorder dropped")
}

// =========================================================================
// Lifecycle capture
// =========================================================================

/// Anything that publishes lifecycle events.
pub trait Observable {
    fn observe(&self, kind: LifecycleKind, tx: mpsc::UnboundedSender<LifecycleEvent>);
}

impl Observable for ServerManager {
    fn observe(&self, kind: LifecycleKind, tx: mpsc::UnboundedSender<LifecycleEvent>) {
        self.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
}

impl<D: Dialer> Observable for ClientManager<D> {
    fn observe(&self, kind: LifecycleKind, tx: mpsc::UnboundedSender<LifecycleEvent>) {
        self.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
}

impl<D: Dialer + Clone> Observable for PeerManager<D> {
    fn observe(&self, kind: LifecycleKind, tx: mpsc::UnboundedSender<LifecycleEvent>) {
        self.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
}

/// Captures the session events of `source`, in order.
pub fn capture(source: &impl Observable) -> mpsc::UnboundedReceiver<LifecycleEvent> {
    capture_kinds(
        source,
        &[
            LifecycleKind::SessionStarted,
            LifecycleKind::SessionStopped,
            LifecycleKind::SessionError,
        ],
    )
}

pub fn capture_kinds(
    source: &impl Observable,
    kinds: &[LifecycleKind],
) -> mpsc::UnboundedReceiver<LifecycleEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for &kind in kinds {
        source.observe(kind, tx.clone());
    }
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
    next_event_within(rx, WAIT).await
}

pub async fn next_event_within(
    rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>,
    limit: Duration,
) -> LifecycleEvent {
    tokio::time::timeout(limit, rx.recv())
        .await
        .expect("timed out waiting for a lifecycle event")
        .expect("event source dropped")
}

/// Waits for the next event and checks its kind.
pub async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>,
    kind: LifecycleKind,
) -> LifecycleEvent {
    let event = next_event(rx).await;
    assert_eq!(event.kind(), kind, "unexpected event {event:?}");
    event
}

/// Subscribes `name` on `endpoint` into a channel.
pub fn listen(endpoint: &Endpoint, name: &str) -> mpsc::UnboundedReceiver<Vec<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    endpoint.on(name, move |args: &[String]| {
        let _ = tx.send(args.to_vec());
    });
    rx
}

pub async fn next_args(rx: &mut mpsc::UnboundedReceiver<Vec<String>>) -> Vec<String> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an application event")
        .expect("endpoint dropped")
}
