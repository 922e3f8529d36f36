//! `ClientManager`: one outbound connection with bounded reconnection.
//!
//! The connection loop dials the server, runs one endpoint until it
//! finishes, and decides what happens next:
//!
//! ```text
//! dial ──ok──→ run endpoint ──closed──→ done (timer released)
//!  │                │
//!  │                └──disconnected abruptly──→ wait backoff, dial again
//!  │
//!  ├──unknown host──→ fatal error (timer released)
//!  └──refused/failed──→ wait backoff, dial again; after `max_retries`
//!                        failed attempts give up (timer released)
//! ```
//!
//! Any successful dial resets the retry count; an abrupt disconnect and
//! every failed dial each count one attempt.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use peerbridge_protocol::ProtocolKind;
use peerbridge_timer::TimerService;
use peerbridge_transport::{Connection, Dialer, TcpDialer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::events::{LifecycleBus, LifecycleEvent, LifecycleKind};
use crate::manager::{build_protocol, client_authenticator};
use crate::protocols::{EventProtocol, KeepAliveProtocol, Role, SessionProtocol};
use crate::server::shut_down;
use crate::{Endpoint, Manager, PeerbridgeError, lock};

/// Maintains one session with a server, reconnecting after abrupt
/// disconnects.
///
/// Cheap to clone; clones drive the same connection.
pub struct ClientManager<D: Dialer = TcpDialer> {
    core: Arc<ClientCore<D>>,
}

impl<D: Dialer> Clone for ClientManager<D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

pub(crate) struct ClientCore<D: Dialer> {
    me: Weak<ClientCore<D>>,
    host: String,
    port: u16,
    config: ManagerConfig,
    dialer: D,
    timer: TimerService,
    owns_timer: bool,
    endpoint: Mutex<Option<Endpoint>>,
    retry_count: AtomicU32,
    reconnect_pending: AtomicBool,
    /// The current endpoint's session is established.
    session_live: AtomicBool,
    events: LifecycleBus,
    task: Mutex<Option<JoinHandle<Result<(), PeerbridgeError>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientManager<TcpDialer> {
    /// A client for `host:port` over TCP. Call [`start`](Self::start) or
    /// [`establish_connection`](Self::establish_connection) to connect.
    pub fn new(host: impl Into<String>, port: u16, config: ManagerConfig) -> Self {
        Self::with_dialer(host, port, config, TcpDialer)
    }
}

impl<D: Dialer> ClientManager<D> {
    /// A client that opens connections through `dialer`.
    pub fn with_dialer(host: impl Into<String>, port: u16, config: ManagerConfig, dialer: D) -> Self {
        Self::from_parts(host.into(), port, config, dialer, TimerService::new(), true)
    }

    pub(crate) fn from_parts(
        host: String,
        port: u16,
        config: ManagerConfig,
        dialer: D,
        timer: TimerService,
        owns_timer: bool,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new_cyclic(|me| ClientCore {
            me: me.clone(),
            host,
            port,
            config: config.validated(),
            dialer,
            timer,
            owns_timer,
            endpoint: Mutex::new(None),
            retry_count: AtomicU32::new(0),
            reconnect_pending: AtomicBool::new(false),
            session_live: AtomicBool::new(false),
            events: LifecycleBus::new(),
            task: Mutex::new(None),
            shutdown_tx,
        });
        Self { core }
    }

    /// Spawns the connection loop. Does nothing if already started.
    pub fn start(&self) {
        let mut task = lock(&self.core.task);
        if task.is_some() {
            warn!(host = %self.core.host, port = self.core.port, "client already started");
            return;
        }
        let core = Arc::clone(&self.core);
        *task = Some(tokio::spawn(async move { core.connection_loop().await }));
    }

    /// Waits for the connection loop spawned by [`start`](Self::start).
    ///
    /// # Errors
    /// Whatever ended the loop: a fatal dial error or
    /// [`PeerbridgeError::RetriesExhausted`].
    pub async fn join(&self) -> Result<(), PeerbridgeError> {
        let task = lock(&self.core.task).take();
        match task {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    /// Runs the connection loop on the current task until the connection
    /// ends for good.
    pub async fn establish_connection(&self) -> Result<(), PeerbridgeError> {
        Arc::clone(&self.core).connection_loop().await
    }

    /// Subscribes to session lifecycle events.
    pub fn on<F>(&self, kind: LifecycleKind, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.core.events.on(kind, handler);
    }

    /// The current endpoint, while connected.
    pub fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.core.endpoint).clone()
    }

    /// Reconnection attempts since the last successful dial.
    pub fn retry_count(&self) -> u32 {
        self.core.retry_count.load(Ordering::Acquire)
    }

    pub fn host(&self) -> &str {
        &self.core.host
    }

    pub fn port(&self) -> u16 {
        self.core.port
    }

    pub fn timer(&self) -> &TimerService {
        &self.core.timer
    }

    /// Gracefully ends the current session; the endpoint closes once the
    /// server acknowledges.
    pub fn stop_session(&self) -> Result<(), PeerbridgeError> {
        let endpoint = self.endpoint().ok_or(PeerbridgeError::NotConnected)?;
        endpoint.stop_session()?;
        Ok(())
    }

    /// Closes the endpoint and cancels any pending reconnection.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.core.shutdown_tx.send_replace(true) {
            return;
        }
        info!(host = %self.core.host, port = self.core.port, "client shutting down");
        self.core.reconnect_pending.store(false, Ordering::Release);
        if let Some(endpoint) = self.endpoint() {
            endpoint.close();
        }
    }
}

impl<D: Dialer> ClientCore<D> {
    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn connection_loop(self: Arc<Self>) -> Result<(), PeerbridgeError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let result = loop {
            if self.is_shut_down() {
                break Ok(());
            }

            let dialed = tokio::select! {
                () = shut_down(&mut shutdown_rx) => break Ok(()),
                dialed = self.dialer.dial(&self.host, self.port) => dialed,
            };

            match dialed {
                Ok(conn) => {
                    self.retry_count.store(0, Ordering::Release);
                    self.reconnect_pending.store(false, Ordering::Release);
                    info!(host = %self.host, port = self.port, "connected");

                    if !self.run_endpoint(conn).await {
                        break Ok(());
                    }
                    let attempts = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
                    info!(
                        host = %self.host,
                        port = self.port,
                        attempt = attempts,
                        backoff = ?self.config.reconnect.backoff,
                        "connection lost, reconnecting"
                    );
                    if !self.back_off(&mut shutdown_rx).await {
                        break Ok(());
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(host = %self.host, port = self.port, error = %e, "cannot connect");
                    break Err(e.into());
                }
                Err(e) => {
                    let attempts = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
                    let policy = self.config.reconnect;
                    if attempts >= policy.max_retries {
                        error!(
                            host = %self.host,
                            port = self.port,
                            attempts,
                            "giving up on connection"
                        );
                        break Err(PeerbridgeError::RetriesExhausted { attempts });
                    }
                    warn!(
                        host = %self.host,
                        port = self.port,
                        error = %e,
                        attempt = attempts,
                        max = policy.max_retries,
                        backoff = ?policy.backoff,
                        "connection failed, retrying"
                    );
                    if !self.back_off(&mut shutdown_rx).await {
                        break Ok(());
                    }
                }
            }
        };
        self.release_timer();
        result
    }

    /// Sleeps the reconnect backoff on the timer. Returns `false` if the
    /// client was shut down (or the timer released) in the meantime.
    async fn back_off(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = shut_down(shutdown_rx) => false,
            waited = self.timer.sleep(self.config.reconnect.backoff) => waited,
        }
    }

    /// Runs one endpoint to completion. Returns whether to reconnect.
    async fn run_endpoint(&self, conn: Connection) -> bool {
        let Some(me) = self.me.upgrade() else {
            return false;
        };
        if self.is_shut_down() {
            return false;
        }
        let endpoint = Endpoint::new(conn, me);
        *lock(&self.endpoint) = Some(endpoint.clone());
        // `shutdown` may have run before the endpoint was visible to it.
        if self.is_shut_down() {
            endpoint.close();
        } else {
            endpoint.start();
        }
        endpoint.wait_closed().await;
        lock(&self.endpoint).take();

        self.reconnect_pending.swap(false, Ordering::AcqRel) && !self.is_shut_down()
    }

    fn release_timer(&self) {
        if self.owns_timer && self.timer.shutdown() {
            debug!(host = %self.host, port = self.port, "client released timer");
        }
    }

    fn fail(&self, endpoint: &Endpoint, reason: String) {
        self.session_live.store(false, Ordering::Release);
        warn!(endpoint = %endpoint.id(), %reason, "session error");
        self.events
            .emit(LifecycleEvent::SessionError(endpoint.clone(), reason));
        endpoint.close();
    }

    fn start_client_protocol(&self, endpoint: &Endpoint, kind: ProtocolKind) -> bool {
        let protocol = build_protocol(
            kind,
            endpoint,
            &self.timer,
            &self.config,
            &client_authenticator(),
        );
        match endpoint.start_protocol(protocol, Role::Client) {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %endpoint.id(), protocol = %kind, error = %e, "protocol not started");
                false
            }
        }
    }
}

impl<D: Dialer> Manager for ClientCore<D> {
    fn endpoint_ready(&self, endpoint: &Endpoint) {
        self.session_live.store(false, Ordering::Release);
        let session = SessionProtocol::new(
            endpoint.clone(),
            self.timer.clone(),
            self.config.session.clone(),
            client_authenticator(),
        );
        if let Err(e) = endpoint.start_protocol(session, Role::Client) {
            warn!(endpoint = %endpoint.id(), error = %e, "could not start session protocol");
            endpoint.close();
        }
    }

    fn endpoint_closed(&self, endpoint: &Endpoint) {
        if self.session_live.swap(false, Ordering::AcqRel) {
            self.events
                .emit(LifecycleEvent::SessionStopped(endpoint.clone()));
        }
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint) {
        if !self.is_shut_down() {
            self.reconnect_pending.store(true, Ordering::Release);
        }
        self.fail(endpoint, "disconnected abruptly".to_string());
    }

    fn endpoint_sent_invalid_message(&self, endpoint: &Endpoint) {
        self.fail(endpoint, "invalid message".to_string());
    }

    fn endpoint_timed_out(&self, endpoint: &Endpoint, protocol: &str) {
        self.fail(endpoint, format!("{protocol} timed out"));
    }

    fn protocol_violation(&self, endpoint: &Endpoint, protocol: &str) {
        self.fail(endpoint, format!("{protocol} violation"));
    }

    fn session_started(&self, endpoint: &Endpoint) {
        self.session_live.store(true, Ordering::Release);
        let keep_alive = KeepAliveProtocol::new(
            endpoint.clone(),
            self.timer.clone(),
            self.config.keep_alive_interval,
        );
        if let Err(e) = endpoint.start_protocol(keep_alive, Role::Client) {
            warn!(endpoint = %endpoint.id(), error = %e, "keep-alive not started");
        }
        if let Err(e) = endpoint.start_protocol(EventProtocol::new(endpoint.clone()), Role::Client) {
            warn!(endpoint = %endpoint.id(), error = %e, "event protocol not started");
        }
        self.events
            .emit(LifecycleEvent::SessionStarted(endpoint.clone()));
    }

    fn session_stopped(&self, endpoint: &Endpoint) {
        if self.session_live.swap(false, Ordering::AcqRel) {
            self.events
                .emit(LifecycleEvent::SessionStopped(endpoint.clone()));
        }
        endpoint.close();
    }

    fn session_rejected(&self, endpoint: &Endpoint, reason: &str) {
        self.fail(endpoint, format!("session rejected: {reason}"));
    }

    fn protocol_requested(&self, endpoint: &Endpoint, kind: ProtocolKind) -> bool {
        if kind == ProtocolKind::Session || !self.session_live.load(Ordering::Acquire) {
            warn!(endpoint = %endpoint.id(), protocol = %kind, "protocol request refused");
            return false;
        }
        self.start_client_protocol(endpoint, kind)
    }
}
