//! `ServerManager`: accepts connections and tracks their sessions.
//!
//! Each accepted connection becomes an [`Endpoint`] running the session
//! protocol as server. Once a client opens a session, the server starts
//! the keep-alive check and the event protocol, and honours requests for
//! any other built-in protocol. Applications observe sessions through
//! lifecycle events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use peerbridge_protocol::ProtocolKind;
use peerbridge_session::{Authenticator, SessionTable, authenticator_for};
use peerbridge_timer::TimerService;
use peerbridge_transport::{Connection, ConnectionId, TcpTransport, Transport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::events::{LifecycleBus, LifecycleEvent, LifecycleKind};
use crate::manager::build_protocol;
use crate::protocols::{EventProtocol, KeepAliveProtocol, Role, SessionProtocol};
use crate::{Endpoint, Manager, PeerbridgeError, lock};

/// Accepts inbound connections and manages their sessions.
///
/// Cheap to clone; clones share the same listener and session table.
///
/// # Example
///
/// ```rust,no_run
/// use peerbridge::prelude::*;
///
/// # async fn run() -> Result<(), PeerbridgeError> {
/// let server = ServerManager::bind("0.0.0.0:3100", ManagerConfig::default()).await?;
/// server.on(LifecycleKind::SessionStarted, |event| {
///     let _ = event.endpoint().emit("WELCOME", ["hello"]);
/// });
/// server.start();
/// server.join().await
/// # }
/// ```
#[derive(Clone)]
pub struct ServerManager {
    core: Arc<ServerCore>,
}

pub(crate) struct ServerCore {
    me: Weak<ServerCore>,
    config: ManagerConfig,
    timer: TimerService,
    owns_timer: bool,
    authenticator: Arc<dyn Authenticator>,
    local_addr: Option<SocketAddr>,
    transport: Mutex<Option<TcpTransport>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sessions: Mutex<SessionTable>,
    endpoints: Mutex<HashMap<ConnectionId, Endpoint>>,
    events: LifecycleBus,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerManager {
    /// Binds a TCP listener. Call [`start`](Self::start) to accept.
    pub async fn bind(addr: &str, config: ManagerConfig) -> Result<Self, PeerbridgeError> {
        let transport = TcpTransport::bind(addr).await?;
        Ok(Self::from_parts(Some(transport), config, TimerService::new(), true))
    }

    /// A server without a listener; feed it connections with
    /// [`serve_connection`](Self::serve_connection).
    pub fn new(config: ManagerConfig) -> Self {
        Self::from_parts(None, config, TimerService::new(), true)
    }

    pub(crate) fn from_parts(
        transport: Option<TcpTransport>,
        config: ManagerConfig,
        timer: TimerService,
        owns_timer: bool,
    ) -> Self {
        let config = config.validated();
        let authenticator = authenticator_for(&config.session);
        let local_addr = transport.as_ref().map(TcpTransport::local_addr);
        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new_cyclic(|me| ServerCore {
            me: me.clone(),
            config,
            timer,
            owns_timer,
            authenticator,
            local_addr,
            transport: Mutex::new(transport),
            accept_task: Mutex::new(None),
            sessions: Mutex::new(SessionTable::new()),
            endpoints: Mutex::new(HashMap::new()),
            events: LifecycleBus::new(),
            shutdown_tx,
        });
        Self { core }
    }

    /// The bound listener address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// Spawns the accept loop. Does nothing without a listener or when
    /// already started.
    pub fn start(&self) {
        let Some(transport) = lock(&self.core.transport).take() else {
            debug!("server has no listener to start");
            return;
        };
        let core = Arc::clone(&self.core);
        let task = tokio::spawn(async move { core.accept_loop(transport).await });
        *lock(&self.core.accept_task) = Some(task);
    }

    /// Waits for the accept loop to finish (after [`shutdown`](Self::shutdown)).
    pub async fn join(&self) -> Result<(), PeerbridgeError> {
        let task = lock(&self.core.accept_task).take();
        if let Some(task) = task {
            task.await?;
        }
        Ok(())
    }

    /// Attaches an already-open connection and starts its endpoint.
    ///
    /// # Errors
    /// [`PeerbridgeError::Shutdown`] once the server is shut down.
    pub fn serve_connection(&self, conn: Connection) -> Result<Endpoint, PeerbridgeError> {
        self.core.serve(conn)
    }

    /// Subscribes to session lifecycle events.
    pub fn on<F>(&self, kind: LifecycleKind, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.core.events.on(kind, handler);
    }

    /// Emits an application event to every established session. Returns
    /// how many endpoints accepted it.
    pub fn broadcast<I, S>(&self, name: &str, args: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.established_endpoints()
            .iter()
            .filter(|endpoint| match endpoint.emit(name, args.iter().cloned()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(endpoint = %endpoint.id(), error = %e, "broadcast skipped endpoint");
                    false
                }
            })
            .count()
    }

    /// Endpoints whose session is established, in connection order.
    pub fn established_endpoints(&self) -> Vec<Endpoint> {
        let ids = lock(&self.core.sessions).established_ids();
        let endpoints = lock(&self.core.endpoints);
        ids.iter().filter_map(|id| endpoints.get(id).cloned()).collect()
    }

    /// Number of established sessions.
    pub fn session_count(&self) -> usize {
        lock(&self.core.sessions).established_ids().len()
    }

    /// Number of open endpoints, with or without a session.
    pub fn endpoint_count(&self) -> usize {
        lock(&self.core.endpoints).len()
    }

    pub fn timer(&self) -> &TimerService {
        &self.core.timer
    }

    pub fn is_shut_down(&self) -> bool {
        *self.core.shutdown_tx.borrow()
    }

    /// Stops accepting, closes every endpoint, and releases the timer if
    /// this server owns it. Idempotent.
    pub fn shutdown(&self) {
        if self.core.shutdown_tx.send_replace(true) {
            return;
        }
        info!("server shutting down");
        lock(&self.core.transport).take();

        let endpoints: Vec<Endpoint> = lock(&self.core.endpoints).values().cloned().collect();
        for endpoint in endpoints {
            endpoint.close();
        }
        if self.core.owns_timer {
            self.core.timer.shutdown();
        }
    }
}

impl ServerCore {
    async fn accept_loop<T: Transport>(self: Arc<Self>, mut transport: T) {
        info!(addr = %transport.local_addr(), "server accepting connections");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                () = shut_down(&mut shutdown_rx) => break,
                accepted = transport.accept() => match accepted {
                    Ok(conn) => {
                        if let Err(e) = self.serve(conn) {
                            debug!(error = %e, "dropped connection");
                        }
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
        info!("server stopped accepting");
    }

    fn serve(&self, conn: Connection) -> Result<Endpoint, PeerbridgeError> {
        let Some(me) = self.me.upgrade() else {
            return Err(PeerbridgeError::Shutdown);
        };
        let endpoint = Endpoint::new(conn, me);
        {
            // `shutdown` sets the flag before it collects endpoints under
            // this lock, so an endpoint inserted here is always closed.
            let mut endpoints = lock(&self.endpoints);
            if *self.shutdown_tx.borrow() {
                return Err(PeerbridgeError::Shutdown);
            }
            lock(&self.sessions).insert_pending(endpoint.id());
            endpoints.insert(endpoint.id(), endpoint.clone());
        }
        info!(endpoint = %endpoint.id(), peer = %endpoint.peer(), "serving connection");
        endpoint.start();
        Ok(endpoint)
    }

    /// Marks the session stopped. Returns whether it had been established.
    fn mark_stopped(&self, endpoint: &Endpoint) -> bool {
        lock(&self.sessions).stop(endpoint.id()).unwrap_or(false)
    }

    fn forget(&self, endpoint: &Endpoint) {
        lock(&self.sessions).remove(endpoint.id());
        lock(&self.endpoints).remove(&endpoint.id());
    }

    /// Error path shared by every failure callback.
    fn fail(&self, endpoint: &Endpoint, reason: String) {
        self.mark_stopped(endpoint);
        warn!(endpoint = %endpoint.id(), %reason, "session error");
        self.events
            .emit(LifecycleEvent::SessionError(endpoint.clone(), reason));
        endpoint.close();
    }
}

impl Manager for ServerCore {
    fn endpoint_ready(&self, endpoint: &Endpoint) {
        let session = SessionProtocol::new(
            endpoint.clone(),
            self.timer.clone(),
            self.config.session.clone(),
            Arc::clone(&self.authenticator),
        );
        if let Err(e) = endpoint.start_protocol(session, Role::Server) {
            warn!(endpoint = %endpoint.id(), error = %e, "could not start session protocol");
            endpoint.close();
        }
    }

    fn endpoint_closed(&self, endpoint: &Endpoint) {
        if self.mark_stopped(endpoint) {
            self.events
                .emit(LifecycleEvent::SessionStopped(endpoint.clone()));
        }
        self.forget(endpoint);
    }

    fn endpoint_disconnected_abruptly(&self, endpoint: &Endpoint) {
        self.fail(endpoint, "disconnected abruptly".to_string());
        self.forget(endpoint);
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
        let session_id = endpoint
            .session()
            .and_then(|s| s.session_id())
            .unwrap_or_default();
        if let Err(e) = lock(&self.sessions).establish(endpoint.id(), session_id) {
            warn!(endpoint = %endpoint.id(), error = %e, "session table out of step");
        }
        let keep_alive = KeepAliveProtocol::new(
            endpoint.clone(),
            self.timer.clone(),
            self.config.keep_alive_interval,
        );
        if let Err(e) = endpoint.start_protocol(keep_alive, Role::Server) {
            warn!(endpoint = %endpoint.id(), error = %e, "keep-alive not started");
        }
        if let Err(e) = endpoint.start_protocol(EventProtocol::new(endpoint.clone()), Role::Server)
        {
            debug!(endpoint = %endpoint.id(), error = %e, "event protocol not started");
        }
        self.events
            .emit(LifecycleEvent::SessionStarted(endpoint.clone()));
    }

    fn session_stopped(&self, endpoint: &Endpoint) {
        if self.mark_stopped(endpoint) {
            self.events
                .emit(LifecycleEvent::SessionStopped(endpoint.clone()));
        }
        endpoint.close();
    }

    fn session_rejected(&self, endpoint: &Endpoint, reason: &str) {
        self.fail(endpoint, format!("session rejected: {reason}"));
    }

    fn protocol_requested(&self, endpoint: &Endpoint, kind: ProtocolKind) -> bool {
        if kind == ProtocolKind::Session {
            return false;
        }
        if !lock(&self.sessions).is_established(endpoint.id()) {
            warn!(
                endpoint = %endpoint.id(),
                protocol = %kind,
                "protocol requested before session established"
            );
            return false;
        }
        let protocol = build_protocol(kind, endpoint, &self.timer, &self.config, &self.authenticator);
        match endpoint.start_protocol(protocol, Role::Server) {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %endpoint.id(), protocol = %kind, error = %e, "requested protocol not started");
                false
            }
        }
    }
}

/// Resolves once the shutdown flag is set.
pub(crate) async fn shut_down(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|down| *down).await;
}
