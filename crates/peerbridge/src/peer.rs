//! `PeerManager`: a peer that both accepts and opens connections.
//!
//! One [`ServerManager`] plus any number of [`ClientManager`]s, all sharing
//! a single timer service. Session events from either direction are
//! republished as `PeerStarted` / `PeerStopped` / `PeerError`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use peerbridge_timer::TimerService;
use peerbridge_transport::{Dialer, TcpDialer, TcpTransport};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::events::{LifecycleBus, LifecycleEvent, LifecycleKind};
use crate::{ClientManager, PeerbridgeError, ServerManager, lock};

const SESSION_KINDS: [LifecycleKind; 3] = [
    LifecycleKind::SessionStarted,
    LifecycleKind::SessionStopped,
    LifecycleKind::SessionError,
];

/// Accepts inbound peers and connects to outbound ones.
pub struct PeerManager<D: Dialer + Clone = TcpDialer> {
    server: ServerManager,
    config: ManagerConfig,
    dialer: D,
    timer: TimerService,
    timer_released: AtomicBool,
    clients: Mutex<Vec<ClientManager<D>>>,
    events: Arc<LifecycleBus>,
}

impl PeerManager<TcpDialer> {
    /// Binds the inbound listener; outbound connections use TCP.
    pub async fn bind(addr: &str, config: ManagerConfig) -> Result<Self, PeerbridgeError> {
        let transport = TcpTransport::bind(addr).await?;
        Ok(Self::from_parts(Some(transport), config, TcpDialer))
    }
}

impl<D: Dialer + Clone> PeerManager<D> {
    /// A peer without a listener whose outbound connections use `dialer`.
    pub fn with_dialer(config: ManagerConfig, dialer: D) -> Self {
        Self::from_parts(None, config, dialer)
    }

    fn from_parts(transport: Option<TcpTransport>, config: ManagerConfig, dialer: D) -> Self {
        let timer = TimerService::new();
        let server = ServerManager::from_parts(transport, config.clone(), timer.clone(), false);
        let events = Arc::new(LifecycleBus::new());
        for kind in SESSION_KINDS {
            let events = Arc::clone(&events);
            server.on(kind, move |event| events.emit(event.clone().into_peer()));
        }
        Self {
            server,
            config,
            dialer,
            timer,
            timer_released: AtomicBool::new(false),
            clients: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Starts accepting inbound peers.
    pub fn start(&self) {
        self.server.start();
    }

    /// The inbound server.
    pub fn server(&self) -> &ServerManager {
        &self.server
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn timer(&self) -> &TimerService {
        &self.timer
    }

    /// Creates a client for `host:port` sharing this peer's timer.
    ///
    /// The client is returned unstarted so callers can subscribe first;
    /// call [`ClientManager::start`] to connect.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> ClientManager<D> {
        let host = host.into();
        let client = ClientManager::from_parts(
            host.clone(),
            port,
            self.config.clone(),
            self.dialer.clone(),
            self.timer.clone(),
            false,
        );
        for kind in SESSION_KINDS {
            let events = Arc::clone(&self.events);
            client.on(kind, move |event| events.emit(event.clone().into_peer()));
        }
        lock(&self.clients).push(client.clone());
        debug!(%host, port, "outbound peer registered");
        client
    }

    /// Subscribes to peer events (`Peer*` kinds).
    pub fn on<F>(&self, kind: LifecycleKind, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler);
    }

    /// Waits for every outbound connection to end.
    ///
    /// # Errors
    /// The first client failure, after all clients have finished.
    pub async fn join_with_client_managers(&self) -> Result<(), PeerbridgeError> {
        let clients = lock(&self.clients).clone();
        let mut first_error = None;
        for client in clients {
            if let Err(e) = client.join().await {
                warn!(host = %client.host(), port = client.port(), error = %e, "outbound peer failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Waits for the inbound accept loop to finish.
    pub async fn join(&self) -> Result<(), PeerbridgeError> {
        self.server.join().await
    }

    /// Closes the listener and every endpoint, inbound and outbound, then
    /// releases the shared timer. Idempotent.
    pub fn shutdown(&self) {
        if self.timer_released.load(Ordering::Acquire) {
            return;
        }
        info!("peer shutting down");
        self.server.shutdown();
        let clients = lock(&self.clients).clone();
        for client in &clients {
            client.shutdown();
        }
        if !self.timer_released.swap(true, Ordering::AcqRel) {
            self.timer.shutdown();
        }
    }
}
