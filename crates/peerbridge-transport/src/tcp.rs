//! TCP listener and dialer.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::{Connection, Dialer, Transport, TransportError};

/// A TCP [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Binds a new listener to the given address.
    ///
    /// Use port `0` to let the OS pick a free port, then read it back
    /// with [`TcpTransport::local_addr`].
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        let local_addr = listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(%local_addr, "TCP transport listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for TcpTransport {
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        let conn = Connection::from_tcp(stream)?;
        tracing::debug!(id = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Dials peers over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Connection, TransportError> {
        let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(
            |source| TransportError::UnknownHost {
                host: host.to_string(),
                source,
            },
        )?;
        let addr = addrs.next().ok_or_else(|| TransportError::UnknownHost {
            host: host.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses resolved",
            ),
        })?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::ConnectFailed)?;
        let conn = Connection::from_tcp(stream)?;
        tracing::debug!(id = %conn.id(), %addr, "dialed TCP connection");
        Ok(conn)
    }
}
