//! Manager configuration.

use std::time::Duration;

use peerbridge_session::SessionConfig;
use tracing::warn;

/// Bounded-retry reconnection policy for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Failed dial attempts tolerated before giving up for good.
    ///
    /// Default: 10.
    pub max_retries: u32,

    /// Fixed wait between failed attempts. Default: 5 seconds.
    pub backoff: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 10;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

    /// Ensures at least one attempt is made.
    pub fn validated(mut self) -> Self {
        if self.max_retries == 0 {
            warn!("max_retries of zero would never dial, using 1");
            self.max_retries = 1;
        }
        self
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Configuration shared by client and server managers.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Session handshake settings (secret, timeout).
    pub session: SessionConfig,

    /// How often keep-alive checks run. Default: 20 seconds.
    pub keep_alive_interval: Duration,

    /// Client reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            keep_alive_interval: Self::DEFAULT_KEEP_ALIVE_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

    /// Default config with the given shared secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            session: SessionConfig::with_secret(secret),
            ..Self::default()
        }
    }

    /// Clamp and fix any out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        self.session = self.session.validated();
        if self.keep_alive_interval.is_zero() {
            self.keep_alive_interval = Self::DEFAULT_KEEP_ALIVE_INTERVAL;
        }
        self.reconnect = self.reconnect.validated();
        self
    }
}
