//! Authentication hook for session start.
//!
//! The only credential on the wire is the optional secret carried by
//! `SessionStart`. It is compared once when the session opens; there is no
//! cryptographic handshake.
//!
//! [`Authenticator`] is the seam: [`SharedSecret`] and [`OpenAccess`] cover
//! the built-in policies, and servers can plug in their own.

use std::sync::Arc;

use crate::{SessionConfig, SessionError};

/// Decides whether a client may open a session.
///
/// Called on the endpoint's receive pump, so it must not block.
///
/// # Example
///
/// ```rust
/// use peerbridge_session::{Authenticator, SessionError};
///
/// /// Accepts any secret from a fixed allow-list.
/// struct AllowList(Vec<String>);
///
/// impl Authenticator for AllowList {
///     fn authenticate(&self, secret: Option<&str>) -> Result<(), SessionError> {
///         match secret {
///             Some(s) if self.0.iter().any(|a| a == s) => Ok(()),
///             _ => Err(SessionError::AuthFailed("not on the list".into())),
///         }
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates the secret presented by the client, if any.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] with a reason to send back to the
    /// client.
    fn authenticate(&self, secret: Option<&str>) -> Result<(), SessionError>;
}

/// Accepts every client, with or without a secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl Authenticator for OpenAccess {
    fn authenticate(&self, _secret: Option<&str>) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Requires the client to present exactly this secret.
#[derive(Clone)]
pub struct SharedSecret(String);

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl Authenticator for SharedSecret {
    fn authenticate(&self, secret: Option<&str>) -> Result<(), SessionError> {
        match secret {
            Some(s) if s == self.0 => Ok(()),
            Some(_) => Err(SessionError::AuthFailed("incorrect secret".into())),
            None => Err(SessionError::AuthFailed("secret required".into())),
        }
    }
}

/// The authenticator implied by a session config.
pub fn authenticator_for(config: &SessionConfig) -> Arc<dyn Authenticator> {
    match &config.secret {
        Some(secret) => Arc::new(SharedSecret::new(secret.clone())),
        None => Arc::new(OpenAccess),
    }
}
