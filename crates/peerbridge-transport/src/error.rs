/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The host name could not be resolved to any address.
    #[error("unknown host {host}: {source}")]
    UnknownHost {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Dialing a resolved address failed (refused, reset, unreachable).
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// A peer sent a line longer than the frame limit.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// A peer sent a line that is not valid UTF-8.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether retrying the same dial can never succeed.
    ///
    /// An unresolvable host is fatal; refused or reset connections are
    /// transient and worth another attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownHost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fatal_unknown_host_only() {
        let unknown = TransportError::UnknownHost {
            host: "nowhere.invalid".into(),
            source: std::io::Error::other("no such host"),
        };
        let refused = TransportError::ConnectFailed(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ));
        assert!(unknown.is_fatal());
        assert!(!refused.is_fatal());
        assert!(!TransportError::Shutdown.is_fatal());
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = TransportError::FrameTooLarge { limit: 16 };
        assert_eq!(err.to_string(), "frame exceeds 16 bytes");
    }
}
