//! Error types for the protocol layer.
//!
//! A `ProtocolError` always means the problem is in turning envelopes into
//! bytes or back, never in networking or session policy.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, a missing `protocol` or `type`
    /// field, or a payload that does not match the expected shape.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but is not a valid envelope.
    ///
    /// For example a payload that serializes to something other than a
    /// JSON object, so it cannot be flattened into the envelope.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
