//! Codec trait and the JSON implementation.
//!
//! A codec converts between Rust types and the bytes of one frame. The
//! endpoint is generic over nothing here: it holds a [`JsonCodec`], but the
//! trait keeps the byte format in one place.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to frame bytes and decodes them back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// The output must not contain a raw newline, since frames are
    /// newline-delimited.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or do
    /// not match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses compact JSON (via `serde_json`).
///
/// Compact output escapes newlines inside strings, so every encoded value
/// fits on a single line.
///
/// ## Example
///
/// ```rust
/// use peerbridge_protocol::{
///     Codec, Envelope, JsonCodec, KeepAliveMessage, MessageKind,
///     KEEP_ALIVE_PROTOCOL,
/// };
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new(
///     KEEP_ALIVE_PROTOCOL,
///     MessageKind::Request,
///     &KeepAliveMessage::KeepAliveRequest,
/// )
/// .unwrap();
///
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
