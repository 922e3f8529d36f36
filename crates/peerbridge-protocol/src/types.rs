//! Wire types: the envelope and the payloads of the built-in protocols.
//!
//! Every line on a connection is one JSON object:
//!
//! ```text
//! {"protocol":"KeepAliveProtocol","type":"request","payload":"KeepAliveRequest"}
//! ```
//!
//! `protocol` routes the envelope to a protocol instance on the receiving
//! endpoint, `type` selects request or reply handling, and `payload` names
//! the message within that protocol. Any further fields belong to the
//! payload and sit beside those three at the top level.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// Wire name of the session protocol.
pub const SESSION_PROTOCOL: &str = "SessionProtocol";
/// Wire name of the keep-alive protocol.
pub const KEEP_ALIVE_PROTOCOL: &str = "KeepAliveProtocol";
/// Wire name of the application event protocol.
pub const EVENT_PROTOCOL: &str = "EventProtocol";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Whether an envelope starts an exchange or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Reply,
}

/// The unit of transmission.
///
/// The payload is kept as an untyped JSON map so the endpoint can route an
/// envelope without knowing the payload types of every protocol; the
/// protocol that receives it decodes it with [`Envelope::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Name of the destination protocol.
    pub protocol: String,

    /// Request or reply.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// The payload's tag (`"payload"`) and its fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Builds an envelope carrying `payload` for `protocol`.
    ///
    /// # Errors
    /// - [`ProtocolError::Encode`] if the payload fails to serialize
    /// - [`ProtocolError::InvalidMessage`] if it is not a JSON object
    pub fn new<P: Serialize>(
        protocol: impl Into<String>,
        kind: MessageKind,
        payload: &P,
    ) -> Result<Self, ProtocolError> {
        let fields = match serde_json::to_value(payload)
            .map_err(ProtocolError::Encode)?
        {
            Value::Object(map) => map,
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "payload must be an object, got {other}"
                )));
            }
        };
        Ok(Self {
            protocol: protocol.into(),
            kind,
            fields,
        })
    }

    /// Decodes the payload fields as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(ProtocolError::Decode)
    }

    /// The payload tag, if present.
    pub fn payload_type(&self) -> Option<&str> {
        self.fields.get("payload").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// ProtocolKind
// ---------------------------------------------------------------------------

/// The built-in protocols, identified by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Session,
    KeepAlive,
    Event,
}

impl ProtocolKind {
    /// The name used in the envelope's `protocol` field.
    pub fn name(self) -> &'static str {
        match self {
            Self::Session => SESSION_PROTOCOL,
            Self::KeepAlive => KEEP_ALIVE_PROTOCOL,
            Self::Event => EVENT_PROTOCOL,
        }
    }

    /// Looks up a built-in protocol by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            SESSION_PROTOCOL => Some(Self::Session),
            KEEP_ALIVE_PROTOCOL => Some(Self::KeepAlive),
            EVENT_PROTOCOL => Some(Self::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Session establishment and teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payload")]
pub enum SessionMessage {
    /// Client → server: open a session, optionally presenting a secret.
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },

    /// Server → client: the outcome of a `SessionStart`.
    SessionStartAck {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Either side: end the session.
    SessionStop,

    /// Answer to `SessionStop`.
    SessionStopAck,
}

/// Liveness heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payload")]
pub enum KeepAliveMessage {
    KeepAliveRequest,
    KeepAliveReply,
}

/// Named application events with string arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payload")]
pub enum EventMessage {
    /// Carries one emitted event to the peer.
    Event {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// Acknowledges receipt of an event.
    EventAck { name: String },
}
