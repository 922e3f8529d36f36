//! Wire protocol for peerbridge.
//!
//! This crate defines what travels on a connection:
//!
//! - **Types** ([`Envelope`], [`MessageKind`], [`ProtocolKind`] and the
//!   payload enums): one envelope per line, routed by protocol name.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how envelopes are
//!   converted to and from bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (lines) → Protocol (Envelope) → Endpoint (routes by name)
//! ```
//!
//! The protocol layer knows nothing about connections or sessions; it only
//! knows the shape of the messages.

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod error;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    EVENT_PROTOCOL, Envelope, EventMessage, KEEP_ALIVE_PROTOCOL, KeepAliveMessage,
    MessageKind, ProtocolKind, SESSION_PROTOCOL, SessionMessage,
};
