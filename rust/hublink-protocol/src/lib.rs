//! hublink protocol wire types.
//!
//! This crate defines the canonical message vocabulary shared by the engine
//! (`hublink-core`) and anything that speaks the wire format directly, such
//! as test peers. It contains no I/O and no engine logic: just the closed set
//! of protocol messages, their integer type tags, and the handshake records
//! exchanged before any message traffic.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record separator terminating handshake frames (ASCII RS).
///
/// Handshake records are JSON text followed by this byte. Messages proper are
/// framed by the duplex channel, but a peer may terminate them with the same
/// separator; decoders strip it.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Integer type tags carried in each serialized message envelope.
///
/// Codec implementations map this tag space 1:1 with [`Message`].
pub mod message_type {
    /// Unary or fire-and-forget call request.
    pub const INVOCATION: u8 = 1;
    /// One element of a streaming result.
    pub const STREAM_ITEM: u8 = 2;
    /// Terminal outcome of an invocation.
    pub const COMPLETION: u8 = 3;
    /// Call request whose result is a sequence.
    pub const STREAM_INVOCATION: u8 = 4;
    /// Request to stop a streaming call.
    pub const CANCEL_INVOCATION: u8 = 5;
    /// Keepalive probe, no reply required.
    pub const PING: u8 = 6;
    /// Graceful or abrupt termination notice.
    pub const CLOSE: u8 = 7;
}

/// A protocol message.
///
/// Every message that crosses the wire after the handshake is one of these
/// variants. Arguments and results are schemaless [`Value`]s; binding them to
/// concrete types is the caller's concern.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Invoke a named target on the peer.
    ///
    /// `invocation_id` is absent for fire-and-forget sends that expect no
    /// completion.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },
    /// One element of the streaming result for `invocation_id`.
    StreamItem { invocation_id: String, item: Value },
    /// Terminal outcome for `invocation_id`.
    ///
    /// At most one of `result`/`error` is present; both absent means a void
    /// success. Nothing may follow a completion for the same id.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Invoke a named target whose result is a sequence of [`Message::StreamItem`]s.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },
    /// Ask the peer to stop the streaming call `invocation_id`.
    CancelInvocation { invocation_id: String },
    /// Keepalive. Either side may send it; no reply is required.
    Ping,
    /// Termination notice.
    ///
    /// `allow_reconnect` tells the receiver whether reconnecting is worth
    /// attempting; it defaults to `false` when absent on the wire.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl Message {
    /// The integer tag identifying this variant on the wire.
    pub fn type_tag(&self) -> u8 {
        match self {
            Message::Invocation { .. } => message_type::INVOCATION,
            Message::StreamItem { .. } => message_type::STREAM_ITEM,
            Message::Completion { .. } => message_type::COMPLETION,
            Message::StreamInvocation { .. } => message_type::STREAM_INVOCATION,
            Message::CancelInvocation { .. } => message_type::CANCEL_INVOCATION,
            Message::Ping => message_type::PING,
            Message::Close { .. } => message_type::CLOSE,
        }
    }

    /// The invocation id this message correlates to, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Message::Invocation { invocation_id, .. } => invocation_id.as_deref(),
            Message::StreamItem { invocation_id, .. }
            | Message::Completion { invocation_id, .. }
            | Message::StreamInvocation { invocation_id, .. }
            | Message::CancelInvocation { invocation_id } => Some(invocation_id),
            Message::Ping | Message::Close { .. } => None,
        }
    }
}

/// Handshake request, sent by the initiating side as the first bytes on a
/// freshly established physical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Name of the codec the initiator wants to speak, e.g. `"json"`.
    pub protocol: String,
    /// Version of that codec.
    pub version: u32,
}

/// Handshake response. An empty record means the peer accepted the requested
/// codec; `error` carries the rejection reason otherwise.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// A successful (empty) response.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A rejection carrying `error`.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}
