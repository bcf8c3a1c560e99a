//! Error taxonomy.
//!
//! Each failure class gets its own type so callers branch on variants rather
//! than matching message strings. [`HubError`] is the top-level error surfaced
//! by caller-facing operations.

use core::fmt;

/// A malformed or unexpected frame.
///
/// Fatal to the physical channel it arrived on, never to the process: the
/// receive loop converts it into the same disconnect path as a transport
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The envelope carried a type tag outside the known tag space.
    UnknownMessageType(u8),
    /// A known message was missing a required field.
    MissingField {
        message_type: u8,
        field: &'static str,
    },
    /// The frame could not be parsed at all, or violated an envelope rule.
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMessageType(tag) => write!(f, "unknown message type {tag}"),
            Self::MissingField {
                message_type,
                field,
            } => {
                write!(f, "message type {message_type} missing field '{field}'")
            }
            Self::Malformed(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Handshake negotiation failure. Fails `start()`; the engine never retries
/// a failed handshake on the same physical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The peer rejected the requested codec.
    Rejected(String),
    /// No response arrived within the configured handshake timeout.
    Timeout,
    /// The response could not be parsed.
    Malformed(String),
    /// The channel failed before the exchange completed.
    Transport(TransportError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "handshake rejected by peer: {reason}"),
            Self::Timeout => write!(f, "handshake timed out"),
            Self::Malformed(msg) => write!(f, "malformed handshake response: {msg}"),
            Self::Transport(e) => write!(f, "handshake transport failure: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for HandshakeError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// I/O failure on the duplex channel. Triggers the disconnect/reconnect path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel is closed or aborted.
    Closed,
    /// An underlying I/O operation failed.
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Io { kind, message } => write!(f, "I/O error ({kind:?}): {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Top-level error for caller-facing operations.
#[derive(Debug, Clone, PartialEq)]
pub enum HubError {
    /// A malformed or unexpected frame (see [`ProtocolError`]).
    Protocol(ProtocolError),
    /// Negotiation failed (see [`HandshakeError`]).
    Handshake(HandshakeError),
    /// The duplex channel failed (see [`TransportError`]).
    Transport(TransportError),
    /// Caller misuse: operation issued in a state that does not permit it.
    InvalidOperation(String),
    /// An invocation id was registered twice. Internal invariant violation,
    /// not user-recoverable.
    DuplicateId(String),
    /// The connection was lost (or reconnection attempts were exhausted)
    /// while this call was outstanding.
    ConnectionLost { reason: String },
    /// The remote completed an invocation with an error.
    Server(String),
}

impl HubError {
    pub(crate) fn not_active() -> Self {
        Self::InvalidOperation("the connection is not active".into())
    }

    pub(crate) fn lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Handshake(e) => write!(f, "handshake error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Self::DuplicateId(id) => write!(f, "invocation id '{id}' already outstanding"),
            Self::ConnectionLost { reason } => write!(f, "connection lost: {reason}"),
            Self::Server(msg) => write!(f, "server error: {msg}"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::Handshake(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for HubError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<HandshakeError> for HubError {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e)
    }
}

impl From<TransportError> for HubError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failure_class() {
        let e = HubError::from(ProtocolError::UnknownMessageType(9));
        assert_eq!(e.to_string(), "protocol error: unknown message type 9");

        let e = HubError::lost("server timeout");
        assert_eq!(e.to_string(), "connection lost: server timeout");
    }

    #[test]
    fn io_errors_preserve_their_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let e = TransportError::from(io);
        match e {
            TransportError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::BrokenPipe),
            other => panic!("expected Io, got {other:?}"),
        }
    }
}
