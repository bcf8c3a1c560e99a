#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

// Re-export the engine surface.
pub use hublink_core::{
    AnyChannel,
    ChannelFactory,
    ConnectionConfig,
    ConnectionState,
    DispatchMap,
    Dispatcher,
    DuplexChannel,
    DynDuplexChannel,
    Handler,
    HandlerResult,
    HubCodec,
    HubConnection,
    HubError,
    HandshakeError,
    InvocationRegistry,
    JsonCodec,
    MemoryChannel,
    ProtocolError,
    ReconnectPolicy,
    StreamChannel,
    StreamHandler,
    StreamingCall,
    TransportError,
    UnaryHandler,
    encode_handshake_request,
    encode_handshake_response,
    parse_handshake_request,
    parse_handshake_response,
    split_records,
};

// Wire-level types, for anyone speaking the protocol directly.
pub use hublink_protocol::{
    HandshakeRequest, HandshakeResponse, Message, RECORD_SEPARATOR, message_type,
};

// Stream combinators for consuming streamed results.
pub use hublink_core::StreamExt;
