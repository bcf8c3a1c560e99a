#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

mod channel;
mod codec;
mod config;
mod connection;
mod dispatch;
mod error;
mod registry;

pub use channel::*;
pub use codec::*;
pub use config::*;
pub use connection::*;
pub use dispatch::*;
pub use error::*;
pub use registry::*;

// Re-export the wire types; engine callers routinely need them.
pub use hublink_protocol::{
    HandshakeRequest, HandshakeResponse, Message, RECORD_SEPARATOR, message_type,
};

// Re-export stream combinators for consumers of streaming calls.
pub use futures_util::StreamExt;
