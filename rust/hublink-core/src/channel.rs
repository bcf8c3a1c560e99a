//! Duplex channel abstraction.
//!
//! The [`DuplexChannel`] trait is the entire contract the engine requires
//! from a transport: send one byte-message frame, receive the next frame (or
//! learn the channel closed), and force-close. A channel instance represents
//! exactly one physical connection attempt and is not restartable; the
//! reconnection controller opens a fresh instance per attempt.
//!
//! Transport selection and fallback ordering live outside the engine; the
//! implementations in this module exist for same-process wiring and tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;

/// Contract between the engine and a concrete transport.
///
/// Async methods use return-position impl-trait so a known concrete channel
/// monomorphizes with no dispatch overhead; wrap in [`AnyChannel`] when the
/// channel type is only known at runtime.
pub trait DuplexChannel: Send + Sync + 'static {
    /// Send one frame. Fails with [`TransportError`] on write failure or
    /// after the channel is closed.
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send + '_;

    /// Receive the next frame. `Ok(None)` means the peer closed the channel
    /// in an orderly way; errors mean abrupt failure. After either, the
    /// channel yields nothing further.
    fn recv(&self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send + '_;

    /// Force-close the channel. Subsequent sends and receives fail with
    /// [`TransportError::Closed`].
    fn abort(&self);

    /// Whether [`DuplexChannel::abort`] has been called.
    fn is_aborted(&self) -> bool;
}

/// Object-safe version of [`DuplexChannel`] for dynamic dispatch.
pub trait DynDuplexChannel: Send + Sync + 'static {
    fn send_dyn(
        &self,
        frame: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn recv_dyn(&self)
    -> Pin<Box<dyn Future<Output = Result<Option<Bytes>, TransportError>> + Send + '_>>;

    fn abort(&self);

    fn is_aborted(&self) -> bool;
}

impl<C: DuplexChannel> DynDuplexChannel for C {
    fn send_dyn(
        &self,
        frame: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send(frame))
    }

    fn recv_dyn(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>, TransportError>> + Send + '_>> {
        Box::pin(self.recv())
    }

    fn abort(&self) {
        DuplexChannel::abort(self)
    }

    fn is_aborted(&self) -> bool {
        DuplexChannel::is_aborted(self)
    }
}

/// Type-erased channel wrapper.
///
/// One vtable indirection over the concrete channel; negligible next to the
/// I/O it fronts.
#[derive(Clone)]
pub struct AnyChannel {
    inner: Arc<dyn DynDuplexChannel>,
}

impl std::fmt::Debug for AnyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyChannel")
            .field("is_aborted", &self.inner.is_aborted())
            .finish_non_exhaustive()
    }
}

impl AnyChannel {
    /// Wrap any [`DuplexChannel`] implementation.
    pub fn new<C: DuplexChannel>(channel: C) -> Self {
        Self {
            inner: Arc::new(channel),
        }
    }

    /// Create a linked in-memory channel pair.
    pub fn memory_pair() -> (Self, Self) {
        let (a, b) = memory::MemoryChannel::pair();
        (Self::new(a), Self::new(b))
    }

    /// Create a channel over any `AsyncRead + AsyncWrite` byte stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::new(stream::StreamChannel::new(stream))
    }

    /// Create a linked pair of stream channels for tests.
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamChannel::pair();
        (Self::new(a), Self::new(b))
    }
}

impl DuplexChannel for AnyChannel {
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
        self.inner.send_dyn(frame)
    }

    fn recv(&self) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send + '_ {
        self.inner.recv_dyn()
    }

    fn abort(&self) {
        self.inner.abort()
    }

    fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }
}

pub mod memory;
pub mod stream;

pub use memory::MemoryChannel;
pub use stream::StreamChannel;
