//! Byte-stream channel with length-prefixed frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::TransportError;

use super::DuplexChannel;

/// Frames larger than this are treated as stream corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A duplex channel over any ordered byte stream (TCP socket, Unix socket,
/// in-process duplex pipe).
///
/// The stream itself has no message boundaries, so each frame goes on the
/// wire as a u32 little-endian length followed by the frame body.
#[derive(Clone)]
pub struct StreamChannel {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    aborted: AtomicBool,
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel").finish_non_exhaustive()
    }
}

impl StreamChannel {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Build from separate read and write halves (stdin/stdout, split TCP).
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                aborted: AtomicBool::new(false),
            }),
        }
    }

    /// Create a linked pair over an in-process duplex pipe.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }
}

impl DuplexChannel for StreamChannel {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.inner.aborted.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::Io {
                kind: std::io::ErrorKind::InvalidInput,
                message: format!("frame of {} bytes exceeds maximum", frame.len()),
            });
        }

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        if self.inner.aborted.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // EOF at a frame boundary is an orderly close.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let frame_len = u32::from_le_bytes(len_buf) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(TransportError::Io {
                kind: std::io::ErrorKind::InvalidData,
                message: format!("frame length {frame_len} exceeds maximum"),
            });
        }

        let mut body = vec![0u8; frame_len];
        reader.read_exact(&mut body).await?;
        Ok(Some(Bytes::from(body)))
    }

    fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }
}
