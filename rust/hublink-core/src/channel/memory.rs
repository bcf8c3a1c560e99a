//! In-memory channel pair.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{Notify, mpsc};

use crate::error::TransportError;

use super::DuplexChannel;

const CHANNEL_CAPACITY: usize = 64;

/// One end of a linked in-memory channel pair.
///
/// Frames sent on one end are received on the other. Dropping or aborting an
/// end closes the peer's receive side; locally, an aborted end fails with
/// [`TransportError::Closed`].
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    aborted: AtomicBool,
    abort_signal: Notify,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("aborted", &self.aborted.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl MemoryChannel {
    /// Create a linked pair.
    pub fn pair() -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_ba, rx_ba) = mpsc::channel(CHANNEL_CAPACITY);
        (Self::end(tx_ab, rx_ba), Self::end(tx_ba, rx_ab))
    }

    fn end(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            aborted: AtomicBool::new(false),
            abort_signal: Notify::new(),
        }
    }
}

impl DuplexChannel for MemoryChannel {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let sender = self.tx.lock().clone();
        match sender {
            Some(sender) => sender.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = self.abort_signal.notified() => Err(TransportError::Closed),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        // Severs the outbound direction so the peer observes the closure,
        // and wakes a parked local receive. notify_one stores a permit to
        // cover the race with a receiver that has not parked yet; the engine
        // is the only reader per channel.
        *self.tx.lock() = None;
        self.abort_signal.notify_one();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}
