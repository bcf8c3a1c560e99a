//! Invocation registry.
//!
//! Tracks every outstanding call by invocation id and correlates completions
//! and stream items back to their callers. The map is the one structure
//! touched by both the caller side (register, cancel) and the receive loop
//! (complete, push items, fail-all), so every access goes through the
//! internal mutex; no lock is ever held across an await.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::HubError;

/// What kind of result a pending call expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Single result delivered by one completion.
    Unary,
    /// Zero or more stream items followed by one completion.
    Stream,
}

enum Sink {
    Unary(oneshot::Sender<Result<Value, HubError>>),
    Stream(mpsc::Sender<Result<Value, HubError>>),
}

struct PendingCall {
    sink: Sink,
    /// Set by a local cancel: items stop flowing to the consumer, but the
    /// entry stays until the remote's completion (or connection loss) is
    /// observed.
    cancelled: bool,
}

impl PendingCall {
    fn kind(&self) -> InvocationKind {
        match self.sink {
            Sink::Unary(_) => InvocationKind::Unary,
            Sink::Stream(_) => InvocationKind::Stream,
        }
    }
}

/// Registry of outstanding calls for one logical connection.
pub struct InvocationRegistry {
    entries: Mutex<HashMap<String, PendingCall>>,
    max_outstanding: usize,
}

impl InvocationRegistry {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_outstanding,
        }
    }

    /// Register a unary call and hand back the receiver its completion will
    /// resolve.
    pub fn register_unary(
        &self,
        invocation_id: &str,
    ) -> Result<oneshot::Receiver<Result<Value, HubError>>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.insert(invocation_id, Sink::Unary(tx))?;
        Ok(rx)
    }

    /// Register a streaming call with a bounded item buffer.
    ///
    /// When the buffer is full, [`InvocationRegistry::push_stream_item`]
    /// suspends its caller (the receive loop) until the consumer drains.
    pub fn register_stream(
        &self,
        invocation_id: &str,
        buffer_capacity: usize,
    ) -> Result<mpsc::Receiver<Result<Value, HubError>>, HubError> {
        let (tx, rx) = mpsc::channel(buffer_capacity.max(1));
        self.insert(invocation_id, Sink::Stream(tx))?;
        Ok(rx)
    }

    fn insert(&self, invocation_id: &str, sink: Sink) -> Result<(), HubError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_outstanding {
            tracing::warn!(
                outstanding = entries.len(),
                max_outstanding = self.max_outstanding,
                "too many outstanding invocations; refusing new call"
            );
            return Err(HubError::InvalidOperation(
                "too many outstanding invocations".into(),
            ));
        }
        if entries.contains_key(invocation_id) {
            return Err(HubError::DuplicateId(invocation_id.to_owned()));
        }
        entries.insert(
            invocation_id.to_owned(),
            PendingCall {
                sink,
                cancelled: false,
            },
        );
        tracing::debug!(
            invocation_id,
            outstanding = entries.len(),
            "registered pending call"
        );
        Ok(())
    }

    /// Resolve and remove the call `invocation_id`.
    ///
    /// An unknown id is a remote protocol anomaly, logged and ignored. For a
    /// streaming call the terminal error (if any) is delivered in stream
    /// order, behind any buffered items.
    pub async fn complete(&self, invocation_id: &str, outcome: Result<Option<Value>, String>) {
        let entry = self.entries.lock().remove(invocation_id);
        let Some(entry) = entry else {
            tracing::warn!(invocation_id, "completion for unknown invocation");
            return;
        };

        tracing::debug!(
            invocation_id,
            kind = ?entry.kind(),
            ok = outcome.is_ok(),
            "completing invocation"
        );

        match entry.sink {
            Sink::Unary(tx) => {
                let result = match outcome {
                    Ok(value) => Ok(value.unwrap_or(Value::Null)),
                    Err(error) => Err(HubError::Server(error)),
                };
                let _ = tx.send(result);
            }
            Sink::Stream(tx) => {
                if entry.cancelled {
                    // Consumer already walked away; this completion only
                    // releases the entry.
                    return;
                }
                if let Err(error) = outcome {
                    let _ = tx.send(Err(HubError::Server(error))).await;
                }
                // Dropping the sender ends the stream for the consumer.
            }
        }
    }

    /// Deliver one stream item, suspending when the consumer's buffer is
    /// full. Head-of-line blocking across ids is deliberate: the one receive
    /// loop preserves total wire order instead of buffering without bound.
    pub async fn push_stream_item(&self, invocation_id: &str, item: Value) {
        let sender = {
            let entries = self.entries.lock();
            match entries.get(invocation_id) {
                Some(entry) if entry.cancelled => {
                    tracing::debug!(invocation_id, "dropping item for cancelled invocation");
                    return;
                }
                Some(PendingCall {
                    sink: Sink::Stream(tx),
                    ..
                }) => tx.clone(),
                Some(_) => {
                    tracing::warn!(invocation_id, "stream item for unary invocation");
                    return;
                }
                None => {
                    tracing::warn!(invocation_id, "stream item for unknown invocation");
                    return;
                }
            }
        };

        if sender.send(Ok(item)).await.is_err() {
            // Consumer dropped its receiver; stop delivering without waiting
            // for the remote to notice the cancellation.
            if let Some(entry) = self.entries.lock().get_mut(invocation_id) {
                entry.cancelled = true;
            }
            tracing::debug!(invocation_id, "stream consumer gone; suppressing items");
        }
    }

    /// Mark `invocation_id` so no further items reach its consumer. Returns
    /// whether the call was outstanding and not already cancelled (i.e.
    /// whether a cancellation should go on the wire). The entry itself is
    /// removed only by the remote's completion or by connection loss.
    pub fn cancel_locally(&self, invocation_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(invocation_id) {
            Some(entry) if !entry.cancelled => {
                entry.cancelled = true;
                tracing::debug!(invocation_id, "invocation cancelled locally");
                true
            }
            _ => false,
        }
    }

    /// Fail every outstanding call with a connection-lost error. Invoked
    /// exactly once per disconnect; nothing is left unresolved.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(String, PendingCall)> = self.entries.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::debug!(
            count = drained.len(),
            reason,
            "failing all outstanding invocations"
        );
        for (invocation_id, entry) in drained {
            let error = HubError::lost(reason);
            match entry.sink {
                Sink::Unary(tx) => {
                    let _ = tx.send(Err(error));
                }
                Sink::Stream(tx) => {
                    if entry.cancelled {
                        continue;
                    }
                    // The consumer may be slow; park the terminal error on a
                    // task rather than stalling the disconnect path.
                    tokio::spawn(async move {
                        let _ = tx.send(Err(error)).await;
                        let _ = invocation_id;
                    });
                }
            }
        }
    }

    /// Drop the entry for `invocation_id` without resolving it. Used when a
    /// caller abandons a call before it settles (future dropped, send never
    /// made it onto the wire).
    pub fn remove(&self, invocation_id: &str) -> bool {
        self.entries.lock().remove(invocation_id).is_some()
    }

    /// Number of outstanding calls (diagnostics and tests).
    pub fn outstanding(&self) -> usize {
        self.entries.lock().len()
    }
}
