//! HubConnection: a persistent, bidirectional invocation channel that owns
//! one physical duplex channel at a time.
//!
//! The key invariant is that each physical channel has exactly one reader
//! (the receive loop) and one logically serialized writer (the send gate).
//! All frame routing happens through the invocation registry or the injected
//! dispatcher:
//!
//! ```text
//!                      ┌────────────────────────────────┐
//!                      │         HubConnection          │
//!                      ├────────────────────────────────┤
//!                      │  link: current physical channel│
//!                      │  registry: id -> pending call  │
//!                      │  dispatcher: name -> callable  │
//!                      └──────────────┬─────────────────┘
//!                                     │
//!                               receive loop
//!                                     │
//!        ┌────────────────────────────┼────────────────────────────┐
//!        │                            │                            │
//!  completion/item?           invocation from peer?         close/failure?
//!        │                            │                            │
//! ┌──────▼───────┐        ┌───────────▼───────────┐   ┌────────────▼───────────┐
//! │ Resolve the  │        │ Spawn handler, funnel │   │ Fail all pending calls,│
//! │ pending call │        │ completion/items back │   │ reconnect per policy   │
//! └──────────────┘        │ through the send gate │   └────────────────────────┘
//!                         └───────────────────────┘
//! ```
//!
//! Lifecycle transitions (`start`/`stop`/failure) are serialized by one
//! exclusive async gate, so a failure detected by the receive loop can never
//! race a concurrent `stop()` into an inconsistent state.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::time::{MissedTickBehavior, timeout};

use hublink_protocol::Message;

use crate::channel::{AnyChannel, DuplexChannel};
use crate::codec::{self, HubCodec};
use crate::config::ConnectionConfig;
use crate::dispatch::{Dispatcher, Handler};
use crate::error::{HandshakeError, HubError, TransportError};
use crate::registry::InvocationRegistry;

/// Lifecycle state of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; no further transitions.
    Disposed,
}

/// Opens one fresh physical channel per connection attempt.
///
/// A channel instance is never reused across attempts, so the factory is
/// consulted again for every (re)connection. Any `Fn` closure returning a
/// channel future implements this.
pub trait ChannelFactory: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<AnyChannel, TransportError>> + Send + '_>>;
}

impl<F, Fut> ChannelFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AnyChannel, TransportError>> + Send + 'static,
{
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<AnyChannel, TransportError>> + Send + '_>> {
        Box::pin(self())
    }
}

/// One physical channel epoch. Replaced wholesale on reconnect; the epoch
/// lets stale failure reports from an already-replaced channel be ignored.
struct Link {
    epoch: u64,
    channel: AnyChannel,
    /// Admits exactly one in-flight write at a time; queued writers are
    /// released in submission order.
    send_gate: AsyncMutex<()>,
    /// Bytes the peer coalesced after its handshake response; the receive
    /// loop drains them before touching the channel again.
    handshake_remainder: Mutex<Option<Bytes>>,
    /// Streams we are producing for the peer, keyed by invocation id, each
    /// with its cancellation signal.
    outbound_streams: Mutex<HashMap<String, Arc<Notify>>>,
}

type AttemptReceiver = watch::Receiver<Option<Result<(), HubError>>>;

struct RuntimeState {
    link: Option<Arc<Link>>,
    /// In-flight start attempt, shared by every concurrent `start()` caller
    /// and by gated operations issued while `Connecting`.
    attempt: Option<AttemptReceiver>,
    /// Wakes a reconnect loop sleeping out its backoff delay.
    reconnect_abort: Option<Arc<Notify>>,
}

struct Inner {
    factory: Box<dyn ChannelFactory>,
    codec: Arc<dyn HubCodec>,
    dispatcher: Arc<dyn Dispatcher>,
    config: ConnectionConfig,
    registry: InvocationRegistry,
    next_invocation_id: AtomicU64,
    next_epoch: AtomicU64,
    /// Exclusive gate serializing start/stop/failure-driven transitions.
    lifecycle: AsyncMutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    runtime: Mutex<RuntimeState>,
}

/// Why a receive loop ended its physical channel.
struct LinkFailure {
    reason: String,
    allow_reconnect: bool,
}

/// A persistent bidirectional invocation connection.
///
/// Cheap to clone; all clones share one logical connection.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("state", &self.state())
            .field("outstanding", &self.inner.registry.outstanding())
            .finish_non_exhaustive()
    }
}

impl HubConnection {
    /// Build a connection from its collaborators. Nothing touches the wire
    /// until [`HubConnection::start`].
    pub fn new(
        factory: impl ChannelFactory,
        codec: impl HubCodec,
        dispatcher: impl Dispatcher,
        config: ConnectionConfig,
    ) -> Self {
        let max_outstanding = config.max_outstanding;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                codec: Arc::new(codec),
                dispatcher: Arc::new(dispatcher),
                config,
                registry: InvocationRegistry::new(max_outstanding),
                next_invocation_id: AtomicU64::new(1),
                next_epoch: AtomicU64::new(1),
                lifecycle: AsyncMutex::new(()),
                state_tx,
                runtime: Mutex::new(RuntimeState {
                    link: None,
                    attempt: None,
                    reconnect_abort: None,
                }),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe lifecycle transitions as they happen.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Open the physical channel and perform the handshake.
    ///
    /// Reentrant-safe: a concurrent `start()` while one is already in flight
    /// joins the same attempt: exactly one handshake crosses the wire and
    /// every caller observes the same outcome. Fails with
    /// [`HubError::InvalidOperation`] when already started.
    pub async fn start(&self) -> Result<(), HubError> {
        loop {
            // Join an attempt already in flight before touching the gate.
            let attempt = self.inner.runtime.lock().attempt.clone();
            if let Some(rx) = attempt {
                tracing::debug!("start joining in-flight attempt");
                return await_attempt(rx).await;
            }

            match self.state() {
                ConnectionState::Disposed => {
                    return Err(HubError::InvalidOperation(
                        "the connection is disposed".into(),
                    ));
                }
                ConnectionState::Connected | ConnectionState::Reconnecting => {
                    return Err(HubError::InvalidOperation(
                        "the connection has already been started".into(),
                    ));
                }
                // The winning starter is between publishing its attempt and
                // flipping the state; let it finish publishing.
                ConnectionState::Connecting => {
                    tokio::task::yield_now().await;
                    continue;
                }
                ConnectionState::Disconnected => {}
            }

            let gate = self.inner.lifecycle.lock().await;
            match self.state() {
                ConnectionState::Disconnected => {}
                // A concurrent starter won the race while we waited on the
                // gate; its outcome is ours.
                ConnectionState::Connected => return Ok(()),
                _ => {
                    drop(gate);
                    continue;
                }
            }

            let (attempt_tx, attempt_rx) = watch::channel(None);
            self.inner.runtime.lock().attempt = Some(attempt_rx);
            self.inner.state_tx.send_replace(ConnectionState::Connecting);
            tracing::debug!("starting connection");

            let result = self.inner.establish().await;
            let outcome = match result {
                Ok(link) => {
                    self.inner.runtime.lock().link = Some(link.clone());
                    self.inner.state_tx.send_replace(ConnectionState::Connected);
                    spawn_link_tasks(&self.inner, &link);
                    tracing::info!(epoch = link.epoch, "connection started");
                    Ok(())
                }
                Err(e) => {
                    self.inner
                        .state_tx
                        .send_replace(ConnectionState::Disconnected);
                    tracing::warn!(error = %e, "connection start failed");
                    Err(e)
                }
            };

            self.inner.runtime.lock().attempt = None;
            let _ = attempt_tx.send(Some(outcome.clone()));
            return outcome;
        }
    }

    /// Close the connection: cancel any reconnection, send a graceful close
    /// when the wire still works, tear the channel down, and fail every
    /// outstanding call. A no-op while `Disconnected`.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.shutdown(ConnectionState::Disconnected).await
    }

    /// Like [`HubConnection::stop`], but the connection becomes permanently
    /// unusable.
    pub async fn dispose(&self) -> Result<(), HubError> {
        self.shutdown(ConnectionState::Disposed).await
    }

    async fn shutdown(&self, terminal: ConnectionState) -> Result<(), HubError> {
        // Wake a reconnect loop sleeping out its backoff before queueing on
        // the gate, so stop() does not wait out the delay.
        let abort = self.inner.runtime.lock().reconnect_abort.take();
        if let Some(abort) = abort {
            // Permit semantics: the loop may be mid-attempt rather than
            // parked on its backoff sleep.
            abort.notify_one();
        }

        let _gate = self.inner.lifecycle.lock().await;
        if self.state() == ConnectionState::Disposed {
            return Ok(());
        }

        let link = self.inner.runtime.lock().link.take();
        if let Some(link) = &link {
            let close = Message::Close {
                error: None,
                allow_reconnect: false,
            };
            // Best effort: the channel is going away regardless.
            let _ = self.inner.send_message(link, &close).await;
            link.channel.abort();
        }
        self.inner.registry.fail_all("connection stopped");
        self.inner.state_tx.send_replace(terminal);
        tracing::debug!(state = ?terminal, "connection shut down");
        Ok(())
    }

    /// Invoke `target` on the peer and await its single result.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, HubError> {
        let link = self.ready_link().await?;
        let invocation_id = self.next_invocation_id();
        let rx = self.inner.registry.register_unary(&invocation_id)?;
        let mut pending = PendingGuard {
            registry: &self.inner.registry,
            invocation_id: &invocation_id,
            armed: true,
        };

        let message = Message::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: target.to_owned(),
            arguments,
            stream_ids: Vec::new(),
        };
        if let Err(e) = self.inner.send_message(&link, &message).await {
            fail_link(&self.inner, &link, &e).await;
            return Err(e);
        }
        tracing::debug!(%invocation_id, target = %target, "invocation sent");

        let result = match rx.await {
            Ok(result) => result,
            // The sender vanished without resolving; only possible if the
            // registry entry was dropped out from under us.
            Err(_) => Err(HubError::lost("connection closed")),
        };
        pending.disarm();
        result
    }

    /// Invoke `target` without expecting any result or completion.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        let link = self.ready_link().await?;
        let message = Message::Invocation {
            invocation_id: None,
            target: target.to_owned(),
            arguments,
            stream_ids: Vec::new(),
        };
        if let Err(e) = self.inner.send_message(&link, &message).await {
            fail_link(&self.inner, &link, &e).await;
            return Err(e);
        }
        tracing::debug!(target = %target, "fire-and-forget invocation sent");
        Ok(())
    }

    /// Invoke `target` and consume its streamed results.
    ///
    /// Items arrive in wire order. The stream ends after the remote's
    /// completion: silently on success, with a final `Err` on a server error
    /// or connection loss.
    pub async fn stream(&self, target: &str, arguments: Vec<Value>) -> Result<StreamingCall, HubError> {
        let link = self.ready_link().await?;
        let invocation_id = self.next_invocation_id();
        let items = self
            .inner
            .registry
            .register_stream(&invocation_id, self.inner.config.stream_buffer_capacity)?;

        let message = Message::StreamInvocation {
            invocation_id: invocation_id.clone(),
            target: target.to_owned(),
            arguments,
            stream_ids: Vec::new(),
        };
        if let Err(e) = self.inner.send_message(&link, &message).await {
            self.inner.registry.remove(&invocation_id);
            fail_link(&self.inner, &link, &e).await;
            return Err(e);
        }
        tracing::debug!(%invocation_id, target = %target, "stream invocation sent");

        Ok(StreamingCall {
            invocation_id,
            items,
            inner: self.inner.clone(),
        })
    }

    fn next_invocation_id(&self) -> String {
        self.inner
            .next_invocation_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    /// Resolve the current link, waiting out an in-flight start first.
    async fn ready_link(&self) -> Result<Arc<Link>, HubError> {
        loop {
            let attempt = self.inner.runtime.lock().attempt.clone();
            if let Some(rx) = attempt {
                // Outcome doesn't matter here; the state it leaves behind does.
                let _ = await_attempt(rx).await;
                continue;
            }
            match self.state() {
                ConnectionState::Connected => {
                    if let Some(link) = self.inner.runtime.lock().link.clone() {
                        return Ok(link);
                    }
                    // Mid-transition; re-observe.
                    tokio::task::yield_now().await;
                }
                ConnectionState::Connecting => {
                    tokio::task::yield_now().await;
                }
                _ => return Err(HubError::not_active()),
            }
        }
    }
}

/// Removes an abandoned registry entry when an invoke future is dropped (or
/// its send fails) before the call settles.
struct PendingGuard<'a> {
    registry: &'a InvocationRegistry,
    invocation_id: &'a str,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.remove(self.invocation_id) {
            tracing::debug!(
                invocation_id = self.invocation_id,
                "invocation abandoned; removed pending call"
            );
        }
    }
}

/// Handle to one streaming invocation's results.
pub struct StreamingCall {
    invocation_id: String,
    items: mpsc::Receiver<Result<Value, HubError>>,
    inner: Arc<Inner>,
}

impl StreamingCall {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Next item, or `None` once the stream has settled.
    pub async fn next_item(&mut self) -> Option<Result<Value, HubError>> {
        self.items.recv().await
    }

    /// Ask the remote to stop producing.
    ///
    /// Advisory: the call stays outstanding until the remote's completion or
    /// a connection loss is observed, but no further items reach this handle
    /// either way.
    pub async fn cancel(&mut self) -> Result<(), HubError> {
        if !self.inner.registry.cancel_locally(&self.invocation_id) {
            return Ok(());
        }
        let link = self.inner.runtime.lock().link.clone();
        let Some(link) = link else {
            return Ok(());
        };
        let message = Message::CancelInvocation {
            invocation_id: self.invocation_id.clone(),
        };
        if let Err(e) = self.inner.send_message(&link, &message).await {
            fail_link(&self.inner, &link, &e).await;
            return Err(e);
        }
        Ok(())
    }
}

impl futures_util::Stream for StreamingCall {
    type Item = Result<Value, HubError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().items.poll_recv(cx)
    }
}

impl std::fmt::Debug for StreamingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCall")
            .field("invocation_id", &self.invocation_id)
            .finish_non_exhaustive()
    }
}

async fn await_attempt(mut rx: AttemptReceiver) -> Result<(), HubError> {
    loop {
        if let Some(result) = rx.borrow().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            // Starter vanished without publishing an outcome.
            return Err(HubError::not_active());
        }
    }
}

impl Inner {
    /// Open a fresh physical channel and run the handshake on it.
    async fn establish(&self) -> Result<Arc<Link>, HubError> {
        let channel = self.factory.connect().await.map_err(HubError::Transport)?;
        let link = Arc::new(Link {
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
            channel,
            send_gate: AsyncMutex::new(()),
            handshake_remainder: Mutex::new(None),
            outbound_streams: Mutex::new(HashMap::new()),
        });

        match timeout(self.config.handshake_timeout, self.handshake(&link)).await {
            Ok(Ok(())) => Ok(link),
            Ok(Err(e)) => {
                link.channel.abort();
                Err(e)
            }
            Err(_) => {
                link.channel.abort();
                Err(HubError::Handshake(HandshakeError::Timeout))
            }
        }
    }

    /// Exactly one handshake round-trip precedes any message traffic on a
    /// freshly established channel.
    async fn handshake(&self, link: &Link) -> Result<(), HubError> {
        tracing::debug!(
            protocol = self.codec.name(),
            version = self.codec.version(),
            epoch = link.epoch,
            "sending handshake request"
        );
        let request = codec::encode_handshake_request(self.codec.as_ref());
        link.channel.send(request).await.map_err(HandshakeError::from)?;

        let frame = link
            .channel
            .recv()
            .await
            .map_err(HandshakeError::from)?
            .ok_or(HubError::Handshake(HandshakeError::Transport(
                TransportError::Closed,
            )))?;
        let (response, remainder) = codec::parse_handshake_response(&frame)?;
        if let Some(error) = response.error {
            return Err(HubError::Handshake(HandshakeError::Rejected(error)));
        }
        if !remainder.is_empty() {
            *link.handshake_remainder.lock() = Some(remainder);
        }
        tracing::debug!(epoch = link.epoch, "handshake complete");
        Ok(())
    }

    /// Serialize and write one message through the link's send gate.
    async fn send_message(&self, link: &Link, message: &Message) -> Result<(), HubError> {
        let frame = self.codec.encode(message)?;
        let _permit = link.send_gate.lock().await;
        link.channel.send(frame).await.map_err(HubError::from)
    }
}

fn spawn_link_tasks(inner: &Arc<Inner>, link: &Arc<Link>) {
    tokio::spawn(receive_loop(inner.clone(), link.clone()));
    tokio::spawn(keepalive_loop(inner.clone(), link.clone()));
}

/// The single reader for one physical channel.
async fn receive_loop(inner: Arc<Inner>, link: Arc<Link>) {
    tracing::debug!(epoch = link.epoch, "receive loop started");

    // The peer may have coalesced messages behind its handshake response.
    let remainder = link.handshake_remainder.lock().take();
    if let Some(frame) = remainder {
        if let Err(failure) = process_frame(&inner, &link, &frame).await {
            finish_link(&inner, &link, failure).await;
            return;
        }
    }

    loop {
        let frame = match timeout(inner.config.server_timeout, link.channel.recv()).await {
            Err(_) => {
                // Silence is failure; graceful close announces itself.
                let failure = LinkFailure {
                    reason: "server timeout: no frames within the idle window".into(),
                    allow_reconnect: true,
                };
                finish_link(&inner, &link, failure).await;
                return;
            }
            Ok(Err(e)) => {
                let failure = LinkFailure {
                    reason: format!("transport failure: {e}"),
                    allow_reconnect: true,
                };
                finish_link(&inner, &link, failure).await;
                return;
            }
            Ok(Ok(None)) => {
                let failure = LinkFailure {
                    reason: "connection closed by remote".into(),
                    allow_reconnect: true,
                };
                finish_link(&inner, &link, failure).await;
                return;
            }
            Ok(Ok(Some(frame))) => frame,
        };

        if let Err(failure) = process_frame(&inner, &link, &frame).await {
            finish_link(&inner, &link, failure).await;
            return;
        }
    }
}

/// Decode and route every record in one channel frame.
async fn process_frame(
    inner: &Arc<Inner>,
    link: &Arc<Link>,
    frame: &[u8],
) -> Result<(), LinkFailure> {
    for record in codec::split_records(frame) {
        let message = match inner.codec.decode(record) {
            Ok(message) => message,
            Err(e) => {
                // A frame we cannot parse means we no longer agree on the
                // wire state; the channel is unrecoverable.
                tracing::error!(epoch = link.epoch, error = %e, "protocol violation");
                return Err(LinkFailure {
                    reason: format!("protocol violation: {e}"),
                    allow_reconnect: true,
                });
            }
        };
        handle_message(inner, link, message).await?;
    }
    Ok(())
}

async fn handle_message(
    inner: &Arc<Inner>,
    link: &Arc<Link>,
    message: Message,
) -> Result<(), LinkFailure> {
    match message {
        Message::StreamItem {
            invocation_id,
            item,
        } => {
            // Suspends when the consumer's buffer is full; wire order is
            // preserved for every id at the cost of head-of-line blocking.
            inner.registry.push_stream_item(&invocation_id, item).await;
        }
        Message::Completion {
            invocation_id,
            result,
            error,
        } => {
            let outcome = match error {
                Some(error) => Err(error),
                None => Ok(result),
            };
            inner.registry.complete(&invocation_id, outcome).await;
        }
        Message::Invocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            spawn_unary_dispatch(inner, link, invocation_id, target, arguments);
        }
        Message::StreamInvocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            spawn_stream_dispatch(inner, link, invocation_id, target, arguments);
        }
        Message::CancelInvocation { invocation_id } => {
            // Idempotent: cancelling an unknown or already-finished stream
            // is harmless.
            let cancel = link.outbound_streams.lock().get(&invocation_id).cloned();
            match cancel {
                Some(cancel) => {
                    tracing::debug!(%invocation_id, "peer cancelled outbound stream");
                    // notify_one stores a permit, so the signal is not lost
                    // when the stream task is mid-send rather than waiting.
                    cancel.notify_one();
                }
                None => {
                    tracing::debug!(%invocation_id, "cancellation for unknown stream (ignored)");
                }
            }
        }
        Message::Ping => {
            // Nothing to do beyond having reset the idle window by arriving.
            tracing::trace!(epoch = link.epoch, "ping received");
        }
        Message::Close {
            error,
            allow_reconnect,
        } => {
            let reason = match error {
                Some(error) => format!("closed by remote: {error}"),
                None => "closed by remote".into(),
            };
            return Err(LinkFailure {
                reason,
                allow_reconnect,
            });
        }
    }
    Ok(())
}

/// Run a unary invocation from the peer on its own task and funnel the
/// completion back through the send path.
fn spawn_unary_dispatch(
    inner: &Arc<Inner>,
    link: &Arc<Link>,
    invocation_id: Option<String>,
    target: String,
    arguments: Vec<Value>,
) {
    let handler_future = match inner.dispatcher.resolve(&target) {
        Some(Handler::Unary(f)) => Ok(f(arguments)),
        Some(Handler::Stream(_)) => Err(format!("'{target}' requires a streaming invocation")),
        None => Err(format!("unknown target '{target}'")),
    };

    let inner = inner.clone();
    let link = link.clone();
    tokio::spawn(async move {
        let outcome = match handler_future {
            Ok(future) => {
                // A panicking handler must not leave the caller waiting on a
                // completion that will never come.
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(panic_message(panic, &target)),
                }
            }
            Err(error) => Err(error),
        };

        let Some(invocation_id) = invocation_id else {
            if let Err(error) = outcome {
                tracing::warn!(target = %target, error = %error, "fire-and-forget invocation failed");
            }
            return;
        };

        let completion = match outcome {
            Ok(result) => Message::Completion {
                invocation_id,
                result: Some(result),
                error: None,
            },
            Err(error) => Message::Completion {
                invocation_id,
                result: None,
                error: Some(error),
            },
        };
        send_or_fail(&inner, &link, &completion).await;
    });
}

/// Run a streaming invocation from the peer, forwarding items until the
/// handler finishes, errors, or the peer cancels.
fn spawn_stream_dispatch(
    inner: &Arc<Inner>,
    link: &Arc<Link>,
    invocation_id: String,
    target: String,
    arguments: Vec<Value>,
) {
    let mut items = match inner.dispatcher.resolve(&target) {
        Some(Handler::Stream(f)) => f(arguments),
        Some(Handler::Unary(_)) => {
            let completion = Message::Completion {
                invocation_id,
                result: None,
                error: Some(format!("'{target}' is not a streaming target")),
            };
            spawn_completion(inner, link, completion);
            return;
        }
        None => {
            let completion = Message::Completion {
                invocation_id,
                result: None,
                error: Some(format!("unknown target '{target}'")),
            };
            spawn_completion(inner, link, completion);
            return;
        }
    };

    let cancel = Arc::new(Notify::new());
    link.outbound_streams
        .lock()
        .insert(invocation_id.clone(), cancel.clone());

    let inner = inner.clone();
    let link = link.clone();
    tokio::spawn(async move {
        let mut error = None;
        let cancelled = loop {
            tokio::select! {
                _ = cancel.notified() => break true,
                item = items.recv() => match item {
                    Some(Ok(value)) => {
                        let message = Message::StreamItem {
                            invocation_id: invocation_id.clone(),
                            item: value,
                        };
                        if !send_or_fail(&inner, &link, &message).await {
                            link.outbound_streams.lock().remove(&invocation_id);
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error = Some(e);
                        break false;
                    }
                    None => break false,
                },
            }
        };

        link.outbound_streams.lock().remove(&invocation_id);
        if cancelled {
            tracing::debug!(%invocation_id, "outbound stream cancelled");
        }
        let completion = Message::Completion {
            invocation_id,
            result: None,
            error,
        };
        send_or_fail(&inner, &link, &completion).await;
    });
}

fn spawn_completion(inner: &Arc<Inner>, link: &Arc<Link>, completion: Message) {
    let inner = inner.clone();
    let link = link.clone();
    tokio::spawn(async move {
        send_or_fail(&inner, &link, &completion).await;
    });
}

fn panic_message(panic: Box<dyn std::any::Any + Send>, target: &str) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler for '{target}' panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler for '{target}' panicked: {s}")
    } else {
        format!("handler for '{target}' panicked")
    }
}

/// Send, and on write failure tear the whole channel down: a failed write is
/// a channel failure for everyone, not just whoever happened to be writing.
async fn send_or_fail(inner: &Arc<Inner>, link: &Arc<Link>, message: &Message) -> bool {
    match inner.send_message(link, message).await {
        Ok(()) => true,
        Err(e) => {
            fail_link(inner, link, &e).await;
            false
        }
    }
}

async fn fail_link(inner: &Arc<Inner>, link: &Arc<Link>, error: &HubError) {
    tracing::warn!(epoch = link.epoch, error = %error, "write failed; closing channel");
    let failure = LinkFailure {
        reason: format!("write failure: {error}"),
        allow_reconnect: true,
    };
    finish_link(inner, link, failure).await;
}

/// The single disconnect path. Every failure source (receive loop, send
/// path, idle timeout, remote close) converges here; it drains the
/// registry exactly once and decides between reconnecting and going quiet.
async fn finish_link(inner: &Arc<Inner>, link: &Arc<Link>, failure: LinkFailure) {
    let _gate = inner.lifecycle.lock().await;

    // Only the currently installed channel may drive a transition; stale
    // reports from an already-replaced channel are no-ops.
    {
        let runtime = inner.runtime.lock();
        match &runtime.link {
            Some(current) if current.epoch == link.epoch => {}
            _ => return,
        }
    }

    link.channel.abort();
    inner.runtime.lock().link = None;
    // Calls outstanding at loss are failed, never resumed: replaying across
    // a lost wire would need server-side replay state this protocol lacks.
    inner.registry.fail_all(&failure.reason);

    let reconnect = failure.allow_reconnect && inner.config.reconnect.is_some();
    if reconnect {
        tracing::warn!(reason = %failure.reason, "connection lost; reconnecting");
        let abort = Arc::new(Notify::new());
        inner.runtime.lock().reconnect_abort = Some(abort.clone());
        inner.state_tx.send_replace(ConnectionState::Reconnecting);
        tokio::spawn(reconnect_loop(inner.clone(), abort));
    } else {
        tracing::warn!(reason = %failure.reason, "connection lost; disconnected");
        inner.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Re-establishment with backoff: fresh channel and handshake per attempt.
async fn reconnect_loop(inner: Arc<Inner>, abort: Arc<Notify>) {
    let policy = inner
        .config
        .reconnect
        .clone()
        .expect("reconnect loop spawned without a policy");

    let mut attempt = 0usize;
    loop {
        if !policy.allows(attempt) {
            tracing::warn!(attempts = attempt, "reconnect budget exhausted");
            break;
        }

        let delay = policy.delay_for(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // stop() already drove the state; nothing left to do.
            _ = abort.notified() => return,
        }

        tracing::debug!(attempt, "reconnect attempt");
        match inner.establish().await {
            Ok(link) => {
                let _gate = inner.lifecycle.lock().await;
                // stop() may have won the race while we were dialing.
                if *inner.state_tx.borrow() != ConnectionState::Reconnecting {
                    link.channel.abort();
                    return;
                }
                {
                    let mut runtime = inner.runtime.lock();
                    runtime.link = Some(link.clone());
                    runtime.reconnect_abort = None;
                }
                inner.state_tx.send_replace(ConnectionState::Connected);
                spawn_link_tasks(&inner, &link);
                tracing::info!(attempt, epoch = link.epoch, "reconnected");
                return;
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "reconnect attempt failed");
                attempt += 1;
            }
        }
    }

    let _gate = inner.lifecycle.lock().await;
    if *inner.state_tx.borrow() == ConnectionState::Reconnecting {
        inner.runtime.lock().reconnect_abort = None;
        inner.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Outbound keepalive: ping the peer on a fixed interval while this link is
/// the active one.
async fn keepalive_loop(inner: Arc<Inner>, link: Arc<Link>) {
    let mut ticker = tokio::time::interval(inner.config.keep_alive_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let current = inner.runtime.lock().link.as_ref().map(|l| l.epoch);
        if current != Some(link.epoch) {
            return;
        }
        if !send_or_fail(&inner, &link, &Message::Ping).await {
            return;
        }
        tracing::trace!(epoch = link.epoch, "keepalive ping sent");
    }
}
