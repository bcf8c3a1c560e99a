//! Test peer: drives the far end of a memory channel pair with the real
//! wire format, so the engine under test cannot tell it from a live server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use hublink_core::{
    AnyChannel, ConnectionConfig, DispatchMap, DuplexChannel, HandshakeRequest, HandshakeResponse,
    HubCodec, HubConnection, JsonCodec, Message, encode_handshake_response,
    parse_handshake_request, split_records,
};

pub const SHORT: Duration = Duration::from_millis(200);
pub const LONG: Duration = Duration::from_secs(5);

/// The scripted remote side of one physical channel.
pub struct TestPeer {
    channel: AnyChannel,
    codec: JsonCodec,
}

impl TestPeer {
    pub fn new(channel: AnyChannel) -> Self {
        Self {
            channel,
            codec: JsonCodec::new(),
        }
    }

    /// Read the handshake request and accept it.
    pub async fn accept_handshake(&self) -> HandshakeRequest {
        let request = self.recv_handshake().await;
        self.respond_handshake(&HandshakeResponse::ok()).await;
        request
    }

    /// Read the handshake request without responding yet.
    pub async fn recv_handshake(&self) -> HandshakeRequest {
        let frame = timeout(LONG, self.channel.recv())
            .await
            .expect("timed out waiting for handshake request")
            .expect("channel failed before handshake")
            .expect("channel closed before handshake");
        parse_handshake_request(&frame).expect("malformed handshake request")
    }

    pub async fn respond_handshake(&self, response: &HandshakeResponse) {
        self.channel
            .send(encode_handshake_response(response))
            .await
            .expect("failed to send handshake response");
    }

    /// Next protocol message from the engine, if one arrives in time.
    pub async fn try_recv_message(&self, within: Duration) -> Option<Message> {
        let frame = timeout(within, self.channel.recv()).await.ok()?.ok()??;
        let record = split_records(&frame).next()?;
        Some(self.codec.decode(record).expect("malformed message frame"))
    }

    /// Next message, panicking if none arrives.
    pub async fn recv_message(&self) -> Message {
        self.try_recv_message(LONG)
            .await
            .expect("timed out waiting for message")
    }

    /// Next message that is not a keepalive ping.
    pub async fn recv_non_ping(&self) -> Message {
        loop {
            match self.recv_message().await {
                Message::Ping => continue,
                other => return other,
            }
        }
    }

    pub async fn send_message(&self, message: &Message) {
        let frame = self.codec.encode(message).expect("encode");
        self.channel.send(frame).await.expect("peer send failed");
    }

    /// Send raw bytes, bypassing the codec.
    pub async fn send_raw(&self, bytes: &[u8]) {
        self.channel
            .send(bytes.to_vec().into())
            .await
            .expect("peer raw send failed");
    }

    /// Kill the physical channel abruptly.
    pub fn kill(&self) {
        self.channel.abort();
    }
}

/// A channel factory producing one linked memory pair per connection
/// attempt, handing the far end to the test as a [`TestPeer`].
pub struct PeerFactory {
    peer_tx: Arc<mpsc::UnboundedSender<TestPeer>>,
}

impl hublink_core::ChannelFactory for PeerFactory {
    fn connect(
        &self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<Output = Result<AnyChannel, hublink_core::TransportError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            let (near, far) = AnyChannel::memory_pair();
            self.peer_tx
                .send(TestPeer::new(far))
                .expect("test dropped its peer receiver");
            Ok(near)
        })
    }
}

pub fn peer_factory() -> (PeerFactory, mpsc::UnboundedReceiver<TestPeer>) {
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    (
        PeerFactory {
            peer_tx: Arc::new(peer_tx),
        },
        peer_rx,
    )
}

/// Test-friendly config: generous idle windows so keepalive noise never
/// interferes unless a test opts in.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: Duration::from_secs(2),
        keep_alive_interval: Duration::from_secs(60),
        server_timeout: Duration::from_secs(60),
        ..ConnectionConfig::default()
    }
}

/// Connection wired to a peer factory with an empty dispatch table.
pub fn connection(config: ConnectionConfig) -> (HubConnection, mpsc::UnboundedReceiver<TestPeer>) {
    connection_with(config, DispatchMap::new())
}

pub fn connection_with(
    config: ConnectionConfig,
    dispatch: DispatchMap,
) -> (HubConnection, mpsc::UnboundedReceiver<TestPeer>) {
    init_tracing();
    let (factory, peers) = peer_factory();
    (
        HubConnection::new(factory, JsonCodec::new(), dispatch, config),
        peers,
    )
}

/// Honor RUST_LOG when diagnosing a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Start the connection and complete the handshake, returning the peer.
pub async fn started(
    connection: &HubConnection,
    peers: &mut mpsc::UnboundedReceiver<TestPeer>,
) -> TestPeer {
    let start = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    let peer = peers.recv().await.expect("no channel opened");
    peer.accept_handshake().await;
    start
        .await
        .expect("start task panicked")
        .expect("start failed");
    peer
}
