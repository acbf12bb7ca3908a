//! Test harness: an in-memory host over duplex pipes.
//!
//! `MockHost` implements the `RelayHost` contract the way the real host
//! glue would: inbound hop streams arrive through the registered handler
//! channel, `open_stream` succeeds only towards peers marked connected and
//! hands the far end to that peer's registered stop endpoint.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use splicenet_proto::{read_message, write_message, HopMessage, Status, StopMessage};
use splicenet_relay::{
    BoxStream, InboundStream, MetricsTracer, RelayHost, RelayStream, StreamControl, HOP_PROTOCOL,
};

/// Control-flag record for one mock stream.
#[derive(Default)]
pub struct ControlFlags {
    pub reset: AtomicBool,
    pub read_closed: AtomicBool,
}

impl StreamControl for ControlFlags {
    fn reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    fn close_read(&self) {
        self.read_closed.store(true, Ordering::SeqCst);
    }
}

/// A duplex-backed stream satisfying the `RelayStream` contract.
pub struct MockStream {
    io: DuplexStream,
    control: Arc<ControlFlags>,
}

impl MockStream {
    /// A connected pair plus both control records.
    pub fn pair(capacity: usize) -> (MockStream, MockStream) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            MockStream {
                io: a,
                control: Arc::new(ControlFlags::default()),
            },
            MockStream {
                io: b,
                control: Arc::new(ControlFlags::default()),
            },
        )
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        self.control.clone()
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl RelayStream for MockStream {
    fn control(&self) -> Arc<dyn StreamControl> {
        self.control.clone()
    }
}

/// In-memory `RelayHost`.
pub struct MockHost {
    keypair: Keypair,
    peer_id: PeerId,
    addrs: Vec<Multiaddr>,
    connected: Mutex<HashSet<PeerId>>,
    tags: Mutex<HashMap<(PeerId, &'static str), u32>>,
    handlers: Mutex<HashMap<StreamProtocol, mpsc::Sender<InboundStream>>>,
    disconnect_tx: Mutex<Option<mpsc::Sender<PeerId>>>,
    stop_endpoints: Mutex<HashMap<PeerId, mpsc::UnboundedSender<MockStream>>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());
        Arc::new(Self {
            keypair,
            peer_id,
            addrs: vec![
                "/ip4/8.8.8.8/tcp/4001".parse().unwrap(),
                "/ip4/192.168.0.1/tcp/4001".parse().unwrap(),
            ],
            connected: Mutex::new(HashSet::new()),
            tags: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            disconnect_tx: Mutex::new(None),
            stop_endpoints: Mutex::new(HashMap::new()),
        })
    }

    pub fn mark_connected(&self, peer: PeerId) {
        self.connected.lock().unwrap().insert(peer);
    }

    pub fn mark_disconnected(&self, peer: &PeerId) {
        self.connected.lock().unwrap().remove(peer);
    }

    /// Drop the connection and fire the disconnect notification.
    pub async fn disconnect(&self, peer: PeerId) {
        self.mark_disconnected(&peer);
        self.notify_disconnect(peer).await;
    }

    /// Fire the disconnect notification without touching connectivity,
    /// mimicking a transient drop of one of several connections.
    pub async fn notify_disconnect(&self, peer: PeerId) {
        let tx = self.disconnect_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            tx.send(peer).await.unwrap();
        }
    }

    pub fn tag_weight(&self, peer: &PeerId, tag: &'static str) -> Option<u32> {
        self.tags.lock().unwrap().get(&(*peer, tag)).copied()
    }

    /// Register `peer` as serving the stop protocol; streams the relay
    /// opens towards it arrive on the returned channel.
    pub fn serve_stop(&self, peer: PeerId) -> mpsc::UnboundedReceiver<MockStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stop_endpoints.lock().unwrap().insert(peer, tx);
        rx
    }

    /// A clone of the registered hop handler channel, for tests that need
    /// to deliver a stream racing shutdown.
    pub fn hop_sender(&self) -> mpsc::Sender<InboundStream> {
        self.handlers
            .lock()
            .unwrap()
            .get(&HOP_PROTOCOL)
            .cloned()
            .expect("relay registered no hop handler")
    }

    /// Open a hop stream towards the relay as `peer` from `addr`; returns
    /// the client end.
    pub async fn open_hop(&self, peer: PeerId, addr: &str) -> MockStream {
        let tx = self
            .handlers
            .lock()
            .unwrap()
            .get(&HOP_PROTOCOL)
            .cloned()
            .expect("relay registered no hop handler");
        let (client, server) = MockStream::pair(1 << 16);
        tx.send(InboundStream {
            stream: Box::new(server),
            peer,
            addr: addr.parse().unwrap(),
        })
        .await
        .expect("relay stopped accepting");
        client
    }
}

impl RelayHost for MockHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn keypair(&self) -> Keypair {
        self.keypair.clone()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.addrs.clone()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.lock().unwrap().contains(peer)
    }

    fn tag_peer(&self, peer: &PeerId, tag: &'static str, weight: u32) {
        self.tags.lock().unwrap().insert((*peer, tag), weight);
    }

    fn untag_peer(&self, peer: &PeerId, tag: &'static str) {
        self.tags.lock().unwrap().remove(&(*peer, tag));
    }

    fn set_protocol_handler(&self, protocol: StreamProtocol, inbound: mpsc::Sender<InboundStream>) {
        self.handlers.lock().unwrap().insert(protocol, inbound);
    }

    fn remove_protocol_handler(&self, protocol: StreamProtocol) {
        self.handlers.lock().unwrap().remove(&protocol);
    }

    fn subscribe_disconnects(&self) -> mpsc::Receiver<PeerId> {
        let (tx, rx) = mpsc::channel(16);
        *self.disconnect_tx.lock().unwrap() = Some(tx);
        rx
    }

    fn open_stream(
        &self,
        peer: PeerId,
        _protocol: StreamProtocol,
    ) -> BoxFuture<'_, io::Result<BoxStream>> {
        Box::pin(async move {
            if !self.is_connected(&peer) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no connection to peer",
                ));
            }
            let endpoint = self.stop_endpoints.lock().unwrap().get(&peer).cloned();
            match endpoint {
                Some(tx) => {
                    let (near, far) = MockStream::pair(1 << 16);
                    tx.send(far)
                        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint gone"))?;
                    Ok(Box::new(near) as BoxStream)
                }
                None => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "peer does not serve the protocol",
                )),
            }
        })
    }
}

/// Metrics recorder.
#[derive(Default)]
pub struct TestMetrics {
    pub online: Mutex<Vec<bool>>,
    pub reserve_statuses: Mutex<Vec<Status>>,
    pub connect_statuses: Mutex<Vec<Status>>,
    pub renewals: Mutex<Vec<bool>>,
    pub reservations_closed: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub bytes: AtomicUsize,
}

impl MetricsTracer for TestMetrics {
    fn relay_status(&self, online: bool) {
        self.online.lock().unwrap().push(online);
    }

    fn reservation_request_handled(&self, status: Status) {
        self.reserve_statuses.lock().unwrap().push(status);
    }

    fn connection_request_handled(&self, status: Status) {
        self.connect_statuses.lock().unwrap().push(status);
    }

    fn reservation_allowed(&self, renewed: bool) {
        self.renewals.lock().unwrap().push(renewed);
    }

    fn reservations_closed(&self, count: usize) {
        self.reservations_closed.fetch_add(count, Ordering::SeqCst);
    }

    fn connection_opened(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self, _elapsed: Duration) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_transferred(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }
}

/// Send RESERVE and read the response.
pub async fn reserve(stream: &mut MockStream) -> HopMessage {
    write_message(stream, &HopMessage::Reserve).await.unwrap();
    read_message(stream).await.unwrap()
}

/// Send CONNECT towards `dest` and read nothing yet.
pub async fn send_connect(stream: &mut MockStream, dest: &PeerId) {
    write_message(
        stream,
        &HopMessage::Connect {
            peer: splicenet_proto::Peer::from_peer_id(dest),
        },
    )
    .await
    .unwrap();
}

/// Accept one stop stream and complete the destination side of the
/// handshake with `answer`. Returns the stream and the announced source.
pub async fn accept_stop(
    incoming: &mut mpsc::UnboundedReceiver<MockStream>,
    answer: Status,
) -> (MockStream, PeerId) {
    let mut stream = incoming.recv().await.expect("no stop stream arrived");
    let msg: StopMessage = read_message(&mut stream).await.unwrap();
    let src = match msg {
        StopMessage::Connect { peer, .. } => peer.peer_id().unwrap(),
        other => panic!("expected stop CONNECT, got {other:?}"),
    };
    write_message(&mut stream, &StopMessage::Status { status: answer })
        .await
        .unwrap();
    (stream, src)
}

/// Status of a hop response message.
pub fn response_status(msg: &HopMessage) -> Status {
    match msg {
        HopMessage::Status { status, .. } => *status,
        other => panic!("expected STATUS, got {other:?}"),
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
