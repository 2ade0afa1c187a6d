//! TCP plumbing: the socket-backed transport, one task per connection, and
//! the listener and dialer loops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use kindred_core::wire::FrameDecoder;
use kindred_core::{PeerId, RawItem};
use kindred_services::{ConnectionManager, Pacer, PeerError, Transport, WriteCompleter, WriteError, WriteHandle};

use crate::handshake::{self, LocalInfo};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER: usize = 16 * 1024;

// ── Transport ────────────────────────────────────────────────────────────────

type Outgoing = (RawItem, WriteCompleter);

/// Frames queued here are written in order by a dedicated task, paced to
/// the bandwidth the remote asked for.
pub struct TcpTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
}

impl TcpTransport {
    pub fn spawn<W>(writer: W, peer: PeerId, bandwidth: u32) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx, peer, bandwidth));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&self, item: RawItem) -> WriteHandle {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return WriteHandle::failed(WriteError::Closed);
        };
        let (done, handle) = WriteHandle::pending();
        match tx.send((item, done)) {
            Ok(()) => handle,
            Err(_) => WriteHandle::failed(WriteError::Closed),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>, peer: PeerId, bandwidth: u32)
where
    W: AsyncWrite + Unpin,
{
    let mut pacer = Pacer::new(bandwidth);
    while let Some((item, done)) = rx.recv().await {
        let size = item.declared_size();
        let delay = pacer.delay(item.priority, size);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match writer.write_all(item.frame()).await {
            Ok(()) => done.complete(Ok(size)),
            Err(e) => {
                tracing::debug!(peer = %peer.short(), error = %e, "write failed");
                done.complete(Err(WriteError::Io(e.to_string())));
                break;
            }
        }
    }
    rx.close();
    while let Ok((_, done)) = rx.try_recv() {
        done.complete(Err(WriteError::Closed));
    }
    let _ = writer.shutdown().await;
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// Everything a connection task needs.
pub struct Node {
    pub manager: ConnectionManager,
    pub local: LocalInfo,
    /// Friend node keys and their dial addresses. Empty = inbound only.
    pub friends: DashMap<PeerId, String>,
    pub max_frame_errors: u32,
    dialing: DashSet<PeerId>,
}

impl Node {
    pub fn new(
        manager: ConnectionManager,
        local: LocalInfo,
        friends: impl IntoIterator<Item = (PeerId, String)>,
        max_frame_errors: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            local,
            friends: friends.into_iter().collect(),
            max_frame_errors,
            dialing: DashSet::new(),
        })
    }

    fn friend_ids(&self) -> HashSet<PeerId> {
        self.friends.iter().map(|f| *f.key()).collect()
    }
}

/// Handshake, register, then feed frames to the manager until the stream
/// ends, the peer misbehaves or shutdown is signalled.
pub async fn run_connection<S>(mut stream: S, node: Arc<Node>, mut shutdown: broadcast::Receiver<()>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let friends = node.friend_ids();
    let (hello, mut decoder) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        handshake::perform(&mut stream, &node.local, &friends),
    )
    .await
    .context("handshake timed out")??;

    let (mut reader, writer) = tokio::io::split(stream);
    let transport = TcpTransport::spawn(writer, hello.peer, hello.bandwidth);
    let peer = match node.manager.add_peer(hello.peer, transport.clone(), hello.services.iter().copied()) {
        Ok(peer) => peer,
        Err(e @ PeerError::DuplicatePeer(_)) => {
            transport.close();
            tracing::debug!(error = %e, "dropping second connection");
            return Ok(());
        }
        Err(e) => {
            transport.close();
            return Err(e.into());
        }
    };
    peer.slots().set_bandwidth(hello.bandwidth);

    let id = hello.peer;
    let result = read_loop(&mut reader, &mut decoder, &node, &id, &mut shutdown).await;
    let _ = node.manager.remove_peer(&id);
    result
}

async fn read_loop<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    node: &Node,
    id: &PeerId,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %id.short(), error = %e, "stream desynchronised, disconnecting");
                    return Ok(());
                }
            };
            if let Err(e) = node.manager.receive(id, frame) {
                if matches!(e, PeerError::NotConnected(_)) {
                    return Ok(());
                }
                let errors = node.manager.peer(id).map_or(0, |p| p.frame_errors());
                tracing::debug!(peer = %id.short(), error = %e, errors, "frame discarded");
                if node.max_frame_errors > 0 && errors >= node.max_frame_errors {
                    tracing::warn!(peer = %id.short(), errors, "too many bad frames, disconnecting");
                    return Ok(());
                }
            }
        }

        let n = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);
    }
}

// ── Listener and dialer ──────────────────────────────────────────────────────

pub async fn serve(listener: TcpListener, node: Arc<Node>, shutdown: broadcast::Sender<()>) -> Result<()> {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => {
                tracing::info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                tracing::debug!(%addr, "inbound connection");
                let node = node.clone();
                let stop = shutdown.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = run_connection(stream, node, stop).await {
                        tracing::info!(%addr, error = %e, "inbound connection ended");
                    }
                });
            }
        }
    }
}

/// Dial every friend with an address that is not connected.
///
/// Between two friends the one with the lower node key dials first. The
/// other side only dials once the friend has been missing for two rounds,
/// which covers friends that cannot be reached the other way.
pub async fn dial_loop(node: Arc<Node>, period: Duration, shutdown: broadcast::Sender<()>) {
    let mut stop = shutdown.subscribe();
    let mut interval = tokio::time::interval(period);
    let mut missing_since: HashMap<PeerId, Instant> = HashMap::new();
    let local = node.local.node_id();

    loop {
        tokio::select! {
            _ = stop.recv() => {
                tracing::info!("dialer shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        let targets: Vec<(PeerId, String)> = node
            .friends
            .iter()
            .filter(|f| !f.value().is_empty())
            .map(|f| (*f.key(), f.value().clone()))
            .collect();

        for (peer, addr) in targets {
            if node.manager.is_connected(&peer) {
                missing_since.remove(&peer);
                continue;
            }
            let since = *missing_since.entry(peer).or_insert_with(Instant::now);
            if local > peer && since.elapsed() < period * 2 {
                continue;
            }
            if !node.dialing.insert(peer) {
                continue;
            }

            let node = node.clone();
            let stop = shutdown.subscribe();
            tokio::spawn(async move {
                let result = dial(&addr, node.clone(), stop).await;
                node.dialing.remove(&peer);
                if let Err(e) = result {
                    tracing::debug!(peer = %peer.short(), %addr, error = %e, "dial failed");
                }
            });
        }
    }
}

async fn dial(addr: &str, node: Arc<Node>, stop: broadcast::Receiver<()>) -> Result<()> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connect timed out")?
        .with_context(|| format!("connect to {addr}"))?;
    let _ = stream.set_nodelay(true);
    tracing::debug!(%addr, "outbound connection");
    run_connection(stream, node, stop).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_core::codec::ItemWriter;
    use kindred_core::crypto::Keypair;
    use kindred_core::wire::service_types;
    use kindred_services::gxs::items::SyncGroupRequest;
    use kindred_services::ServiceRegistry;

    fn node(friends: Vec<PeerId>, keypair: Keypair) -> Arc<Node> {
        Node::new(
            ConnectionManager::new(ServiceRegistry::new()),
            LocalInfo {
                keypair: Arc::new(keypair),
                services: vec![service_types::FORUMS],
                bandwidth: 0,
            },
            friends.into_iter().map(|f| (f, String::new())),
            3,
        )
    }

    fn pair() -> (Arc<Node>, Arc<Node>) {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let (ia, ib) = (PeerId(ka.public), PeerId(kb.public));
        (node(vec![ib], ka), node(vec![ia], kb))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn transport_writes_frames_in_order() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let transport = TcpTransport::spawn(client, PeerId::default(), 0);

        let first = ItemWriter::new()
            .write(service_types::FORUMS, &SyncGroupRequest::default())
            .unwrap();
        let expected = first.frame().len();
        let size = transport.send(first.clone()).wait().await.unwrap();
        assert_eq!(size, expected);

        let mut buf = vec![0u8; expected];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &first.frame()[..]);

        transport.close();
        assert_eq!(transport.send(first).wait().await, Err(WriteError::Closed));
    }

    #[tokio::test]
    async fn friends_register_and_unregister() {
        let (a, b) = pair();
        let (sa, sb) = tokio::io::duplex(64 * 1024);
        let (tx, _) = broadcast::channel(1);

        let ta = tokio::spawn(run_connection(sa, a.clone(), tx.subscribe()));
        let tb = tokio::spawn(run_connection(sb, b.clone(), tx.subscribe()));

        let ib = b.local.node_id();
        let ia = a.local.node_id();
        assert!(eventually(|| a.manager.is_connected(&ib) && b.manager.is_connected(&ia)).await);

        tx.send(()).unwrap();
        ta.await.unwrap().unwrap();
        tb.await.unwrap().unwrap();
        assert_eq!(a.manager.connected(), 0);
        assert_eq!(b.manager.connected(), 0);
    }

    #[tokio::test]
    async fn desynchronised_stream_disconnects() {
        let (a, b) = pair();
        let ib = b.local.node_id();
        let (sa, mut sb) = tokio::io::duplex(64 * 1024);
        let (tx, _) = broadcast::channel(1);

        let ta = tokio::spawn(run_connection(sa, a.clone(), tx.subscribe()));
        let friends = b.friend_ids();
        handshake::perform(&mut sb, &b.local, &friends).await.unwrap();
        assert!(eventually(|| a.manager.is_connected(&ib)).await);

        // A header with the wrong item version.
        sb.write_all(&[0x7f, 0x02, 0x15, 0x01, 0, 0, 0, 8]).await.unwrap();
        ta.await.unwrap().unwrap();
        assert!(!a.manager.is_connected(&ib));
    }

    #[tokio::test]
    async fn listener_accepts_dialed_friend() {
        let (a, b) = pair();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _) = broadcast::channel(1);
        let server = tokio::spawn(serve(listener, b.clone(), tx.clone()));

        let client = {
            let a = a.clone();
            let stop = tx.subscribe();
            tokio::spawn(async move { dial(&addr, a, stop).await })
        };

        let (ia, ib) = (a.local.node_id(), b.local.node_id());
        assert!(eventually(|| a.manager.is_connected(&ib) && b.manager.is_connected(&ia)).await);

        tx.send(()).unwrap();
        client.await.unwrap().unwrap();
        server.await.unwrap().unwrap();
        assert!(!a.manager.is_connected(&ib));
    }
}
