//! Connection manager: who is connected, and the only way items leave.
//!
//! Owns every [`PeerConnection`] in one concurrent map keyed by peer id.
//! Outbound writes are gated on the target having negotiated the service;
//! inbound frames are decoded here and handed to the owning service on the
//! sender's execution context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kindred_core::{Item, ItemWriter, PeerId, RawItem, ServiceType, WireError};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::peer::PeerConnection;
use crate::registry::ServiceRegistry;
use crate::transport::{Transport, WriteError, WriteHandle};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer {0} is already connected")]
    DuplicatePeer(PeerId),

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("frame from {peer}: {error}")]
    Frame { peer: PeerId, error: WireError },

    #[error("peer {peer} did not negotiate service {service:#06x}")]
    ServiceNotNegotiated { peer: PeerId, service: ServiceType },
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

struct Inner {
    peers: DashMap<PeerId, Arc<PeerConnection>>,
    registry: ServiceRegistry,
    events: broadcast::Sender<PeerEvent>,
    connected: AtomicUsize,
}

/// Cheap to clone; every clone refers to the same peer table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(registry: ServiceRegistry) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                peers: DashMap::new(),
                registry,
                events,
                connected: AtomicUsize::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Register a peer after its handshake. `advertised` is what the peer
    /// offered; only the services registered here as well are negotiated.
    pub fn add_peer(
        &self,
        id: PeerId,
        transport: Arc<dyn Transport>,
        advertised: impl IntoIterator<Item = ServiceType>,
    ) -> Result<Arc<PeerConnection>, PeerError> {
        let registry = &self.inner.registry;
        let negotiated: Vec<ServiceType> = advertised
            .into_iter()
            .filter(|s| registry.contains(*s))
            .collect();

        let peer = match self.inner.peers.entry(id) {
            Entry::Occupied(_) => return Err(PeerError::DuplicatePeer(id)),
            Entry::Vacant(slot) => {
                let peer = PeerConnection::new(id, transport, negotiated.iter().copied());
                slot.insert(peer.clone());
                peer
            }
        };

        let count = self.inner.connected.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            peer = %id.short(),
            services = negotiated.len(),
            connected = count,
            "peer connected"
        );
        let _ = self.inner.events.send(PeerEvent::Connected(id));

        for service_type in negotiated {
            if let Some(service) = registry.get(service_type) {
                service.on_activate(self, &peer);
            }
        }
        Ok(peer)
    }

    /// Tear a peer down: cancel its tasks, notify its services, emit the
    /// disconnect event.
    pub fn remove_peer(&self, id: &PeerId) -> Result<(), PeerError> {
        let (_, peer) = self
            .inner
            .peers
            .remove(id)
            .ok_or(PeerError::NotConnected(*id))?;
        peer.close();

        for service_type in peer.services() {
            if let Some(service) = self.inner.registry.get(service_type) {
                service.on_deactivate(id);
            }
        }

        let count = self.inner.connected.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::info!(
            peer = %id.short(),
            sent = peer.bytes_sent(),
            received = peer.bytes_received(),
            connected = count,
            "peer disconnected"
        );
        let _ = self.inner.events.send(PeerEvent::Disconnected(*id));
        Ok(())
    }

    /// Disconnect everyone.
    pub fn shutdown(&self) {
        let ids: Vec<PeerId> = self.inner.peers.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.remove_peer(&id);
        }
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.inner.peers.get(id).map(|p| p.value().clone())
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.inner.peers.contains_key(id)
    }

    pub fn connected(&self) -> usize {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| *e.key()).collect()
    }

    /// The single capability gate.
    pub fn is_service_supported(&self, id: &PeerId, service: ServiceType) -> bool {
        self.inner
            .peers
            .get(id)
            .map(|p| p.supports(service))
            .unwrap_or(false)
    }

    /// Peers matching `required`, snapshotted so callbacks run without
    /// holding the table.
    fn matching(&self, required: Option<ServiceType>, except: Option<&PeerId>) -> Vec<Arc<PeerConnection>> {
        self.inner
            .peers
            .iter()
            .filter(|e| Some(e.key()) != except)
            .filter(|e| required.map_or(true, |s| e.value().supports(s)))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Run `action` for every peer. `required = None` means every peer
    /// regardless of capability.
    pub fn for_each_peer(&self, required: Option<ServiceType>, mut action: impl FnMut(&Arc<PeerConnection>)) {
        for peer in self.matching(required, None) {
            action(&peer);
        }
    }

    pub fn for_each_peer_except(
        &self,
        sender: &PeerId,
        required: Option<ServiceType>,
        mut action: impl FnMut(&Arc<PeerConnection>),
    ) {
        for peer in self.matching(required, Some(sender)) {
            action(&peer);
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Serialize `item` for `service` and queue it to `target`. Failures to
    /// find the peer or the capability come back as an already-failed
    /// handle and nothing is written.
    pub fn write_item(&self, target: &PeerId, item: &dyn Item, service: ServiceType) -> WriteHandle {
        let Some(peer) = self.peer(target) else {
            tracing::debug!(peer = %target.short(), service, "write to unknown peer");
            return WriteHandle::failed(WriteError::PeerNotFound(*target));
        };
        if !peer.supports(service) {
            tracing::debug!(peer = %target.short(), service, "write for unsupported service");
            return WriteHandle::failed(WriteError::ServiceNotSupported {
                peer: *target,
                service,
            });
        }
        match ItemWriter::new().write(service, item) {
            Ok(raw) => peer.send(raw),
            Err(e) => {
                tracing::warn!(
                    peer = %target.short(),
                    service,
                    sub_type = item.sub_type(),
                    error = %e,
                    "failed to encode item"
                );
                WriteHandle::failed(WriteError::Encode(e))
            }
        }
    }

    /// Serialize once and queue the same frame to every peer supporting
    /// `service`, except `except`. Returns the number of peers written to.
    pub fn broadcast_item(&self, item: &dyn Item, service: ServiceType, except: Option<&PeerId>) -> Result<usize, WireError> {
        let raw = ItemWriter::new().write(service, item)?;
        let peers = self.matching(Some(service), except);
        for peer in &peers {
            // Frames share one buffer; the clone only bumps a refcount.
            drop(peer.send(raw.clone()));
        }
        Ok(peers.len())
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Accept one frame from `from`. The frame is decoded here; handling
    /// runs later on the peer's context. Frame errors discard the item and
    /// are counted on the connection.
    pub fn receive(&self, from: &PeerId, frame: Bytes) -> Result<(), PeerError> {
        let peer = self.peer(from).ok_or(PeerError::NotConnected(*from))?;

        let raw = RawItem::parse(frame).map_err(|error| self.frame_error(&peer, None, error))?;
        if !peer.supports(raw.service_type) && self.inner.registry.contains(raw.service_type) {
            peer.record_frame_error();
            tracing::warn!(
                peer = %from.short(),
                service = raw.service_type,
                sub_type = raw.sub_type,
                "item for a service the peer did not negotiate"
            );
            return Err(PeerError::ServiceNotNegotiated {
                peer: *from,
                service: raw.service_type,
            });
        }
        let (service, item) = self
            .inner
            .registry
            .decode(&raw)
            .map_err(|error| self.frame_error(&peer, Some(&raw), error))?;
        peer.record_received(raw.declared_size());

        let manager = self.clone();
        let target = peer.clone();
        let sub_type = raw.sub_type;
        peer.post(move || {
            if target.is_closed() {
                return;
            }
            if let Err(e) = service.handle_item(&manager, &target, item) {
                tracing::warn!(
                    peer = %target.id().short(),
                    service = service.name(),
                    sub_type,
                    error = %e,
                    "item handling failed"
                );
            }
        });
        Ok(())
    }

    fn frame_error(&self, peer: &PeerConnection, raw: Option<&RawItem>, error: WireError) -> PeerError {
        let consecutive = peer.record_frame_error();
        tracing::warn!(
            peer = %peer.id().short(),
            service = raw.map(|r| r.service_type),
            sub_type = raw.map(|r| r.sub_type),
            consecutive,
            error = %error,
            "discarding frame"
        );
        PeerError::Frame {
            peer: *peer.id(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;
    use crate::transport::ChannelTransport;
    use kindred_core::codec::{ItemBody, ItemFactory};
    use kindred_core::declared_fields;
    use std::sync::Mutex;
    use std::time::Duration;

    const ECHO: ServiceType = 0x0300;
    const OTHER: ServiceType = 0x0301;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        n: u32,
    }
    declared_fields!(Note { n });

    impl Item for Note {
        fn sub_type(&self) -> u8 {
            0x01
        }
        fn body(&self) -> ItemBody<'_> {
            ItemBody::Declared(self)
        }
    }

    #[derive(Default)]
    struct Recorder {
        service_type: ServiceType,
        factory: ItemFactory,
        seen: Mutex<Vec<(PeerId, u32)>>,
        activated: Mutex<Vec<PeerId>>,
        deactivated: Mutex<Vec<PeerId>>,
    }

    impl Service for Recorder {
        fn service_type(&self) -> ServiceType {
            self.service_type
        }
        fn name(&self) -> &str {
            "recorder"
        }
        fn item_factory(&self) -> &ItemFactory {
            &self.factory
        }
        fn on_activate(&self, _: &ConnectionManager, peer: &Arc<PeerConnection>) {
            self.activated.lock().unwrap().push(*peer.id());
        }
        fn on_deactivate(&self, peer: &PeerId) {
            self.deactivated.lock().unwrap().push(*peer);
        }
        fn handle_item(
            &self,
            _: &ConnectionManager,
            peer: &Arc<PeerConnection>,
            item: Box<dyn Item>,
        ) -> anyhow::Result<()> {
            let note = item
                .downcast_ref::<Note>()
                .ok_or_else(|| anyhow::anyhow!("not a note"))?;
            self.seen.lock().unwrap().push((*peer.id(), note.n));
            Ok(())
        }
    }

    fn setup() -> (ConnectionManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            service_type: ECHO,
            factory: ItemFactory::new().declared::<Note>(0x01),
            ..Recorder::default()
        });
        let mut registry = ServiceRegistry::new();
        registry.register(recorder.clone()).unwrap();
        registry
            .register(Arc::new(Recorder {
                service_type: OTHER,
                ..Recorder::default()
            }))
            .unwrap();
        (ConnectionManager::new(registry), recorder)
    }

    fn id(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    async fn settle(peer: &PeerConnection) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        peer.post(move || {
            let _ = tx.send(());
        });
        let _ = tokio::time::timeout(Duration::from_secs(1), rx).await;
    }

    #[tokio::test]
    async fn add_peer_negotiates_and_activates() {
        let (manager, recorder) = setup();
        let mut events = manager.subscribe();
        let (transport, _rx) = ChannelTransport::new();

        let peer = manager.add_peer(id(1), Arc::new(transport), [ECHO, 0x0999]).unwrap();
        assert!(peer.supports(ECHO));
        assert!(!peer.supports(0x0999));
        assert!(!manager.is_service_supported(&id(1), OTHER));
        assert_eq!(manager.connected(), 1);
        assert_eq!(*recorder.activated.lock().unwrap(), vec![id(1)]);
        assert_eq!(events.recv().await.unwrap(), PeerEvent::Connected(id(1)));
    }

    #[tokio::test]
    async fn duplicate_and_missing_peers_fail() {
        let (manager, recorder) = setup();
        let (t1, _r1) = ChannelTransport::new();
        let (t2, _r2) = ChannelTransport::new();
        manager.add_peer(id(1), Arc::new(t1), [ECHO]).unwrap();
        assert_eq!(
            manager.add_peer(id(1), Arc::new(t2), [ECHO]).unwrap_err(),
            PeerError::DuplicatePeer(id(1))
        );
        assert_eq!(manager.connected(), 1);

        manager.remove_peer(&id(1)).unwrap();
        assert_eq!(manager.remove_peer(&id(1)), Err(PeerError::NotConnected(id(1))));
        assert_eq!(manager.connected(), 0);
        assert_eq!(*recorder.deactivated.lock().unwrap(), vec![id(1)]);
    }

    #[tokio::test]
    async fn capability_gate_writes_nothing() {
        let (manager, _) = setup();
        let (transport, mut rx) = ChannelTransport::new();
        let peer = manager.add_peer(id(1), Arc::new(transport), [ECHO]).unwrap();

        let handle = manager.write_item(&id(1), &Note { n: 1 }, OTHER);
        assert!(handle.is_failed());
        assert!(matches!(
            handle.await,
            Err(WriteError::ServiceNotSupported { service: OTHER, .. })
        ));
        assert!(manager.write_item(&id(9), &Note { n: 1 }, ECHO).is_failed());
        assert!(rx.try_recv().is_none());
        assert_eq!(peer.bytes_sent(), 0);

        let written = manager.write_item(&id(1), &Note { n: 1 }, ECHO);
        let frame = rx.recv().await.unwrap();
        assert_eq!(written.await, Ok(frame.len()));
        assert_eq!(peer.bytes_sent(), frame.len() as u64);
    }

    #[tokio::test]
    async fn broadcast_respects_capability_and_exception() {
        let (manager, _) = setup();
        let (t1, mut r1) = ChannelTransport::new();
        let (t2, mut r2) = ChannelTransport::new();
        let (t3, mut r3) = ChannelTransport::new();
        manager.add_peer(id(1), Arc::new(t1), [ECHO]).unwrap();
        manager.add_peer(id(2), Arc::new(t2), [ECHO]).unwrap();
        manager.add_peer(id(3), Arc::new(t3), [OTHER]).unwrap();

        let sent = manager.broadcast_item(&Note { n: 4 }, ECHO, Some(&id(2))).unwrap();
        assert_eq!(sent, 1);
        assert!(r1.recv().await.is_some());
        assert!(r2.try_recv().is_none());
        assert!(r3.try_recv().is_none());

        let mut all = 0;
        manager.for_each_peer(None, |_| all += 1);
        let mut others = 0;
        manager.for_each_peer_except(&id(1), Some(ECHO), |_| others += 1);
        assert_eq!((all, others), (3, 1));
    }

    #[tokio::test]
    async fn receive_dispatches_on_peer_context() {
        let (manager, recorder) = setup();
        let (transport, _rx) = ChannelTransport::new();
        let peer = manager.add_peer(id(1), Arc::new(transport), [ECHO]).unwrap();

        for n in 0..3 {
            let raw = ItemWriter::new().write(ECHO, &Note { n }).unwrap();
            manager.receive(&id(1), raw.into_frame()).unwrap();
        }
        settle(&peer).await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![(id(1), 0), (id(1), 1), (id(1), 2)]
        );
        assert!(peer.bytes_received() > 0);
    }

    #[tokio::test]
    async fn frame_errors_are_counted_and_reset() {
        let (manager, _) = setup();
        let (transport, _rx) = ChannelTransport::new();
        let peer = manager.add_peer(id(1), Arc::new(transport), [ECHO]).unwrap();

        let garbage = Bytes::from_static(&[9, 0, 0, 0, 0, 0, 0, 8]);
        assert!(matches!(
            manager.receive(&id(1), garbage.clone()),
            Err(PeerError::Frame { .. })
        ));
        let unknown = ItemWriter::new().write(0x0999, &Note { n: 1 }).unwrap();
        assert!(matches!(
            manager.receive(&id(1), unknown.into_frame()),
            Err(PeerError::Frame {
                error: WireError::NoSuchItem { .. },
                ..
            })
        ));
        assert_eq!(peer.frame_errors(), 2);

        let good = ItemWriter::new().write(ECHO, &Note { n: 1 }).unwrap();
        manager.receive(&id(1), good.into_frame()).unwrap();
        assert_eq!(peer.frame_errors(), 0);

        assert_eq!(
            manager.receive(&id(7), garbage),
            Err(PeerError::NotConnected(id(7)))
        );
    }

    #[tokio::test]
    async fn removal_cancels_pending_handling() {
        let (manager, recorder) = setup();
        let (transport, _rx) = ChannelTransport::new();
        let peer = manager.add_peer(id(1), Arc::new(transport), [ECHO]).unwrap();
        peer.schedule(Duration::from_secs(3600), || {});

        manager.remove_peer(&id(1)).unwrap();
        assert!(peer.is_closed());
        assert_eq!(peer.scheduled(), 0);
        let raw = ItemWriter::new().write(ECHO, &Note { n: 1 }).unwrap();
        assert_eq!(
            manager.receive(&id(1), raw.into_frame()),
            Err(PeerError::NotConnected(id(1)))
        );
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
