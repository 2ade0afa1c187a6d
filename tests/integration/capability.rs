use std::sync::Arc;

use anyhow::Result;
use kindred_core::codec::ItemWriter;
use kindred_core::wire::service_types::{CHANNELS, FORUMS};
use kindred_core::PeerId;
use kindred_services::gxs::items::SyncGroupRequest;
use kindred_services::{ChannelTransport, PeerError, PeerEvent, WriteError};

use crate::*;

/// Writing a forums item to a friend that only runs channels fails at
/// once and puts nothing on the wire.
#[tokio::test]
async fn write_to_peer_without_service_fails() -> Result<()> {
    let a = Node::forums(1)?;
    let channels_only = PeerId([9; 32]);
    let (transport, mut rx) = ChannelTransport::new();
    let peer = a.manager.add_peer(channels_only, Arc::new(transport), [CHANNELS])?;
    assert!(!peer.supports(FORUMS));
    assert!(!a.manager.is_service_supported(&channels_only, FORUMS));

    let mut handle = a.manager.write_item(&channels_only, &SyncGroupRequest::default(), FORUMS);
    assert!(handle.is_failed());
    assert_eq!(
        handle.try_result(),
        Some(Err(WriteError::ServiceNotSupported {
            peer: channels_only,
            service: FORUMS,
        }))
    );
    assert!(rx.try_recv().is_none());

    let stranger = PeerId([8; 32]);
    let handle = a.manager.write_item(&stranger, &SyncGroupRequest::default(), FORUMS);
    assert_eq!(handle.wait().await, Err(WriteError::PeerNotFound(stranger)));
    Ok(())
}

/// Items for a service the sender never negotiated are refused and
/// counted as frame errors.
#[tokio::test]
async fn items_for_unnegotiated_service_are_refused() -> Result<()> {
    let a = Node::forums(1)?;
    let peer_id = PeerId([9; 32]);
    let (transport, _rx) = ChannelTransport::new();
    let peer = a.manager.add_peer(peer_id, Arc::new(transport), [CHANNELS])?;

    let raw = ItemWriter::new().write(FORUMS, &SyncGroupRequest::default())?;
    let result = a.manager.receive(&peer_id, raw.into_frame());
    assert_eq!(
        result,
        Err(PeerError::ServiceNotNegotiated {
            peer: peer_id,
            service: FORUMS,
        })
    );
    assert_eq!(peer.frame_errors(), 1);
    Ok(())
}

/// Connect and disconnect are announced, and a second registration of
/// the same friend is refused.
#[tokio::test]
async fn peer_lifecycle_events() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let mut events = a.manager.subscribe();

    let link = connect(&a, &b)?;
    assert_eq!(events.recv().await?, PeerEvent::Connected(b.id));
    assert_eq!(a.manager.connected(), 1);

    let (again, _rx) = ChannelTransport::new();
    assert_eq!(
        a.manager.add_peer(b.id, Arc::new(again), [FORUMS]).err(),
        Some(PeerError::DuplicatePeer(b.id))
    );

    a.manager.remove_peer(&b.id)?;
    assert_eq!(events.recv().await?, PeerEvent::Disconnected(b.id));
    assert_eq!(a.manager.connected(), 0);
    assert!(!a.sync_with(&b));
    link.cut();
    Ok(())
}
