use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use kindred_core::crypto::Keypair;
use kindred_core::{PeerId, RawItem};
use kindred_core::wire::service_types::FORUMS;
use kindred_services::gxs::items::{sub_types, SyncGroupRequest};

use crate::*;

/// A group transfer that loses one of its items is never applied, and
/// the half-received transaction is discarded when the friend goes away.
#[tokio::test]
async fn incomplete_transfer_applies_nothing() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let first = a.publish_forum(&Keypair::generate(), "first")?;
    let second = a.publish_forum(&Keypair::generate(), "second")?;

    // Let the first group transfer through, lose every later one.
    let transfers = Arc::new(AtomicUsize::new(0));
    let sender = a.id;
    let counter = transfers.clone();
    let link = connect_filtered(
        &a,
        &b,
        Arc::new(move |from: &PeerId, raw: &RawItem| {
            if *from != sender || raw.sub_type != sub_types::TRANSFER_GROUP {
                return true;
            }
            counter.fetch_add(1, Ordering::SeqCst) == 0
        }),
    )?;

    b.sync_with(&a);
    eventually("a to send both groups", || {
        link.count(|s| s.from == a.id && s.sub_type == sub_types::TRANSFER_GROUP) == 2
    })
    .await?;
    settle().await;

    assert_eq!(transfers.load(Ordering::SeqCst), 2);
    assert_eq!(b.forums.transactions().open_incoming(&a.id), 1);
    assert!(!b.has_group(&first.id));
    assert!(!b.has_group(&second.id));

    b.manager.remove_peer(&a.id)?;
    a.manager.remove_peer(&b.id)?;
    link.cut();

    assert_eq!(b.forums.transactions().open_incoming(&a.id), 0);
    assert!(b.groups().is_empty());
    Ok(())
}

/// Disconnecting mid-transaction also clears the sender's side.
#[tokio::test]
async fn disconnect_clears_outgoing_transactions() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    a.publish_forum(&Keypair::generate(), "pending")?;

    // b's transaction replies never reach a, so a's advertisement is
    // never accepted.
    let silent = b.id;
    let link = connect_filtered(
        &a,
        &b,
        Arc::new(move |from: &PeerId, raw: &RawItem| *from != silent || raw.sub_type != sub_types::TRANSACTION),
    )?;

    // a answers a group request it receives by opening a transaction.
    let request = SyncGroupRequest::default();
    assert!(!b.manager.write_item(&a.id, &request, FORUMS).is_failed());
    eventually("a to open its advertisement", || {
        a.forums.transactions().open_outgoing(&b.id) == 1
    })
    .await?;

    a.manager.remove_peer(&b.id)?;
    assert_eq!(a.forums.transactions().open_outgoing(&b.id), 0);
    link.cut();
    Ok(())
}
