use anyhow::{Context, Result};
use kindred_core::crypto::Keypair;
use kindred_core::wire::service_types::FORUMS;
use kindred_services::gxs::items::{flags, ExchangeItem, TransferMessage};
use kindred_services::gxs::TransactionKind;

use crate::*;

/// A message pushed ahead of its forum is dropped without failing the
/// transaction; the next cycle brings the forum and then the message.
#[tokio::test]
async fn message_before_group_is_dropped_then_fetched() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let author = Keypair::generate();
    b.identities.insert(author.public);

    let forum = a.publish_forum(&Keypair::generate(), "ahead")?;
    let post = a.post(&forum.id, &author, "too early")?;

    let link = connect(&a, &b)?;
    let peer = a.manager.peer(&b.id).context("b not connected to a")?;
    let begin = a.forums.transactions().begin_outgoing(
        &peer,
        TransactionKind::Messages,
        vec![ExchangeItem::Message(TransferMessage::new(&post))],
        0,
    )?;
    assert!(!a.manager.write_item(&b.id, &begin, FORUMS).is_failed());

    eventually("b to acknowledge the message transaction", || {
        link.count(|s| {
            s.from == b.id && s.flags == Some(flags::END_SUCCESS | flags::MESSAGES)
        }) == 1
    })
    .await?;
    assert!(!b.has_message(&forum.id, &post.id));
    assert!(b.groups().is_empty());
    assert_eq!(b.forums.transactions().open_incoming(&a.id), 0);

    b.sync_with(&a);
    eventually("b to fetch the forum and its post", || {
        b.has_group(&forum.id) && b.has_message(&forum.id, &post.id)
    })
    .await?;
    Ok(())
}
