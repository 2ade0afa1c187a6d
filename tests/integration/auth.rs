use anyhow::Result;
use bytes::Bytes;
use kindred_core::crypto::Keypair;
use kindred_core::gxs::{DistributionScope, GxsGroup, GxsMessage, SignatureKind};
use kindred_core::{IdentityId, Timestamp};
use kindred_services::gxs::{content_types, WriteBatch};

use crate::*;

/// Store groups on `node` behind the engine's back, as a misbehaving
/// friend would hold them.
fn plant(node: &Node, groups: Vec<GxsGroup>, messages: Vec<GxsMessage>) -> Result<()> {
    let mut batch = WriteBatch::new();
    for mut group in groups {
        group.subscribed = true;
        batch.put_group(group);
    }
    for message in messages {
        batch.put_message(message);
    }
    batch.set_last_update(Timestamp::now());
    node.forums.store().commit(batch)?;
    Ok(())
}

/// Groups missing or forging their admin signature never reach a
/// friend's store, however often it syncs.
#[tokio::test]
async fn badly_signed_groups_are_never_stored() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;

    let unsigned = GxsGroup::new("unsigned", DistributionScope::Public, Keypair::generate().public, Bytes::new());
    let mut forged = GxsGroup::new("forged", DistributionScope::Public, Keypair::generate().public, Bytes::new());
    forged.sign(SignatureKind::Admin, &Keypair::generate());
    plant(&a, vec![unsigned.clone(), forged.clone()], vec![])?;
    let good = a.publish_forum(&Keypair::generate(), "good")?;

    let _link = connect(&a, &b)?;
    for _ in 0..3 {
        b.sync_with(&a);
        eventually("b to hold the good forum", || b.has_group(&good.id)).await?;
        settle().await;
        assert!(!b.has_group(&unsigned.id));
        assert!(!b.has_group(&forged.id));
    }
    assert_eq!(b.groups().len(), 1);
    Ok(())
}

/// A forum post without its author signature is refused while a signed
/// post in the same transaction is stored.
#[tokio::test]
async fn unsigned_post_is_refused() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let author = Keypair::generate();
    b.identities.insert(author.public);

    let forum = a.publish_forum(&Keypair::generate(), "posts")?;
    let signed = a.post(&forum.id, &author, "signed")?;

    let mut unsigned = GxsMessage::new(forum.id, content_types::POST, Bytes::from_static(b"unsigned"));
    unsigned.author = Some(IdentityId::from_public_key(&author.public));
    unsigned.seal();
    plant(&a, vec![], vec![unsigned.clone()])?;
    assert!(a.has_message(&forum.id, &unsigned.id));

    let _link = connect(&a, &b)?;
    b.sync_with(&a);
    eventually("b to hold the signed post", || b.has_message(&forum.id, &signed.id)).await?;
    settle().await;
    assert!(!b.has_message(&forum.id, &unsigned.id));
    Ok(())
}

/// Posts by authors a node has never heard of are not stored.
#[tokio::test]
async fn unknown_author_is_refused() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let stranger = Keypair::generate();

    let forum = a.publish_forum(&Keypair::generate(), "strangers")?;
    let post = a.post(&forum.id, &stranger, "who am i")?;

    let _link = connect(&a, &b)?;
    b.sync_with(&a);
    eventually("b to hold the forum", || b.has_group(&forum.id)).await?;
    settle().await;
    assert!(!b.has_message(&forum.id, &post.id));
    Ok(())
}
