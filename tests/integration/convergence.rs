use anyhow::Result;
use kindred_core::crypto::Keypair;

use crate::*;

/// Two nodes with disjoint forums end up with the union after each has
/// run one cycle against the other.
#[tokio::test]
async fn disjoint_nodes_converge() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let author = Keypair::generate();
    // Both sides know the author, as they would after an identity sync.
    a.identities.insert(author.public);
    b.identities.insert(author.public);

    let forum_a = a.publish_forum(&Keypair::generate(), "from-a")?;
    let post_a = a.post(&forum_a.id, &author, "hello from a")?;
    let forum_b = b.publish_forum(&Keypair::generate(), "from-b")?;
    let post_b = b.post(&forum_b.id, &author, "hello from b")?;

    let _link = connect(&a, &b)?;
    assert!(a.sync_with(&b));
    assert!(b.sync_with(&a));

    eventually("b to hold a's forum and post", || {
        b.has_group(&forum_a.id) && b.has_message(&forum_a.id, &post_a.id)
    })
    .await?;
    eventually("a to hold b's forum and post", || {
        a.has_group(&forum_b.id) && a.has_message(&forum_b.id, &post_b.id)
    })
    .await?;

    assert_eq!(a.groups().len(), 2);
    assert_eq!(b.groups().len(), 2);
    assert!(b.groups().iter().all(|g| g.subscribed));
    Ok(())
}

/// Applying the same group twice leaves the store as it was after the
/// first time.
#[tokio::test]
async fn repeated_cycles_are_idempotent() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let forum = a.publish_forum(&Keypair::generate(), "steady")?;

    let link = connect(&a, &b)?;
    b.sync_with(&a);
    eventually("b to fetch the forum", || b.has_group(&forum.id)).await?;
    settle().await;
    let first = b.groups();
    let frames = link.sent().len();

    b.sync_with(&a);
    b.sync_with(&a);
    settle().await;

    assert_eq!(b.groups(), first);
    // Only the two requests per cycle: a has nothing newer to offer.
    let requests = link.sent().len() - frames;
    assert_eq!(requests, 4, "{:?}", &link.sent()[frames..]);
    Ok(())
}

/// A republished forum with a later publish time replaces the copy held
/// by a friend.
#[tokio::test]
async fn newer_group_replaces_older() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let admin = Keypair::generate();
    let forum = a.publish_forum(&admin, "v1")?;

    let _link = connect(&a, &b)?;
    b.sync_with(&a);
    eventually("b to fetch v1", || b.has_group(&forum.id)).await?;

    let mut update = forum.clone();
    update.name = "v2".into();
    update.signatures.clear();
    update.published = kindred_core::Timestamp::from_secs(forum.published.as_secs() + 5);
    a.forums
        .publish_group(update, &[(kindred_core::gxs::SignatureKind::Admin, &admin)])?;

    b.sync_with(&a);
    eventually("b to hold v2", || {
        b.forums
            .store()
            .group(&forum.id)
            .ok()
            .flatten()
            .is_some_and(|g| g.name == "v2")
    })
    .await?;
    assert_eq!(b.groups().len(), 1);
    Ok(())
}
