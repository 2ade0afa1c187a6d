use anyhow::{Context, Result};
use bytes::Bytes;
use kindred_core::crypto::Keypair;
use kindred_core::gxs::{DistributionScope, GxsGroup, SignatureKind};
use kindred_core::wire::service_types::FORUMS;
use kindred_core::Timestamp;
use kindred_services::gxs::items::{flags, sub_types, ExchangeItem, SyncGroupEntry};
use kindred_services::gxs::TransactionKind;

use crate::*;

fn requests_from(link: &Link, node: &Node) -> usize {
    link.count(|s| {
        s.from == node.id && s.flags == Some(flags::BEGIN_INCOMING | flags::GROUP_LIST_REQUEST)
    })
}

/// a advertises G1 published at t=100; b fetches it once and keeps
/// published = 100. The same advertisement again costs no fetch.
#[tokio::test]
async fn advertised_group_is_fetched_once() -> Result<()> {
    let a = Node::forums(1)?;
    let b = Node::forums(2)?;
    let admin = Keypair::generate();

    let mut g1 = GxsGroup::new("G1", DistributionScope::Public, admin.public, Bytes::from_static(b"g1"));
    g1.published = Timestamp::from_secs(100);
    let g1 = a.forums.publish_group(g1, &[(SignatureKind::Admin, &admin)])?;
    assert!(!b.has_group(&g1.id));

    let link = connect(&a, &b)?;
    b.sync_with(&a);
    eventually("b to store G1", || b.has_group(&g1.id)).await?;

    let stored = b.forums.store().group(&g1.id)?.context("G1 missing")?;
    assert_eq!(stored.published.as_secs(), 100);
    assert_eq!(requests_from(&link, &b), 1);
    settle().await;

    // Push the same advertisement again, outside of any cycle.
    let peer = a.manager.peer(&b.id).context("b not connected to a")?;
    let entry = SyncGroupEntry {
        group_id: g1.id,
        published: 100,
        ..SyncGroupEntry::default()
    };
    let update_ts = a.forums.store().last_update()?.to_wire();
    let begin = a.forums.transactions().begin_outgoing(
        &peer,
        TransactionKind::GroupListResponse,
        vec![ExchangeItem::GroupEntry(entry)],
        update_ts,
    )?;
    a.manager.write_item(&b.id, &begin, FORUMS);

    eventually("b to accept the advertisement", || {
        link.count(|s| {
            s.from == b.id && s.flags == Some(flags::END_SUCCESS | flags::GROUP_LIST_RESPONSE)
        }) == 2
    })
    .await?;
    settle().await;
    assert_eq!(requests_from(&link, &b), 1);

    // A regular cycle finds nothing new either.
    b.sync_with(&a);
    settle().await;
    assert_eq!(requests_from(&link, &b), 1);
    assert_eq!(
        link.count(|s| s.from == a.id && s.sub_type == sub_types::TRANSFER_GROUP),
        1
    );
    Ok(())
}
