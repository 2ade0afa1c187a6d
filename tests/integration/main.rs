//! Kindred integration test harness.
//!
//! Nodes run in-process. Each link is a pair of in-memory transports with
//! a pump task per direction feeding frames to the other side's
//! connection manager, so everything above the socket is exercised:
//! dispatch, per-peer execution, transactions, authentication and the
//! stores.
//!
//! Scheduled sync cycles are pushed an hour out; tests drive cycles with
//! `trigger_sync` and poll for the outcome.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::task::JoinHandle;

use kindred_core::crypto::Keypair;
use kindred_core::gxs::{DistributionScope, GxsGroup, GxsMessage, SignatureKind};
use kindred_core::wire::service_types::FORUMS;
use kindred_core::{GroupId, IdentityId, MessageId, PeerId, RawItem};
use kindred_services::gxs::items::{exchange_factory, sub_types, TransactionItem};
use kindred_services::gxs::content_types;
use kindred_services::{
    ChannelReceiver, ChannelTransport, ConnectionManager, GxsService, IdentityRegistry, MemoryStore,
    ReplicatingHooks, ServiceRegistry, SyncConfig,
};

mod atomicity;
mod auth;
mod capability;
mod convergence;
mod orphans;
mod scenario;

// ── Nodes ─────────────────────────────────────────────────────────────────────

pub struct Node {
    pub id: PeerId,
    pub manager: ConnectionManager,
    pub forums: GxsService<ReplicatingHooks>,
    pub identities: IdentityRegistry,
}

impl Node {
    /// A node running the forums service, subscribing to everything it
    /// receives.
    pub fn forums(seed: u8) -> Result<Self> {
        let identities = IdentityRegistry::new();
        let forums = GxsService::new(
            FORUMS,
            "forums",
            ReplicatingHooks::forums().auto_subscribe(true),
            Arc::new(MemoryStore::new()),
            identities.clone(),
            quiet_sync(),
        );
        let mut registry = ServiceRegistry::new();
        registry.register(Arc::new(forums.clone()))?;
        Ok(Self {
            id: PeerId([seed; 32]),
            manager: ConnectionManager::new(registry),
            forums,
            identities,
        })
    }

    /// Publish a signed public forum.
    pub fn publish_forum(&self, admin: &Keypair, name: &str) -> Result<GxsGroup> {
        let group = GxsGroup::new(name, DistributionScope::Public, admin.public, Bytes::from(name.to_owned()));
        self.forums
            .publish_group(group, &[(SignatureKind::Admin, admin)])
            .context("publishing forum")
    }

    /// Publish a top-level post signed by `author`, registering the author
    /// locally first.
    pub fn post(&self, group: &GroupId, author: &Keypair, text: &'static str) -> Result<GxsMessage> {
        self.identities.insert(author.public);
        let mut post = GxsMessage::new(*group, content_types::POST, Bytes::from_static(text.as_bytes()));
        post.author = Some(IdentityId::from_public_key(&author.public));
        self.forums
            .publish_message(post, &[(SignatureKind::Author, author)])
            .context("publishing post")
    }

    pub fn groups(&self) -> Vec<GxsGroup> {
        self.forums.store().groups().unwrap_or_default()
    }

    pub fn has_group(&self, id: &GroupId) -> bool {
        matches!(self.forums.store().group(id), Ok(Some(_)))
    }

    pub fn has_message(&self, group: &GroupId, message: &MessageId) -> bool {
        self.forums.store().has_message(group, message).unwrap_or(false)
    }

    pub fn sync_with(&self, peer: &Node) -> bool {
        self.forums.trigger_sync(&self.manager, &peer.id)
    }
}

/// Sync timing with the periodic cycle out of the way.
fn quiet_sync() -> SyncConfig {
    SyncConfig {
        initial_delay: (Duration::from_secs(3600), Duration::from_secs(3600)),
        ..SyncConfig::default()
    }
}

// ── Links ─────────────────────────────────────────────────────────────────────

/// One frame seen on a link, before any filtering.
#[derive(Debug, Clone)]
pub struct Sent {
    pub from: PeerId,
    pub sub_type: u8,
    /// Flags of transaction control items.
    pub flags: Option<u16>,
}

type Filter = Arc<dyn Fn(&PeerId, &RawItem) -> bool + Send + Sync>;

pub struct Link {
    log: Arc<Mutex<Vec<Sent>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn sent(&self) -> Vec<Sent> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn count(&self, mut pred: impl FnMut(&Sent) -> bool) -> usize {
        self.sent().iter().filter(|s| pred(s)).count()
    }

    pub fn cut(self) {
        for pump in self.pumps {
            pump.abort();
        }
    }
}

/// Connect two nodes, both advertising forums.
pub fn connect(a: &Node, b: &Node) -> Result<Link> {
    connect_filtered(a, b, Arc::new(|_, _| true))
}

/// Connect two nodes; frames for which `deliver` returns false are
/// logged but never reach the other side.
pub fn connect_filtered(a: &Node, b: &Node, deliver: Filter) -> Result<Link> {
    let (to_b, from_a) = ChannelTransport::new();
    let (to_a, from_b) = ChannelTransport::new();
    a.manager.add_peer(b.id, Arc::new(to_b), [FORUMS])?;
    b.manager.add_peer(a.id, Arc::new(to_a), [FORUMS])?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let pumps = vec![
        pump(from_a, a.id, b.manager.clone(), log.clone(), deliver.clone()),
        pump(from_b, b.id, a.manager.clone(), log.clone(), deliver),
    ];
    Ok(Link { log, pumps })
}

fn pump(
    mut rx: ChannelReceiver,
    from: PeerId,
    to: ConnectionManager,
    log: Arc<Mutex<Vec<Sent>>>,
    deliver: Filter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let factory = exchange_factory();
        while let Some(frame) = rx.recv().await {
            let Ok(raw) = RawItem::parse(frame.clone()) else { continue };
            let flags = if raw.sub_type == sub_types::TRANSACTION {
                factory
                    .decode(&raw)
                    .ok()
                    .and_then(|item| item.downcast_ref::<TransactionItem>().map(|t| t.flags))
            } else {
                None
            };
            if let Ok(mut log) = log.lock() {
                log.push(Sent {
                    from,
                    sub_type: raw.sub_type,
                    flags,
                });
            }
            if deliver(&from, &raw) {
                let _ = to.receive(&from, frame);
            }
        }
    })
}

// ── Polling ───────────────────────────────────────────────────────────────────

/// Poll `check` until it holds, for up to five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Let queued frames and posted jobs drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
