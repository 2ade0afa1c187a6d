//! The GXS sync engine.
//!
//! One cycle with one friend, requester on the left:
//!
//! ```text
//!   SyncGroupRequest(last_updated)          ──►
//!                        ◄──  GroupListResponse tx: (id, published) entries
//!   GroupListRequest tx: ids we lack or hold older ──►
//!                        ◄──  Groups tx: full signed groups
//!   SyncMessageRequest(group, last_updated) ──►   one per subscribed group
//!                        ◄──  MessageListResponse tx: message ids
//!   MessageListRequest tx: ids we lack      ──►
//!                        ◄──  Messages tx: full signed messages
//! ```
//!
//! Both friends run the same cycle against each other. Every received
//! transaction is applied in one store commit, together with the watermark
//! that lets the next request skip unchanged data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kindred_core::config::GxsConfig;
use kindred_core::crypto::{Ed25519, Signer, Verifier};
use kindred_core::gxs::{AuthenticationRequirements, GxsGroup, GxsMessage, SignatureKind};
use kindred_core::{GroupId, Item, ItemFactory, PeerId, ServiceType, Timestamp};
use rand::Rng;
use thiserror::Error;

use super::auth::{AuthContext, AuthError};
use super::items::{
    exchange_factory, ExchangeItem, SyncGroupEntry, SyncGroupRequest, SyncMessageEntry, SyncMessageRequest,
    TransactionItem, TransferGroup, TransferMessage,
};
use super::store::{GxsStore, StoreError, WriteBatch};
use super::transaction::{ControlAction, SyncTransaction, TransactionKind, TransactionManager};
use super::{GxsHooks, MessageClass};
use crate::identity::IdentityRegistry;
use crate::manager::ConnectionManager;
use crate::peer::PeerConnection;
use crate::service::Service;

/// Sync timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// The first cycle with a new friend starts at a random point in
    /// this window.
    pub initial_delay: (Duration, Duration),
    pub period: Duration,
    /// How far back messages are requested.
    pub message_window: Duration,
    pub transaction_timeout: Duration,
}

impl SyncConfig {
    pub fn from_config(config: &GxsConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            period: config.sync_period(),
            message_window: config.message_window(),
            transaction_timeout: config.transaction_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_delay: (Duration::from_secs(10), Duration::from_secs(15)),
            period: Duration::from_secs(60),
            message_window: Duration::from_secs(5 * 365 * 24 * 3600),
            transaction_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("group {0} already published at or after this time")]
    Stale(GroupId),
}

struct Inner<H> {
    service_type: ServiceType,
    name: String,
    hooks: H,
    policy: AuthenticationRequirements,
    store: Arc<dyn GxsStore>,
    identities: IdentityRegistry,
    verifier: Arc<dyn Verifier>,
    transactions: TransactionManager,
    factory: ItemFactory,
    config: SyncConfig,
}

/// A GXS service: the shared engine driven by a service's hooks.
pub struct GxsService<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for GxsService<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: GxsHooks> GxsService<H> {
    pub fn new(
        service_type: ServiceType,
        name: impl Into<String>,
        hooks: H,
        store: Arc<dyn GxsStore>,
        identities: IdentityRegistry,
        config: SyncConfig,
    ) -> Self {
        Self::with_verifier(service_type, name, hooks, store, identities, Arc::new(Ed25519), config)
    }

    pub fn with_verifier(
        service_type: ServiceType,
        name: impl Into<String>,
        hooks: H,
        store: Arc<dyn GxsStore>,
        identities: IdentityRegistry,
        verifier: Arc<dyn Verifier>,
        config: SyncConfig,
    ) -> Self {
        let policy = hooks.authentication();
        Self {
            inner: Arc::new(Inner {
                service_type,
                name: name.into(),
                hooks,
                policy,
                store,
                identities,
                verifier,
                transactions: TransactionManager::new(service_type, config.transaction_timeout),
                factory: exchange_factory(),
                config,
            }),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.inner.hooks
    }

    pub fn store(&self) -> &Arc<dyn GxsStore> {
        &self.inner.store
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    fn auth(&self) -> AuthContext<'_> {
        AuthContext {
            policy: &self.inner.policy,
            identities: &self.inner.identities,
            verifier: self.inner.verifier.as_ref(),
        }
    }

    fn send(&self, manager: &ConnectionManager, peer: &PeerId, item: &dyn Item) {
        let handle = manager.write_item(peer, item, self.inner.service_type);
        if handle.is_failed() {
            tracing::debug!(
                peer = %peer.short(),
                service = %self.inner.name,
                sub_type = item.sub_type(),
                "sync write rejected"
            );
        }
    }

    fn begin(&self, manager: &ConnectionManager, peer: &PeerConnection, kind: TransactionKind, items: Vec<ExchangeItem>, update_ts: u32) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let begin = self.inner.transactions.begin_outgoing(peer, kind, items, update_ts)?;
        self.send(manager, peer.id(), &begin);
        Ok(())
    }

    // ── Requester ─────────────────────────────────────────────────────────────

    /// Run one sync cycle against `peer` on the calling task. Stale
    /// transactions are swept first.
    pub fn sync_with(&self, manager: &ConnectionManager, peer: &Arc<PeerConnection>) {
        self.inner.transactions.expire();
        if let Err(e) = self.request_updates(manager, peer) {
            tracing::warn!(
                peer = %peer.id().short(),
                service = %self.inner.name,
                error = %e,
                "sync cycle failed"
            );
        }
    }

    /// Queue a sync cycle on the peer's execution context.
    pub fn trigger_sync(&self, manager: &ConnectionManager, peer: &PeerId) -> bool {
        let Some(conn) = manager.peer(peer) else {
            return false;
        };
        let service = self.clone();
        let manager = manager.clone();
        let target = conn.clone();
        conn.post(move || service.sync_with(&manager, &target))
    }

    fn request_updates(&self, manager: &ConnectionManager, peer: &Arc<PeerConnection>) -> Result<(), StoreError> {
        let store = &self.inner.store;
        let request = SyncGroupRequest {
            last_updated: store.watermark(peer.id(), None)?.to_wire(),
            ..SyncGroupRequest::default()
        };
        self.send(manager, peer.id(), &request);

        for group in store.groups()?.iter().filter(|g| g.subscribed) {
            self.request_messages(manager, peer, &group.id)?;
        }
        Ok(())
    }

    fn request_messages(&self, manager: &ConnectionManager, peer: &PeerConnection, group: &GroupId) -> Result<(), StoreError> {
        let since = Timestamp::now().saturating_sub(self.inner.config.message_window);
        let request = SyncMessageRequest {
            create_since: since.to_wire(),
            last_updated: self.inner.store.watermark(peer.id(), Some(group))?.to_wire(),
            group_id: *group,
            ..SyncMessageRequest::default()
        };
        self.send(manager, peer.id(), &request);
        Ok(())
    }

    /// Ask every friend running this service for the messages of `group`
    /// now instead of at the next cycle.
    pub fn refresh_group(&self, manager: &ConnectionManager, group: &GroupId) {
        manager.for_each_peer(Some(self.inner.service_type), |peer| {
            let service = self.clone();
            let manager = manager.clone();
            let target = peer.clone();
            let group = *group;
            peer.post(move || {
                if let Err(e) = service.request_messages(&manager, &target, &group) {
                    tracing::warn!(peer = %target.id().short(), group = %group.short(), error = %e, "refresh failed");
                }
            });
        });
    }

    /// Keep advertised entries we lack, or whose publish time is newer
    /// than ours. Compared in whole seconds.
    fn reconcile_groups(&self, manager: &ConnectionManager, peer: &PeerConnection, tx: SyncTransaction) -> Result<()> {
        let store = &self.inner.store;
        let mut wanted = Vec::new();
        for item in tx.items {
            let ExchangeItem::GroupEntry(entry) = item else { continue };
            let newer = match store.group(&entry.group_id)? {
                None => true,
                Some(local) => u64::from(entry.published) > local.published.as_secs(),
            };
            if newer {
                wanted.push(ExchangeItem::GroupEntry(SyncGroupEntry {
                    transaction_id: 0,
                    ..entry
                }));
            }
        }

        tracing::debug!(
            peer = %peer.id().short(),
            service = %self.inner.name,
            wanted = wanted.len(),
            "group list reconciled"
        );
        if wanted.is_empty() {
            let mut batch = WriteBatch::new();
            batch.set_watermark(*peer.id(), None, Timestamp::from_wire(tx.update_ts));
            store.commit(batch)?;
            return Ok(());
        }
        self.begin(manager, peer, TransactionKind::GroupListRequest, wanted, tx.update_ts)
    }

    /// Keep advertised message ids we do not hold, for groups we know.
    fn reconcile_messages(&self, manager: &ConnectionManager, peer: &PeerConnection, tx: SyncTransaction) -> Result<()> {
        let store = &self.inner.store;
        let mut wanted = Vec::new();
        let mut groups = Vec::new();
        let mut missing = Vec::new();
        for item in tx.items {
            let ExchangeItem::MessageEntry(entry) = item else { continue };
            if !groups.contains(&entry.group_id) {
                if store.group(&entry.group_id)?.is_none() {
                    continue;
                }
                groups.push(entry.group_id);
            }
            if !store.has_message(&entry.group_id, &entry.message_id)? {
                if !missing.contains(&entry.group_id) {
                    missing.push(entry.group_id);
                }
                wanted.push(ExchangeItem::MessageEntry(SyncMessageEntry {
                    transaction_id: 0,
                    ..entry
                }));
            }
        }

        tracing::debug!(
            peer = %peer.id().short(),
            service = %self.inner.name,
            wanted = wanted.len(),
            "message list reconciled"
        );
        // Groups with nothing missing are settled now; the rest move
        // forward once their messages arrive.
        let mut batch = WriteBatch::new();
        for group in groups.into_iter().filter(|g| !missing.contains(g)) {
            batch.set_watermark(*peer.id(), Some(group), Timestamp::from_wire(tx.update_ts));
        }
        if !batch.is_empty() {
            store.commit(batch)?;
        }
        self.begin(manager, peer, TransactionKind::MessageListRequest, wanted, tx.update_ts)
    }

    fn apply_groups(&self, manager: &ConnectionManager, peer: &PeerConnection, tx: SyncTransaction) -> Result<()> {
        let store = &self.inner.store;
        let auth = self.auth();
        let mut accepted: Vec<GxsGroup> = Vec::new();
        let mut newly_subscribed = Vec::new();

        for item in tx.items {
            let ExchangeItem::Group(transfer) = item else { continue };
            let mut group = match transfer.group() {
                Ok(group) => group,
                Err(e) => {
                    tracing::warn!(peer = %peer.id().short(), service = %self.inner.name, error = %e, "undecodable group");
                    continue;
                }
            };

            let existing = store.group(&group.id)?;
            let was_subscribed = existing.as_ref().is_some_and(|g| g.subscribed);
            if let Some(local) = &existing {
                if group.published.as_secs() <= local.published.as_secs() {
                    continue;
                }
                group.subscribed = local.subscribed;
                group.last_posted = local.last_posted;
            }
            if let Err(e) = auth.check_group(&group) {
                tracing::warn!(
                    peer = %peer.id().short(),
                    service = %self.inner.name,
                    group = %group.id.short(),
                    error = %e,
                    "rejecting group"
                );
                continue;
            }
            if !self.inner.hooks.on_group_received(&mut group) {
                continue;
            }
            if group.subscribed && !was_subscribed {
                newly_subscribed.push(group.id);
            }
            accepted.retain(|g| g.id != group.id);
            accepted.push(group);
        }

        let mut batch = WriteBatch::new();
        batch.set_watermark(*peer.id(), None, Timestamp::from_wire(tx.update_ts));
        if !accepted.is_empty() {
            batch.set_last_update(Timestamp::now());
        }
        batch.groups = accepted.clone();
        store.commit(batch)?;

        if !accepted.is_empty() {
            tracing::info!(
                peer = %peer.id().short(),
                service = %self.inner.name,
                count = accepted.len(),
                "groups stored"
            );
            self.inner.hooks.on_groups_saved(&accepted);
        }
        for group in &newly_subscribed {
            self.request_messages(manager, peer, group)?;
        }
        Ok(())
    }

    fn apply_messages(&self, peer: &PeerConnection, tx: SyncTransaction) -> Result<()> {
        let store = &self.inner.store;
        let auth = self.auth();
        let hooks = &self.inner.hooks;
        let mut groups: HashMap<GroupId, Option<GxsGroup>> = HashMap::new();
        let mut accepted: Vec<(MessageClass, GxsMessage)> = Vec::new();

        for item in tx.items {
            let ExchangeItem::Message(transfer) = item else { continue };
            let mut message = match transfer.message() {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(peer = %peer.id().short(), service = %self.inner.name, error = %e, "undecodable message");
                    continue;
                }
            };

            if !groups.contains_key(&message.group_id) {
                groups.insert(message.group_id, store.group(&message.group_id)?);
            }
            let Some(Some(group)) = groups.get(&message.group_id) else {
                tracing::warn!(
                    peer = %peer.id().short(),
                    service = %self.inner.name,
                    group = %message.group_id.short(),
                    message = %message.id.short(),
                    "dropping message for unknown group"
                );
                continue;
            };

            if accepted.iter().any(|(_, m)| m.id == message.id) || store.has_message(&group.id, &message.id)? {
                continue;
            }
            if let Err(e) = auth.check_message(&message, group) {
                tracing::warn!(
                    peer = %peer.id().short(),
                    service = %self.inner.name,
                    message = %message.id.short(),
                    error = %e,
                    "rejecting message"
                );
                continue;
            }

            let class = hooks.message_class(message.content_type);
            let keep = match class {
                MessageClass::Message => hooks.on_message_received(&mut message),
                MessageClass::Comment => hooks.on_comment_received(&mut message),
                MessageClass::Vote => hooks.on_vote_received(&mut message),
            };
            if keep {
                accepted.push((class, message));
            }
        }

        let mut batch = WriteBatch::new();
        for (id, group) in &groups {
            if group.is_some() {
                batch.set_watermark(*peer.id(), Some(*id), Timestamp::from_wire(tx.update_ts));
            }
        }
        batch.messages = accepted.iter().map(|(_, m)| m.clone()).collect();
        store.commit(batch)?;

        if !accepted.is_empty() {
            tracing::info!(
                peer = %peer.id().short(),
                service = %self.inner.name,
                count = accepted.len(),
                "messages stored"
            );
            self.report_saved(accepted);
        }
        Ok(())
    }

    fn report_saved(&self, saved: Vec<(MessageClass, GxsMessage)>) {
        let hooks = &self.inner.hooks;
        let mut by_class: HashMap<MessageClass, Vec<GxsMessage>> = HashMap::new();
        for (class, message) in saved {
            by_class.entry(class).or_default().push(message);
        }
        for (class, messages) in by_class {
            match class {
                MessageClass::Message => hooks.on_messages_saved(&messages),
                MessageClass::Comment => hooks.on_comments_saved(&messages),
                MessageClass::Vote => hooks.on_votes_saved(&messages),
            }
        }
    }

    // ── Responder ─────────────────────────────────────────────────────────────

    fn on_group_request(&self, manager: &ConnectionManager, peer: &PeerConnection, request: &SyncGroupRequest) -> Result<()> {
        let store = &self.inner.store;
        let last_update = store.last_update()?.to_wire();
        if last_update <= request.last_updated {
            tracing::trace!(peer = %peer.id().short(), service = %self.inner.name, "group list unchanged");
            return Ok(());
        }

        let since = Timestamp::from_wire(request.create_since);
        let entries = self
            .inner
            .hooks
            .list_own_groups_since(store.as_ref(), since)?
            .iter()
            .map(|g| {
                ExchangeItem::GroupEntry(SyncGroupEntry {
                    group_id: g.id,
                    published: g.published.to_wire(),
                    author: g.author,
                    ..SyncGroupEntry::default()
                })
            })
            .collect();
        self.begin(manager, peer, TransactionKind::GroupListResponse, entries, last_update)
    }

    fn on_message_request(&self, manager: &ConnectionManager, peer: &PeerConnection, request: &SyncMessageRequest) -> Result<()> {
        let store = &self.inner.store;
        let Some(group) = store.group(&request.group_id)? else {
            return Ok(());
        };
        let last_posted = group.last_posted.to_wire();
        if !group.subscribed || last_posted <= request.last_updated {
            return Ok(());
        }

        let since = Timestamp::from_wire(request.create_since);
        let entries = self
            .inner
            .hooks
            .list_own_messages_since(store.as_ref(), &group.id, since)?
            .iter()
            .map(|m| {
                ExchangeItem::MessageEntry(SyncMessageEntry {
                    group_id: m.group_id,
                    message_id: m.id,
                    author: m.author,
                    ..SyncMessageEntry::default()
                })
            })
            .collect();
        self.begin(manager, peer, TransactionKind::MessageListResponse, entries, last_posted)
    }

    fn serve_groups(&self, manager: &ConnectionManager, peer: &PeerConnection, tx: SyncTransaction) -> Result<()> {
        let mut out = Vec::new();
        for item in &tx.items {
            if let Some(group) = self.inner.store.group(item.group_id())? {
                out.push(ExchangeItem::Group(TransferGroup::new(&group)));
            }
        }
        self.begin(manager, peer, TransactionKind::Groups, out, tx.update_ts)
    }

    fn serve_messages(&self, manager: &ConnectionManager, peer: &PeerConnection, tx: SyncTransaction) -> Result<()> {
        let mut out = Vec::new();
        for item in &tx.items {
            let ExchangeItem::MessageEntry(entry) = item else { continue };
            if let Some(message) = self.inner.store.message(&entry.group_id, &entry.message_id)? {
                out.push(ExchangeItem::Message(TransferMessage::new(&message)));
            }
        }
        self.begin(manager, peer, TransactionKind::Messages, out, tx.update_ts)
    }

    // ── Transactions ──────────────────────────────────────────────────────────

    fn on_control(&self, manager: &ConnectionManager, peer: &PeerConnection, control: &TransactionItem) {
        match self.inner.transactions.on_control(peer.id(), control) {
            ControlAction::Reply(reply) => self.send(manager, peer.id(), &reply),
            ControlAction::Send(items) => {
                for item in &items {
                    self.send(manager, peer.id(), item.as_item());
                }
            }
            ControlAction::Finished(tx) => {
                tracing::trace!(peer = %peer.id().short(), id = tx.id, kind = ?tx.kind, "transaction confirmed");
            }
            ControlAction::Aborted(tx) => {
                tracing::debug!(peer = %peer.id().short(), id = tx.id, kind = ?tx.kind, "transaction aborted");
            }
            ControlAction::Ignore => {}
        }
    }

    fn on_exchange(&self, manager: &ConnectionManager, peer: &PeerConnection, item: ExchangeItem) -> Result<()> {
        let tx = match self.inner.transactions.add_item(peer.id(), item) {
            Ok(Some(tx)) => tx,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(peer = %peer.id().short(), service = %self.inner.name, error = %e, "dropping exchange item");
                return Ok(());
            }
        };
        self.send(manager, peer.id(), &TransactionManager::acknowledge(&tx));

        match tx.kind {
            TransactionKind::GroupListResponse => self.reconcile_groups(manager, peer, tx),
            TransactionKind::MessageListResponse => self.reconcile_messages(manager, peer, tx),
            TransactionKind::GroupListRequest => self.serve_groups(manager, peer, tx),
            TransactionKind::MessageListRequest => self.serve_messages(manager, peer, tx),
            TransactionKind::Groups => self.apply_groups(manager, peer, tx),
            TransactionKind::Messages => self.apply_messages(peer, tx),
        }
    }

    // ── Local publishing ──────────────────────────────────────────────────────

    /// Sign, check and store a locally created group, subscribed. A group
    /// already stored must be republished with a later publish time.
    pub fn publish_group(
        &self,
        mut group: GxsGroup,
        signers: &[(SignatureKind, &dyn Signer)],
    ) -> Result<GxsGroup, PublishError> {
        let store = &self.inner.store;
        if let Some(local) = store.group(&group.id)? {
            if group.published.as_secs() <= local.published.as_secs() {
                return Err(PublishError::Stale(group.id));
            }
            group.last_posted = local.last_posted;
        }
        for (kind, signer) in signers {
            group.sign(*kind, *signer);
        }
        self.auth().check_group(&group)?;
        group.subscribed = true;

        let mut batch = WriteBatch::new();
        batch.put_group(group.clone()).set_last_update(Timestamp::now());
        store.commit(batch)?;
        tracing::info!(service = %self.inner.name, group = %group.id.short(), name = %group.name, "group published");
        self.inner.hooks.on_groups_saved(std::slice::from_ref(&group));
        Ok(group)
    }

    /// Seal, sign, check and store a locally created message.
    pub fn publish_message(
        &self,
        mut message: GxsMessage,
        signers: &[(SignatureKind, &dyn Signer)],
    ) -> Result<GxsMessage, PublishError> {
        let store = &self.inner.store;
        let group = store
            .group(&message.group_id)?
            .ok_or(PublishError::UnknownGroup(message.group_id))?;
        message.seal();
        for (kind, signer) in signers {
            message.sign(*kind, *signer);
        }
        self.auth().check_message(&message, &group)?;

        let mut batch = WriteBatch::new();
        batch.put_message(message.clone());
        store.commit(batch)?;
        tracing::debug!(service = %self.inner.name, message = %message.id.short(), "message published");
        self.report_saved(vec![(self.inner.hooks.message_class(message.content_type), message.clone())]);
        Ok(message)
    }

    /// Change the subscription to a stored group. Returns `false` if the
    /// group is unknown.
    pub fn set_subscribed(&self, group: &GroupId, subscribed: bool) -> Result<bool, StoreError> {
        let Some(mut stored) = self.inner.store.group(group)? else {
            return Ok(false);
        };
        if stored.subscribed != subscribed {
            stored.subscribed = subscribed;
            let mut batch = WriteBatch::new();
            batch.put_group(stored).set_last_update(Timestamp::now());
            self.inner.store.commit(batch)?;
        }
        Ok(true)
    }
}

impl<H: GxsHooks> Service for GxsService<H> {
    fn service_type(&self) -> ServiceType {
        self.inner.service_type
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn item_factory(&self) -> &ItemFactory {
        &self.inner.factory
    }

    fn on_activate(&self, manager: &ConnectionManager, peer: &Arc<PeerConnection>) {
        let (min, max) = self.inner.config.initial_delay;
        let initial = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        tracing::debug!(
            peer = %peer.id().short(),
            service = %self.inner.name,
            initial_ms = initial.as_millis() as u64,
            "sync scheduled"
        );

        let service = self.clone();
        let manager = manager.clone();
        let id = *peer.id();
        peer.schedule_at_fixed_rate(initial, self.inner.config.period, move || {
            if let Some(peer) = manager.peer(&id) {
                service.sync_with(&manager, &peer);
            }
        });
    }

    fn on_deactivate(&self, peer: &PeerId) {
        self.inner.transactions.abort_peer(peer);
    }

    fn handle_item(&self, manager: &ConnectionManager, peer: &Arc<PeerConnection>, item: Box<dyn Item>) -> Result<()> {
        if let Some(request) = item.downcast_ref::<SyncGroupRequest>() {
            return self.on_group_request(manager, peer, request);
        }
        if let Some(request) = item.downcast_ref::<SyncMessageRequest>() {
            return self.on_message_request(manager, peer, request);
        }
        if let Some(control) = item.downcast_ref::<TransactionItem>() {
            self.on_control(manager, peer, control);
            return Ok(());
        }
        match ExchangeItem::from_item(item.as_ref()) {
            Some(exchange) => self.on_exchange(manager, peer, exchange),
            None => {
                tracing::debug!(
                    peer = %peer.id().short(),
                    service = %self.inner.name,
                    sub_type = item.sub_type(),
                    "unexpected item"
                );
                Ok(())
            }
        }
    }
}
