//! Sync transactions: numbered, all-or-nothing batches of exchange items.
//!
//! Handshake, sender on the left:
//!
//! ```text
//!   BEGIN_INCOMING(id, count, update_ts)  ──►
//!                                         ◄──  BEGIN_OUTGOING(id)
//!   item 1 .. item count                  ──►
//!                                         ◄──  END_SUCCESS(id)
//! ```
//!
//! Ids are allocated by the sender from its per-peer counter, so incoming
//! and outgoing transactions are tracked separately per peer. A partial
//! transaction is never handed out: either every declared item arrived or
//! the whole thing is discarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kindred_core::{PeerId, ServiceType};
use thiserror::Error;

use super::items::{flags, ExchangeItem, TransactionItem};
use crate::peer::PeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    GroupListResponse,
    MessageListResponse,
    GroupListRequest,
    MessageListRequest,
    Groups,
    Messages,
}

impl TransactionKind {
    pub fn flag(self) -> u16 {
        match self {
            Self::GroupListResponse => flags::GROUP_LIST_RESPONSE,
            Self::MessageListResponse => flags::MESSAGE_LIST_RESPONSE,
            Self::GroupListRequest => flags::GROUP_LIST_REQUEST,
            Self::MessageListRequest => flags::MESSAGE_LIST_REQUEST,
            Self::Groups => flags::GROUPS,
            Self::Messages => flags::MESSAGES,
        }
    }

    pub fn from_flags(kind_flags: u16) -> Option<Self> {
        match kind_flags {
            flags::GROUP_LIST_RESPONSE => Some(Self::GroupListResponse),
            flags::MESSAGE_LIST_RESPONSE => Some(Self::MessageListResponse),
            flags::GROUP_LIST_REQUEST => Some(Self::GroupListRequest),
            flags::MESSAGE_LIST_REQUEST => Some(Self::MessageListRequest),
            flags::GROUPS => Some(Self::Groups),
            flags::MESSAGES => Some(Self::Messages),
            _ => None,
        }
    }

    /// Whether `item` may travel in a transaction of this kind.
    pub fn accepts(self, item: &ExchangeItem) -> bool {
        matches!(
            (self, item),
            (Self::GroupListResponse | Self::GroupListRequest, ExchangeItem::GroupEntry(_))
                | (Self::MessageListResponse | Self::MessageListRequest, ExchangeItem::MessageEntry(_))
                | (Self::Groups, ExchangeItem::Group(_))
                | (Self::Messages, ExchangeItem::Message(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Complete,
    Aborted,
}

/// One transaction with one peer.
#[derive(Debug, PartialEq)]
pub struct SyncTransaction {
    pub peer: PeerId,
    pub id: u32,
    pub direction: Direction,
    pub kind: TransactionKind,
    pub expected: u32,
    /// Received items in arrival order, or items still to send.
    pub items: Vec<ExchangeItem>,
    /// The sender's update time, wire seconds.
    pub update_ts: u32,
    pub state: TransactionState,
    started: Instant,
}

impl SyncTransaction {
    pub(crate) fn new(peer: PeerId, id: u32, direction: Direction, kind: TransactionKind, expected: u32, update_ts: u32) -> Self {
        Self {
            peer,
            id,
            direction,
            kind,
            expected,
            items: Vec::new(),
            update_ts,
            state: TransactionState::Open,
            started: Instant::now(),
        }
    }

    fn control(&self, step: u16) -> TransactionItem {
        TransactionItem {
            transaction_id: self.id,
            flags: step | self.kind.flag(),
            item_count: self.expected,
            update_ts: self.update_ts,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("refusing to start an empty transaction")]
    Empty,

    #[error("no open transaction {id} from {peer}")]
    Unknown { peer: PeerId, id: u32 },

    #[error("transaction {id} of kind {kind:?} cannot carry this item")]
    WrongItem { id: u32, kind: TransactionKind },
}

/// What the caller must do after a control item.
#[derive(Debug)]
pub enum ControlAction {
    /// Write this control item back to the peer.
    Reply(TransactionItem),
    /// The peer is ready: write these items.
    Send(Vec<ExchangeItem>),
    /// The peer confirmed an outgoing transaction.
    Finished(SyncTransaction),
    /// A transaction was cancelled or failed.
    Aborted(SyncTransaction),
    Ignore,
}

pub struct TransactionManager {
    service: ServiceType,
    timeout: Duration,
    incoming: DashMap<PeerId, HashMap<u32, SyncTransaction>>,
    outgoing: DashMap<PeerId, HashMap<u32, SyncTransaction>>,
}

impl TransactionManager {
    pub fn new(service: ServiceType, timeout: Duration) -> Self {
        Self {
            service,
            timeout,
            incoming: DashMap::new(),
            outgoing: DashMap::new(),
        }
    }

    /// Open an outgoing transaction. Returns the BEGIN_INCOMING item to
    /// send; the items follow once the peer answers.
    pub fn begin_outgoing(
        &self,
        peer: &PeerConnection,
        kind: TransactionKind,
        mut items: Vec<ExchangeItem>,
        update_ts: u32,
    ) -> Result<TransactionItem, TransactionError> {
        if items.is_empty() {
            return Err(TransactionError::Empty);
        }
        let id = peer.slots().next_transaction_id(self.service);
        for item in &mut items {
            item.set_transaction_id(id);
        }
        let mut tx = SyncTransaction::new(*peer.id(), id, Direction::Outgoing, kind, items.len() as u32, update_ts);
        tx.items = items;
        let begin = tx.control(flags::BEGIN_INCOMING);

        tracing::debug!(peer = %peer.id().short(), id, ?kind, count = tx.expected, "transaction started");
        self.outgoing.entry(*peer.id()).or_default().insert(id, tx);
        Ok(begin)
    }

    pub fn on_control(&self, peer: &PeerId, control: &TransactionItem) -> ControlAction {
        let id = control.transaction_id;
        match control.step() {
            flags::BEGIN_INCOMING => {
                let Some(kind) = TransactionKind::from_flags(control.kind_flags()) else {
                    tracing::warn!(peer = %peer.short(), id, flags = control.flags, "unknown transaction kind");
                    return ControlAction::Ignore;
                };
                if control.item_count == 0 {
                    tracing::debug!(peer = %peer.short(), id, "refusing empty transaction");
                    return ControlAction::Ignore;
                }
                let mut open = self.incoming.entry(*peer).or_default();
                if open.contains_key(&id) {
                    return ControlAction::Ignore;
                }
                let tx = SyncTransaction::new(*peer, id, Direction::Incoming, kind, control.item_count, control.update_ts);
                let reply = tx.control(flags::BEGIN_OUTGOING);
                open.insert(id, tx);
                ControlAction::Reply(reply)
            }
            flags::BEGIN_OUTGOING => {
                let Some(mut open) = self.outgoing.get_mut(peer) else {
                    return ControlAction::Ignore;
                };
                match open.get_mut(&id) {
                    Some(tx) if !tx.items.is_empty() => ControlAction::Send(std::mem::take(&mut tx.items)),
                    _ => ControlAction::Ignore,
                }
            }
            flags::END_SUCCESS => match remove(&self.outgoing, peer, id) {
                Some(mut tx) => {
                    tx.state = TransactionState::Complete;
                    ControlAction::Finished(tx)
                }
                None => ControlAction::Ignore,
            },
            flags::CANCEL | flags::END_FAIL_NUM | flags::END_FAIL_TIMEOUT => {
                match remove(&self.incoming, peer, id).or_else(|| remove(&self.outgoing, peer, id)) {
                    Some(mut tx) => {
                        tx.state = TransactionState::Aborted;
                        tracing::debug!(peer = %peer.short(), id, flags = control.flags, "transaction aborted by peer");
                        ControlAction::Aborted(tx)
                    }
                    None => ControlAction::Ignore,
                }
            }
            _ => ControlAction::Ignore,
        }
    }

    /// Add a received item to its transaction. Returns the transaction once
    /// every declared item has arrived. An item of the wrong kind discards
    /// the whole transaction.
    pub fn add_item(&self, peer: &PeerId, item: ExchangeItem) -> Result<Option<SyncTransaction>, TransactionError> {
        let id = item.transaction_id();
        let unknown = || TransactionError::Unknown { peer: *peer, id };
        let mut open = self.incoming.get_mut(peer).ok_or_else(unknown)?;
        let tx = open.get_mut(&id).ok_or_else(unknown)?;

        if !tx.kind.accepts(&item) {
            let kind = tx.kind;
            open.remove(&id);
            return Err(TransactionError::WrongItem { id, kind });
        }
        tx.items.push(item);
        if (tx.items.len() as u32) < tx.expected {
            return Ok(None);
        }
        let mut done = open.remove(&id).ok_or_else(unknown)?;
        done.state = TransactionState::Complete;
        Ok(Some(done))
    }

    /// The END_SUCCESS item acknowledging a completed incoming transaction.
    pub fn acknowledge(tx: &SyncTransaction) -> TransactionItem {
        tx.control(flags::END_SUCCESS)
    }

    /// Discard every transaction with `peer`. Returns how many were open.
    pub fn abort_peer(&self, peer: &PeerId) -> usize {
        let incoming = self.incoming.remove(peer).map(|(_, m)| m.len()).unwrap_or(0);
        let outgoing = self.outgoing.remove(peer).map(|(_, m)| m.len()).unwrap_or(0);
        if incoming + outgoing > 0 {
            tracing::debug!(peer = %peer.short(), incoming, outgoing, "transactions aborted");
        }
        incoming + outgoing
    }

    /// Drop transactions older than the timeout. Returns what was dropped.
    pub fn expire(&self) -> Vec<(PeerId, u32, Direction)> {
        let mut expired = Vec::new();
        for map in [&self.incoming, &self.outgoing] {
            for mut entry in map.iter_mut() {
                entry.value_mut().retain(|_, tx| {
                    let alive = tx.started.elapsed() < self.timeout;
                    if !alive {
                        expired.push((tx.peer, tx.id, tx.direction));
                    }
                    alive
                });
            }
            map.retain(|_, open| !open.is_empty());
        }
        for (peer, id, direction) in &expired {
            tracing::info!(peer = %peer.short(), id, ?direction, "transaction timed out");
        }
        expired
    }

    pub fn open_incoming(&self, peer: &PeerId) -> usize {
        self.incoming.get(peer).map(|m| m.len()).unwrap_or(0)
    }

    pub fn open_outgoing(&self, peer: &PeerId) -> usize {
        self.outgoing.get(peer).map(|m| m.len()).unwrap_or(0)
    }
}

fn remove(map: &DashMap<PeerId, HashMap<u32, SyncTransaction>>, peer: &PeerId, id: u32) -> Option<SyncTransaction> {
    let mut open = map.get_mut(peer)?;
    open.remove(&id)
}
