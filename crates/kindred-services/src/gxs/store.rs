//! Group and message storage for one GXS service.
//!
//! Reads are single calls. Writes go through a [`WriteBatch`] committed in
//! one step, so a sync step either lands completely or not at all. No
//! handle is ever held across a network round-trip.
//!
//! Sync watermarks are kept per `(peer, group)`, with `None` standing for
//! the peer's group list. They hold the peer's own update time from the
//! last transaction we applied.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use kindred_core::codec;
use kindred_core::gxs::{GxsGroup, GxsMessage};
use kindred_core::{GroupId, MessageId, PeerId, Timestamp, WireError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {message} refers to unknown group {group}")]
    UnknownGroup { group: GroupId, message: MessageId },

    #[error("store io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store record: {0}")]
    Record(#[from] WireError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The persistence collaborator.
pub trait GxsStore: Send + Sync {
    fn group(&self, id: &GroupId) -> Result<Option<GxsGroup>>;

    fn groups(&self) -> Result<Vec<GxsGroup>>;

    fn message(&self, group: &GroupId, id: &MessageId) -> Result<Option<GxsMessage>>;

    fn has_message(&self, group: &GroupId, id: &MessageId) -> Result<bool> {
        Ok(self.message(group, id)?.is_some())
    }

    /// Messages of `group` published strictly after `since`.
    fn messages_since(&self, group: &GroupId, since: Timestamp) -> Result<Vec<GxsMessage>>;

    /// Last update time applied from `peer` for `group`, or for its group
    /// list when `group` is `None`. [`Timestamp::EPOCH`] if never synced.
    fn watermark(&self, peer: &PeerId, group: Option<&GroupId>) -> Result<Timestamp>;

    /// When this service's group set last changed.
    fn last_update(&self) -> Result<Timestamp>;

    /// Apply every write in `batch`, or none of them.
    fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Writes applied together by [`GxsStore::commit`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub groups: Vec<GxsGroup>,
    pub messages: Vec<GxsMessage>,
    pub watermarks: Vec<(PeerId, Option<GroupId>, Timestamp)>,
    pub last_update: Option<Timestamp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_group(&mut self, group: GxsGroup) -> &mut Self {
        self.groups.push(group);
        self
    }

    pub fn put_message(&mut self, message: GxsMessage) -> &mut Self {
        self.messages.push(message);
        self
    }

    pub fn set_watermark(&mut self, peer: PeerId, group: Option<GroupId>, at: Timestamp) -> &mut Self {
        self.watermarks.push((peer, group, at));
        self
    }

    pub fn set_last_update(&mut self, at: Timestamp) -> &mut Self {
        self.last_update = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.messages.is_empty() && self.watermarks.is_empty() && self.last_update.is_none()
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    groups: HashMap<GroupId, GxsGroup>,
    messages: HashMap<GroupId, BTreeMap<MessageId, GxsMessage>>,
    watermarks: HashMap<(PeerId, Option<GroupId>), Timestamp>,
    last_update: Timestamp,
}

impl State {
    fn apply(&mut self, batch: WriteBatch) {
        let now = Timestamp::now();
        for group in batch.groups {
            self.groups.insert(group.id, group);
        }
        for message in batch.messages {
            let stored = self.messages.entry(message.group_id).or_default();
            if stored.contains_key(&message.id) {
                continue;
            }
            if let Some(group) = self.groups.get_mut(&message.group_id) {
                group.last_posted = group.last_posted.max(now);
            }
            stored.insert(message.id, message);
        }
        for (peer, group, at) in batch.watermarks {
            let mark = self.watermarks.entry((peer, group)).or_default();
            *mark = (*mark).max(at);
        }
        if let Some(at) = batch.last_update {
            self.last_update = self.last_update.max(at);
        }
    }
}

/// In-memory store, optionally snapshotted to a JSON file after every
/// commit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store persisted at `path`, loading the snapshot already there.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let snapshot: Snapshot = serde_json::from_str(&text)?;
                let state = snapshot.restore()?;
                tracing::info!(
                    groups = state.groups.len(),
                    path = %path.display(),
                    "loaded gxs store"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn save(path: &Path, state: &State) -> Result<()> {
        let json = serde_json::to_string(&Snapshot::capture(state))?;
        let io = |source: std::io::Error| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(io)?;
        std::fs::rename(&tmp, path).map_err(io)
    }
}

impl GxsStore for MemoryStore {
    fn group(&self, id: &GroupId) -> Result<Option<GxsGroup>> {
        Ok(self.read(|s| s.groups.get(id).cloned()))
    }

    fn groups(&self) -> Result<Vec<GxsGroup>> {
        Ok(self.read(|s| s.groups.values().cloned().collect()))
    }

    fn message(&self, group: &GroupId, id: &MessageId) -> Result<Option<GxsMessage>> {
        Ok(self.read(|s| s.messages.get(group).and_then(|m| m.get(id)).cloned()))
    }

    fn messages_since(&self, group: &GroupId, since: Timestamp) -> Result<Vec<GxsMessage>> {
        Ok(self.read(|s| {
            s.messages
                .get(group)
                .map(|m| m.values().filter(|msg| msg.published > since).cloned().collect())
                .unwrap_or_default()
        }))
    }

    fn watermark(&self, peer: &PeerId, group: Option<&GroupId>) -> Result<Timestamp> {
        Ok(self.read(|s| s.watermarks.get(&(*peer, group.copied())).copied().unwrap_or_default()))
    }

    fn last_update(&self) -> Result<Timestamp> {
        Ok(self.read(|s| s.last_update))
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        for message in &batch.messages {
            let known = state.groups.contains_key(&message.group_id)
                || batch.groups.iter().any(|g| g.id == message.group_id);
            if !known {
                return Err(StoreError::UnknownGroup {
                    group: message.group_id,
                    message: message.id,
                });
            }
        }

        match &self.path {
            None => state.apply(batch),
            Some(path) => {
                let mut next = state.clone();
                next.apply(batch);
                Self::save(path, &next)?;
                *state = next;
            }
        }
        Ok(())
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Record {
    data: String,
    meta: String,
    #[serde(default)]
    flag: bool,
    #[serde(default)]
    last_posted: Timestamp,
}

impl Record {
    fn capture(item: &dyn codec::MetaAndData, flag: bool, last_posted: Timestamp) -> Self {
        let (data, meta) = codec::split_parts(item);
        Self {
            data: hex::encode(data),
            meta: hex::encode(meta),
            flag,
            last_posted,
        }
    }

    fn restore<T: codec::MetaAndData>(&self) -> Result<T> {
        let data = hex::decode(&self.data).map_err(|_| WireError::InvalidField("record data"))?;
        let meta = hex::decode(&self.meta).map_err(|_| WireError::InvalidField("record meta"))?;
        Ok(codec::join_parts(data.into(), &meta)?)
    }
}

#[derive(Serialize, Deserialize)]
struct Watermark {
    peer: PeerId,
    group: Option<GroupId>,
    at: Timestamp,
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    groups: Vec<Record>,
    messages: Vec<Record>,
    watermarks: Vec<Watermark>,
    last_update: Timestamp,
}

impl Snapshot {
    fn capture(state: &State) -> Self {
        Self {
            groups: state
                .groups
                .values()
                .map(|g| Record::capture(g, g.subscribed, g.last_posted))
                .collect(),
            messages: state
                .messages
                .values()
                .flat_map(|m| m.values())
                .map(|m| Record::capture(m, m.read, Timestamp::EPOCH))
                .collect(),
            watermarks: state
                .watermarks
                .iter()
                .map(|(&(peer, group), &at)| Watermark { peer, group, at })
                .collect(),
            last_update: state.last_update,
        }
    }

    fn restore(self) -> Result<State> {
        let mut state = State {
            last_update: self.last_update,
            ..State::default()
        };
        for record in &self.groups {
            let mut group: GxsGroup = record.restore()?;
            group.subscribed = record.flag;
            group.last_posted = record.last_posted;
            state.groups.insert(group.id, group);
        }
        for record in &self.messages {
            let mut message: GxsMessage = record.restore()?;
            message.read = record.flag;
            state.messages.entry(message.group_id).or_default().insert(message.id, message);
        }
        for mark in self.watermarks {
            state.watermarks.insert((mark.peer, mark.group), mark.at);
        }
        Ok(state)
    }
}
