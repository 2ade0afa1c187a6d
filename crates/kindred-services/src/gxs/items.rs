//! GXS exchange items, shared by every GXS service.
//!
//! Requests and list entries use declared fields. Transfer items carry a
//! group or message as its two meta+data blobs and lay themselves out.

use bytes::{Bytes, BytesMut};
use kindred_core::codec::{self, Item, ItemBody, ItemFactory, SelfDescribing, SerializationMode};
use kindred_core::declared_fields;
use kindred_core::gxs::{GxsGroup, GxsMessage};
use kindred_core::serial::{read_tlv_binary, write_tlv_binary, Reader, WireField};
use kindred_core::{GroupId, IdentityId, ItemPriority, MessageId, WireError};

pub mod sub_types {
    pub const SYNC_GROUP_REQUEST: u8 = 0x01;
    pub const SYNC_GROUP_ENTRY: u8 = 0x02;
    pub const TRANSFER_GROUP: u8 = 0x04;
    pub const SYNC_MESSAGE_ENTRY: u8 = 0x08;
    pub const SYNC_MESSAGE_REQUEST: u8 = 0x10;
    pub const TRANSFER_MESSAGE: u8 = 0x20;
    pub const TRANSACTION: u8 = 0x40;
}

/// TLV type of the data and metadata blobs inside transfer items.
pub const TLV_TYPE_BIN_GXS_PART: u16 = 0x0030;

/// Decoders for the full exchange set.
pub fn exchange_factory() -> ItemFactory {
    ItemFactory::new()
        .declared::<SyncGroupRequest>(sub_types::SYNC_GROUP_REQUEST)
        .declared::<SyncGroupEntry>(sub_types::SYNC_GROUP_ENTRY)
        .self_describing::<TransferGroup>(sub_types::TRANSFER_GROUP)
        .declared::<SyncMessageEntry>(sub_types::SYNC_MESSAGE_ENTRY)
        .declared::<SyncMessageRequest>(sub_types::SYNC_MESSAGE_REQUEST)
        .self_describing::<TransferMessage>(sub_types::TRANSFER_MESSAGE)
        .declared::<TransactionItem>(sub_types::TRANSACTION)
}

macro_rules! exchange_item {
    ($ty:ident, $sub_type:expr, $priority:expr, $body:ident) => {
        impl Item for $ty {
            fn sub_type(&self) -> u8 {
                $sub_type
            }
            fn priority(&self) -> ItemPriority {
                $priority
            }
            fn body(&self) -> ItemBody<'_> {
                ItemBody::$body(self)
            }
        }
    };
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// "Send me your group list if it changed after `last_updated`."
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncGroupRequest {
    pub flags: u8,
    /// Only groups published after this, wire seconds. 0 = all.
    pub create_since: u32,
    pub sync_hash: String,
    /// The responder's update time we last synced to, wire seconds.
    pub last_updated: u32,
}

declared_fields!(SyncGroupRequest {
    flags,
    create_since,
    sync_hash,
    last_updated,
});
exchange_item!(SyncGroupRequest, sub_types::SYNC_GROUP_REQUEST, ItemPriority::Background, Declared);

/// "Send me ids of messages in `group_id` if it has new posts."
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMessageRequest {
    pub transaction_id: u32,
    pub flags: u8,
    pub create_since: u32,
    pub sync_hash: String,
    pub last_updated: u32,
    pub group_id: GroupId,
}

declared_fields!(SyncMessageRequest {
    transaction_id,
    flags,
    create_since,
    sync_hash,
    last_updated,
    group_id,
});
exchange_item!(SyncMessageRequest, sub_types::SYNC_MESSAGE_REQUEST, ItemPriority::Background, Declared);

// ── List entries ─────────────────────────────────────────────────────────────

/// One advertised (or requested) group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncGroupEntry {
    pub transaction_id: u32,
    pub flags: u8,
    pub group_id: GroupId,
    /// Publish time, wire seconds.
    pub published: u32,
    pub author: Option<IdentityId>,
}

declared_fields!(SyncGroupEntry {
    transaction_id,
    flags,
    group_id,
    published,
    author,
});
exchange_item!(SyncGroupEntry, sub_types::SYNC_GROUP_ENTRY, ItemPriority::Default, Declared);

/// One advertised (or requested) message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMessageEntry {
    pub transaction_id: u32,
    pub flags: u8,
    pub group_id: GroupId,
    pub message_id: MessageId,
    pub author: Option<IdentityId>,
}

declared_fields!(SyncMessageEntry {
    transaction_id,
    flags,
    group_id,
    message_id,
    author,
});
exchange_item!(SyncMessageEntry, sub_types::SYNC_MESSAGE_ENTRY, ItemPriority::Default, Declared);

// ── Transfers ────────────────────────────────────────────────────────────────

/// A full group in transit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferGroup {
    pub transaction_id: u32,
    pub position: u8,
    pub group_id: GroupId,
    pub data: Bytes,
    pub meta: Bytes,
}

impl TransferGroup {
    pub fn new(group: &GxsGroup) -> Self {
        let (data, meta) = codec::split_parts(group);
        Self {
            transaction_id: 0,
            position: 0,
            group_id: group.id,
            data,
            meta,
        }
    }

    /// Rebuild the group. Its id must match the one this item announced.
    pub fn group(&self) -> Result<GxsGroup, WireError> {
        let group: GxsGroup = codec::join_parts(self.data.clone(), &self.meta)?;
        if group.id != self.group_id {
            return Err(WireError::InvalidField("group id"));
        }
        Ok(group)
    }
}

impl SelfDescribing for TransferGroup {
    fn write_to(&self, buf: &mut BytesMut, _mode: SerializationMode) {
        self.transaction_id.write(buf);
        self.position.write(buf);
        self.group_id.write(buf);
        write_tlv_binary(buf, TLV_TYPE_BIN_GXS_PART, &self.data);
        write_tlv_binary(buf, TLV_TYPE_BIN_GXS_PART, &self.meta);
    }

    fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            transaction_id: u32::read(r)?,
            position: u8::read(r)?,
            group_id: GroupId::read(r)?,
            data: Bytes::copy_from_slice(read_tlv_binary(r, TLV_TYPE_BIN_GXS_PART)?),
            meta: Bytes::copy_from_slice(read_tlv_binary(r, TLV_TYPE_BIN_GXS_PART)?),
        })
    }
}
exchange_item!(TransferGroup, sub_types::TRANSFER_GROUP, ItemPriority::Bulk, SelfDescribing);

/// A full message in transit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferMessage {
    pub transaction_id: u32,
    pub position: u8,
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub data: Bytes,
    pub meta: Bytes,
}

impl TransferMessage {
    pub fn new(message: &GxsMessage) -> Self {
        let (data, meta) = codec::split_parts(message);
        Self {
            transaction_id: 0,
            position: 0,
            message_id: message.id,
            group_id: message.group_id,
            data,
            meta,
        }
    }

    pub fn message(&self) -> Result<GxsMessage, WireError> {
        let message: GxsMessage = codec::join_parts(self.data.clone(), &self.meta)?;
        if message.id != self.message_id || message.group_id != self.group_id {
            return Err(WireError::InvalidField("message id"));
        }
        Ok(message)
    }
}

impl SelfDescribing for TransferMessage {
    fn write_to(&self, buf: &mut BytesMut, _mode: SerializationMode) {
        self.transaction_id.write(buf);
        self.position.write(buf);
        self.message_id.write(buf);
        self.group_id.write(buf);
        write_tlv_binary(buf, TLV_TYPE_BIN_GXS_PART, &self.data);
        write_tlv_binary(buf, TLV_TYPE_BIN_GXS_PART, &self.meta);
    }

    fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            transaction_id: u32::read(r)?,
            position: u8::read(r)?,
            message_id: MessageId::read(r)?,
            group_id: GroupId::read(r)?,
            data: Bytes::copy_from_slice(read_tlv_binary(r, TLV_TYPE_BIN_GXS_PART)?),
            meta: Bytes::copy_from_slice(read_tlv_binary(r, TLV_TYPE_BIN_GXS_PART)?),
        })
    }
}
exchange_item!(TransferMessage, sub_types::TRANSFER_MESSAGE, ItemPriority::Bulk, SelfDescribing);

// ── Transaction control ──────────────────────────────────────────────────────

/// Transaction control flags. The low byte is the step, the high byte the
/// kind of content.
pub mod flags {
    pub const BEGIN_INCOMING: u16 = 0x0001;
    pub const BEGIN_OUTGOING: u16 = 0x0002;
    pub const END_SUCCESS: u16 = 0x0004;
    pub const CANCEL: u16 = 0x0008;
    pub const END_FAIL_NUM: u16 = 0x0010;
    pub const END_FAIL_TIMEOUT: u16 = 0x0020;

    pub const GROUP_LIST_RESPONSE: u16 = 0x0100;
    pub const MESSAGE_LIST_RESPONSE: u16 = 0x0200;
    pub const GROUP_LIST_REQUEST: u16 = 0x0400;
    pub const MESSAGE_LIST_REQUEST: u16 = 0x0800;
    pub const GROUPS: u16 = 0x1000;
    pub const MESSAGES: u16 = 0x2000;

    pub const STEP_MASK: u16 = 0x00ff;
    pub const KIND_MASK: u16 = 0xff00;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionItem {
    pub transaction_id: u32,
    pub flags: u16,
    pub item_count: u32,
    /// The sender's update time for the content, wire seconds.
    pub update_ts: u32,
}

declared_fields!(TransactionItem {
    transaction_id,
    flags,
    item_count,
    update_ts,
});
exchange_item!(TransactionItem, sub_types::TRANSACTION, ItemPriority::Default, Declared);

impl TransactionItem {
    pub fn step(&self) -> u16 {
        self.flags & flags::STEP_MASK
    }

    pub fn kind_flags(&self) -> u16 {
        self.flags & flags::KIND_MASK
    }
}

// ── Transaction payload ──────────────────────────────────────────────────────

/// An item that travels inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeItem {
    GroupEntry(SyncGroupEntry),
    Group(TransferGroup),
    MessageEntry(SyncMessageEntry),
    Message(TransferMessage),
}

impl ExchangeItem {
    /// Copy a received item out of its box. `None` for items that never
    /// travel inside a transaction.
    pub fn from_item(item: &dyn Item) -> Option<Self> {
        if let Some(i) = item.downcast_ref::<SyncGroupEntry>() {
            return Some(Self::GroupEntry(i.clone()));
        }
        if let Some(i) = item.downcast_ref::<TransferGroup>() {
            return Some(Self::Group(i.clone()));
        }
        if let Some(i) = item.downcast_ref::<SyncMessageEntry>() {
            return Some(Self::MessageEntry(i.clone()));
        }
        item.downcast_ref::<TransferMessage>()
            .map(|i| Self::Message(i.clone()))
    }

    pub fn transaction_id(&self) -> u32 {
        match self {
            Self::GroupEntry(i) => i.transaction_id,
            Self::Group(i) => i.transaction_id,
            Self::MessageEntry(i) => i.transaction_id,
            Self::Message(i) => i.transaction_id,
        }
    }

    pub fn set_transaction_id(&mut self, id: u32) {
        match self {
            Self::GroupEntry(i) => i.transaction_id = id,
            Self::Group(i) => i.transaction_id = id,
            Self::MessageEntry(i) => i.transaction_id = id,
            Self::Message(i) => i.transaction_id = id,
        }
    }

    pub fn group_id(&self) -> &GroupId {
        match self {
            Self::GroupEntry(i) => &i.group_id,
            Self::Group(i) => &i.group_id,
            Self::MessageEntry(i) => &i.group_id,
            Self::Message(i) => &i.group_id,
        }
    }

    pub fn as_item(&self) -> &dyn Item {
        match self {
            Self::GroupEntry(i) => i,
            Self::Group(i) => i,
            Self::MessageEntry(i) => i,
            Self::Message(i) => i,
        }
    }
}
