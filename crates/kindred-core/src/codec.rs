//! Item codec: typed items to framed bytes and back.
//!
//! An item picks one of three payload strategies through [`Item::body`]:
//!
//!   1. meta+data: groups and messages. The service payload is written
//!      first as a TLV blob, the metadata follows as a second TLV blob.
//!   2. self-describing: the item writes and reads its own payload.
//!   3. declared fields: the item lists its fields with
//!      [`declared_fields!`](crate::declared_fields) and the codec walks them.
//!
//! The writer emits the header with a zero size, writes the payload, then
//! patches `total_size`. The decoder rejects any item whose payload is not
//! consumed exactly.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::AsBytes;

use crate::serial::{read_tlv_binary, write_tlv_with, Reader, WireField};
use crate::wire::{ItemHeader, ItemPriority, RawItem, ServiceType, WireError, HEADER_SIZE};

// ── Strategies ───────────────────────────────────────────────────────────────

/// What a serialization pass is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializationMode {
    /// Header and payload, for the network.
    #[default]
    Normal,
    /// Payload only, without signatures, for signing and verifying.
    Signature,
    /// Only the resulting length matters.
    SizeOnly,
}

/// Strategy 1: signed payload plus a metadata wrapper.
pub trait MetaAndData {
    fn write_data(&self, buf: &mut BytesMut);
    fn write_meta(&self, buf: &mut BytesMut, mode: SerializationMode);
    fn from_parts(data: Bytes, meta: &mut Reader<'_>) -> Result<Self, WireError>
    where
        Self: Sized;
}

/// Strategy 2: the item owns its layout.
pub trait SelfDescribing {
    fn write_to(&self, buf: &mut BytesMut, mode: SerializationMode);
    fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError>
    where
        Self: Sized;
}

/// Strategy 3: an ordered list of typed fields. Implemented for every
/// [`WireField`], which is what `declared_fields!` produces.
pub trait DeclaredFields {
    fn write_fields(&self, buf: &mut BytesMut);
}

impl<T: WireField> DeclaredFields for T {
    fn write_fields(&self, buf: &mut BytesMut) {
        self.write(buf);
    }
}

pub enum ItemBody<'a> {
    MetaAndData(&'a dyn MetaAndData),
    SelfDescribing(&'a dyn SelfDescribing),
    Declared(&'a dyn DeclaredFields),
}

// ── Item ─────────────────────────────────────────────────────────────────────

#[doc(hidden)]
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed message belonging to a service.
///
/// The service type is not part of the item: GXS exchange items are shared
/// by every GXS service, so the owning service supplies it when writing.
pub trait Item: AsAny + Send + Sync + fmt::Debug {
    fn sub_type(&self) -> u8;

    fn priority(&self) -> ItemPriority {
        ItemPriority::Default
    }

    fn body(&self) -> ItemBody<'_>;
}

impl dyn Item + '_ {
    pub fn downcast_ref<T: Item + 'static>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    pub fn is<T: Item + 'static>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

fn write_payload(
    buf: &mut BytesMut,
    service_type: ServiceType,
    item: &dyn Item,
    mode: SerializationMode,
) {
    match item.body() {
        ItemBody::MetaAndData(i) if mode == SerializationMode::Signature => {
            i.write_data(buf);
            i.write_meta(buf, mode);
        }
        ItemBody::MetaAndData(i) => {
            write_tlv_with(buf, service_type, |b| i.write_data(b));
            write_tlv_with(buf, service_type, |b| i.write_meta(b, mode));
        }
        ItemBody::SelfDescribing(i) => i.write_to(buf, mode),
        ItemBody::Declared(i) => i.write_fields(buf),
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Serializes items into a reusable working buffer.
///
/// Frames can be batched with [`ItemWriter::append`] and taken together with
/// [`ItemWriter::flush`]. Size and signature passes set the working buffer
/// aside and restore it afterwards, so they never disturb a batch in
/// progress.
#[derive(Debug, Default)]
pub struct ItemWriter {
    buf: BytesMut,
    saved: Option<BytesMut>,
    mode: SerializationMode,
}

impl ItemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> SerializationMode {
        self.mode
    }

    /// Bytes appended but not flushed yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append one framed item to the working buffer, returning its size.
    pub fn append(&mut self, service_type: ServiceType, item: &dyn Item) -> Result<usize, WireError> {
        let start = self.buf.len();
        self.buf
            .put_slice(ItemHeader::new(service_type, item.sub_type(), 0).as_bytes());
        write_payload(&mut self.buf, service_type, item, self.mode);

        let total = self.buf.len() - start;
        if total > crate::wire::MAX_ITEM_SIZE {
            self.buf.truncate(start);
            return Err(WireError::FrameTooLarge(total));
        }
        self.buf[start + 4..start + HEADER_SIZE].copy_from_slice(&(total as u32).to_be_bytes());
        Ok(total)
    }

    /// Take every frame appended so far.
    pub fn flush(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Serialize one item as a stand-alone frame. Pending frames stay put.
    pub fn write(&mut self, service_type: ServiceType, item: &dyn Item) -> Result<RawItem, WireError> {
        let start = self.buf.len();
        self.append(service_type, item)?;
        let frame = self.buf.split_off(start).freeze();
        Ok(RawItem::from_written(
            service_type,
            item.sub_type(),
            item.priority(),
            frame,
        ))
    }

    /// Size of the frame `item` would produce, without producing it.
    pub fn size_of(&mut self, service_type: ServiceType, item: &dyn Item) -> Result<usize, WireError> {
        self.enter(SerializationMode::SizeOnly);
        let result = self.append(service_type, item);
        self.leave();
        result
    }

    /// Payload bytes a signature over `item` must cover.
    pub fn signable_bytes(&mut self, service_type: ServiceType, item: &dyn Item) -> Bytes {
        self.enter(SerializationMode::Signature);
        write_payload(&mut self.buf, service_type, item, SerializationMode::Signature);
        let out = self.buf.split().freeze();
        self.leave();
        out
    }

    fn enter(&mut self, mode: SerializationMode) {
        self.saved = Some(std::mem::take(&mut self.buf));
        self.mode = mode;
    }

    fn leave(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.buf = saved;
        }
        self.mode = SerializationMode::Normal;
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Builds a typed item from a payload.
pub type DecodeFn = fn(&mut Reader<'_>, ServiceType) -> Result<Box<dyn Item>, WireError>;

/// Sub-type to decoder table of one service. Built once, then read-only.
#[derive(Clone, Default)]
pub struct ItemFactory {
    decoders: HashMap<u8, DecodeFn>,
}

impl fmt::Debug for ItemFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sub_types: Vec<_> = self.decoders.keys().copied().collect();
        sub_types.sort_unstable();
        f.debug_struct("ItemFactory").field("sub_types", &sub_types).finish()
    }
}

impl ItemFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declared<T: Item + WireField + 'static>(mut self, sub_type: u8) -> Self {
        self.decoders.insert(sub_type, decode_declared::<T>);
        self
    }

    pub fn self_describing<T: Item + SelfDescribing + 'static>(mut self, sub_type: u8) -> Self {
        self.decoders.insert(sub_type, decode_self_describing::<T>);
        self
    }

    pub fn meta_and_data<T: Item + MetaAndData + 'static>(mut self, sub_type: u8) -> Self {
        self.decoders.insert(sub_type, decode_meta_and_data::<T>);
        self
    }

    pub fn knows(&self, sub_type: u8) -> bool {
        self.decoders.contains_key(&sub_type)
    }

    /// Decode a framed item. Every payload byte must be consumed.
    pub fn decode(&self, raw: &RawItem) -> Result<Box<dyn Item>, WireError> {
        let decode = self.decoders.get(&raw.sub_type).ok_or(WireError::NoSuchItem {
            service_type: raw.service_type,
            sub_type: raw.sub_type,
        })?;
        let payload = raw.payload();
        let mut r = Reader::new(&payload);
        let item = decode(&mut r, raw.service_type)?;
        if !r.is_empty() {
            return Err(WireError::SizeMismatch {
                declared: raw.declared_size(),
                consumed: HEADER_SIZE + r.consumed(),
            });
        }
        Ok(item)
    }
}

fn decode_declared<T: Item + WireField + 'static>(
    r: &mut Reader<'_>,
    _service_type: ServiceType,
) -> Result<Box<dyn Item>, WireError> {
    Ok(Box::new(T::read(r)?))
}

fn decode_self_describing<T: Item + SelfDescribing + 'static>(
    r: &mut Reader<'_>,
    _service_type: ServiceType,
) -> Result<Box<dyn Item>, WireError> {
    Ok(Box::new(T::read_from(r)?))
}

fn decode_meta_and_data<T: Item + MetaAndData + 'static>(
    r: &mut Reader<'_>,
    service_type: ServiceType,
) -> Result<Box<dyn Item>, WireError> {
    let data = read_tlv_binary(r, service_type)?;
    let meta = read_tlv_binary(r, service_type)?;
    let item: T = join_parts(Bytes::copy_from_slice(data), meta)?;
    Ok(Box::new(item))
}

// ── Parts ────────────────────────────────────────────────────────────────────

/// The data and metadata blobs of a meta+data item, as transfer items
/// carry them.
pub fn split_parts(item: &dyn MetaAndData) -> (Bytes, Bytes) {
    let mut data = BytesMut::new();
    item.write_data(&mut data);
    let mut meta = BytesMut::new();
    item.write_meta(&mut meta, SerializationMode::Normal);
    (data.freeze(), meta.freeze())
}

/// Data followed by the signature-less metadata, with no TLV framing.
pub fn signable_parts(item: &dyn MetaAndData) -> Bytes {
    let mut buf = BytesMut::new();
    item.write_data(&mut buf);
    item.write_meta(&mut buf, SerializationMode::Signature);
    buf.freeze()
}

/// Rebuild a meta+data item. The metadata blob must be consumed exactly.
pub fn join_parts<T: MetaAndData>(data: Bytes, meta: &[u8]) -> Result<T, WireError> {
    let mut r = Reader::new(meta);
    let item = T::from_parts(data, &mut r)?;
    if !r.is_empty() {
        return Err(WireError::SizeMismatch {
            declared: meta.len(),
            consumed: r.consumed(),
        });
    }
    Ok(item)
}

// ── Tests ────────────────────────────────────────────────────────────────────
