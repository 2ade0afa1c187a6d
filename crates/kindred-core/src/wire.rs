//! Kindred wire format: the item header and frame delimiting.
//!
//! Every item exchanged between two friends starts with the same 8-byte
//! header. All integers are big-endian. The header layout is part of the
//! protocol and is shared with every peer we talk to, so nothing in
//! `ItemHeader` may change without breaking compatibility.
//!
//! The header uses zerocopy's big-endian integer wrappers so it can be
//! read and written without any manual byte shuffling.

use bytes::{Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Item Header ──────────────────────────────────────────────────────────────

/// Header that precedes every item on the wire.
///
/// ```text
/// offset 0: u8  version        (= 2)
/// offset 1: u16 service_type
/// offset 3: u8  sub_type
/// offset 4: u32 total_size      (header + payload)
/// ```
///
/// `total_size` is written as a placeholder first and patched once the
/// payload length is known. It is the only thing a reader uses to find the
/// end of a frame.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ItemHeader {
    pub version: u8,
    pub service_type: U16<BigEndian>,
    pub sub_type: u8,
    pub total_size: U32<BigEndian>,
}

assert_eq_size!(ItemHeader, [u8; HEADER_SIZE]);

impl ItemHeader {
    pub fn new(service_type: ServiceType, sub_type: u8, total_size: u32) -> Self {
        Self {
            version: ITEM_VERSION,
            service_type: U16::new(service_type),
            sub_type,
            total_size: U32::new(total_size),
        }
    }

    /// Parse a header from the start of `bytes`. Does not look past it.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        })?;
        if header.version != ITEM_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let size = header.total_size();
        if size < HEADER_SIZE {
            return Err(WireError::FrameTooSmall(size));
        }
        if size > MAX_ITEM_SIZE {
            return Err(WireError::FrameTooLarge(size));
        }
        Ok(header)
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type.get()
    }

    pub fn total_size(&self) -> usize {
        self.total_size.get() as usize
    }
}

// ── Service Types ────────────────────────────────────────────────────────────

/// Numeric identifier of a pluggable service.
pub type ServiceType = u16;

/// Well-known service type numbers.
pub mod service_types {
    use super::ServiceType;

    pub const SERVICE_INFO: ServiceType = 0x0020;
    pub const GXS_ID: ServiceType = 0x0211;
    pub const FORUMS: ServiceType = 0x0215;
    pub const CHANNELS: ServiceType = 0x0217;
    pub const GXS_CIRCLES: ServiceType = 0x0218;

    /// Human readable name for logging. Unknown types print as "unknown".
    pub fn name(service_type: ServiceType) -> &'static str {
        match service_type {
            SERVICE_INFO => "service_info",
            GXS_ID => "gxs_id",
            FORUMS => "forums",
            CHANNELS => "channels",
            GXS_CIRCLES => "gxs_circles",
            _ => "unknown",
        }
    }
}

// ── Priority ─────────────────────────────────────────────────────────────────

/// Scheduling class of an item. Never written on the wire; the sender uses
/// it to pace outbound frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ItemPriority {
    /// Replication and housekeeping. Sent only when nothing else is waiting.
    Background = 0x02,

    /// Large transfers. Throughput matters more than latency.
    Bulk = 0x03,

    /// Control traffic and everything that does not say otherwise.
    #[default]
    Default = 0x05,
}

impl TryFrom<u8> for ItemPriority {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(ItemPriority::Background),
            0x03 => Ok(ItemPriority::Bulk),
            0x05 => Ok(ItemPriority::Default),
            other => Err(WireError::UnknownPriority(other)),
        }
    }
}

impl From<ItemPriority> for u8 {
    fn from(p: ItemPriority) -> u8 {
        p as u8
    }
}

// ── Raw Item ─────────────────────────────────────────────────────────────────

/// A complete framed item whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub service_type: ServiceType,
    pub sub_type: u8,
    pub priority: ItemPriority,
    frame: Bytes,
}

impl RawItem {
    /// Wrap an inbound frame. The frame must be exactly `total_size` long.
    pub fn parse(frame: Bytes) -> Result<Self, WireError> {
        let header = ItemHeader::parse(&frame)?;
        let declared = header.total_size();
        if frame.len() < declared {
            return Err(WireError::Truncated {
                needed: declared,
                available: frame.len(),
            });
        }
        if frame.len() > declared {
            return Err(WireError::SizeMismatch {
                declared,
                consumed: frame.len(),
            });
        }
        Ok(Self {
            service_type: header.service_type(),
            sub_type: header.sub_type,
            priority: ItemPriority::Default,
            frame,
        })
    }

    /// Wrap a frame freshly produced by the item writer.
    pub(crate) fn from_written(
        service_type: ServiceType,
        sub_type: u8,
        priority: ItemPriority,
        frame: Bytes,
    ) -> Self {
        Self {
            service_type,
            sub_type,
            priority,
            frame,
        }
    }

    /// Header and payload, exactly as they travel.
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    pub fn into_frame(self) -> Bytes {
        self.frame
    }

    pub fn declared_size(&self) -> usize {
        self.frame.len()
    }

    pub fn payload(&self) -> Bytes {
        self.frame.slice(HEADER_SIZE..)
    }
}

// ── Frame Decoder ────────────────────────────────────────────────────────────

/// Cuts complete frames out of a byte stream.
///
/// Bytes are appended as they arrive from the transport; `next_frame`
/// returns one frame at a time once the whole of it is buffered. The
/// decoder never looks inside the payload.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// A header error leaves the stream unusable: the decoder can no longer
    /// tell where the next frame starts, so the caller should drop the
    /// connection.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = ItemHeader::parse(&self.buf[..HEADER_SIZE])?;
        let size = header.total_size();
        if self.buf.len() < size {
            self.buf.reserve(size - self.buf.len());
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(size).freeze()))
    }

    /// Discard everything buffered so far.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Current item format version.
pub const ITEM_VERSION: u8 = 0x02;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest frame we accept, header included.
pub const MAX_ITEM_SIZE: usize = 262_144;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Frame errors. The item that produced one is discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown item version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown priority byte: 0x{0:02x}")]
    UnknownPriority(u8),

    #[error("truncated buffer: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("size mismatch: declared {declared} bytes, consumed {consumed}")]
    SizeMismatch { declared: usize, consumed: usize },

    #[error("frame of {0} bytes is smaller than the header")]
    FrameTooSmall(usize),

    #[error("frame of {0} bytes exceeds maximum {}", MAX_ITEM_SIZE)]
    FrameTooLarge(usize),

    #[error("no such item: service 0x{service_type:04x} sub-type 0x{sub_type:02x}")]
    NoSuchItem { service_type: ServiceType, sub_type: u8 },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("unknown ordinal {value} for {field}")]
    UnknownOrdinal { field: &'static str, value: u32 },

    #[error("unexpected tlv type: expected 0x{expected:04x}, found 0x{found:04x}")]
    TlvType { expected: u16, found: u16 },

    #[error("invalid tlv length {0}")]
    TlvLength(usize),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

// ── Tests ────────────────────────────────────────────────────────────────────
