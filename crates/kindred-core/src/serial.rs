//! Primitive field encoders shared by every item.
//!
//! Integers are big-endian. Strings and byte arrays carry a u32 length
//! prefix, lists and sets a u32 element count. Enumerations travel as a u32
//! ordinal. Identifiers are fixed-size and written raw, all-zero meaning
//! "none".
//!
//! Declared-field items list their fields once with [`declared_fields!`];
//! the macro expands into an encoder and a decoder that walk the fields in
//! declaration order, so the wire layout is fixed at compile time.

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::WireError;

// ── Reader ───────────────────────────────────────────────────────────────────

/// Bounds-checked cursor over a payload. Never panics on short input.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Read a u32 length prefix and check it against what is left.
    fn length(&mut self) -> Result<usize, WireError> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(WireError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        Ok(len)
    }
}

// ── Field trait ──────────────────────────────────────────────────────────────

/// A value with a fixed wire encoding.
pub trait WireField: Sized {
    fn write(&self, buf: &mut BytesMut);
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError>;
}

impl WireField for u8 {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.u8()
    }
}

impl WireField for u16 {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(*self);
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.u16()
    }
}

impl WireField for u32 {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(*self);
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.u32()
    }
}

impl WireField for u64 {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.u64()
    }
}

impl WireField for bool {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        match r.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidField("bool")),
        }
    }
}

impl WireField for String {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let len = r.length()?;
        let raw = r.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

/// Length-prefixed byte array.
impl WireField for Bytes {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let len = r.length()?;
        Ok(Bytes::copy_from_slice(r.take(len)?))
    }
}

/// Fixed-size raw bytes, no prefix.
impl<const N: usize> WireField for [u8; N] {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.array()
    }
}

impl<T: WireField> WireField for Vec<T> {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for element in self {
            element.write(buf);
        }
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = r.u32()? as usize;
        // Every element takes at least one byte.
        let mut out = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            out.push(T::read(r)?);
        }
        Ok(out)
    }
}

impl<T: WireField + Ord> WireField for BTreeSet<T> {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for element in self {
            element.write(buf);
        }
    }
    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = r.u32()? as usize;
        let mut out = BTreeSet::new();
        for _ in 0..count {
            out.insert(T::read(r)?);
        }
        Ok(out)
    }
}

// ── TLV ──────────────────────────────────────────────────────────────────────

/// u16 type + u32 total length (header included).
pub const TLV_HEADER_SIZE: usize = 6;

/// String carrying a SHA-1 style sync hash.
pub const TLV_TYPE_STR_HASH_SHA1: u16 = 0x0070;

/// Write a TLV whose body is produced by `body`. The length is patched
/// after the body is written.
pub fn write_tlv_with(buf: &mut BytesMut, tlv_type: u16, body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u16(tlv_type);
    buf.put_u32(0);
    body(buf);
    let total = (buf.len() - start) as u32;
    buf[start + 2..start + TLV_HEADER_SIZE].copy_from_slice(&total.to_be_bytes());
}

/// Binary TLV. Item payload blobs use the owning service type as `tlv_type`.
pub fn write_tlv_binary(buf: &mut BytesMut, tlv_type: u16, data: &[u8]) {
    write_tlv_with(buf, tlv_type, |b| b.put_slice(data));
}

pub fn read_tlv_binary<'a>(r: &mut Reader<'a>, tlv_type: u16) -> Result<&'a [u8], WireError> {
    let found = r.u16()?;
    if found != tlv_type {
        return Err(WireError::TlvType {
            expected: tlv_type,
            found,
        });
    }
    let total = r.u32()? as usize;
    if total < TLV_HEADER_SIZE {
        return Err(WireError::TlvLength(total));
    }
    r.take(total - TLV_HEADER_SIZE)
}

pub fn write_tlv_string(buf: &mut BytesMut, tlv_type: u16, value: &str) {
    write_tlv_binary(buf, tlv_type, value.as_bytes());
}

pub fn read_tlv_string(r: &mut Reader<'_>, tlv_type: u16) -> Result<String, WireError> {
    let raw = read_tlv_binary(r, tlv_type)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

// ── Macros ───────────────────────────────────────────────────────────────────

/// Declare the wire fields of a struct, in order.
///
/// ```
/// use kindred_core::declared_fields;
///
/// #[derive(Debug, PartialEq)]
/// struct Ping {
///     seq: u32,
///     note: String,
/// }
/// declared_fields!(Ping { seq, note });
/// ```
#[macro_export]
macro_rules! declared_fields {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::serial::WireField for $ty {
            fn write(&self, buf: &mut ::bytes::BytesMut) {
                $( $crate::serial::WireField::write(&self.$field, buf); )*
            }
            fn read(
                r: &mut $crate::serial::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::wire::WireError> {
                Ok(Self {
                    $( $field: $crate::serial::WireField::read(r)?, )*
                })
            }
        }
    };
}

/// Encode a fieldless enum as its u32 ordinal.
#[macro_export]
macro_rules! wire_enum {
    ($ty:ident { $($variant:ident = $ordinal:expr),+ $(,)? }) => {
        impl $crate::serial::WireField for $ty {
            fn write(&self, buf: &mut ::bytes::BytesMut) {
                let ordinal: u32 = match self {
                    $( $ty::$variant => $ordinal, )+
                };
                ::bytes::BufMut::put_u32(buf, ordinal);
            }
            fn read(
                r: &mut $crate::serial::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::wire::WireError> {
                match r.u32()? {
                    $( v if v == $ordinal => Ok($ty::$variant), )+
                    value => Err($crate::wire::WireError::UnknownOrdinal {
                        field: stringify!($ty),
                        value,
                    }),
                }
            }
        }
    };
}

/// Fixed-length identifier newtype. Printed as hex, written raw on the
/// wire, all-zero reads back as `None` when wrapped in `Option`.
macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn is_null(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                ::hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = ::hex::decode(s).ok()?;
                <[u8; $len]>::try_from(bytes.as_slice()).ok().map(Self)
            }

            /// First four bytes as hex, for log lines.
            pub fn short(&self) -> String {
                ::hex::encode(&self.0[..4])
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl $crate::serial::WireField for $name {
            fn write(&self, buf: &mut ::bytes::BytesMut) {
                ::bytes::BufMut::put_slice(buf, &self.0);
            }
            fn read(
                r: &mut $crate::serial::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::wire::WireError> {
                Ok(Self(r.array()?))
            }
        }

        impl $crate::serial::WireField for Option<$name> {
            fn write(&self, buf: &mut ::bytes::BytesMut) {
                match self {
                    Some(id) => $crate::serial::WireField::write(id, buf),
                    None => ::bytes::BufMut::put_bytes(buf, 0, $len),
                }
            }
            fn read(
                r: &mut $crate::serial::Reader<'_>,
            ) -> ::std::result::Result<Self, $crate::wire::WireError> {
                let id = <$name as $crate::serial::WireField>::read(r)?;
                Ok(if id.is_null() { None } else { Some(id) })
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::std::result::Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                Self::from_hex(&s).ok_or_else(|| {
                    <D::Error as ::serde::de::Error>::custom(concat!(
                        "invalid hex for ",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

pub(crate) use identifier;

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        flags: u8,
        count: u16,
        stamp: u32,
        name: String,
        blob: Bytes,
        tags: Vec<String>,
        done: bool,
    }
    crate::declared_fields!(Sample { flags, count, stamp, name, blob, tags, done });

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Colour {
        Red,
        Green,
    }
    crate::wire_enum!(Colour { Red = 1, Green = 2 });

    identifier!(TestId, 4);

    fn encode<T: WireField>(value: &T) -> BytesMut {
        let mut buf = BytesMut::new();
        value.write(&mut buf);
        buf
    }

    #[test]
    fn declared_fields_follow_declaration_order() {
        let sample = Sample {
            flags: 0x7f,
            count: 0x0102,
            stamp: 9,
            name: "ab".into(),
            blob: Bytes::from_static(&[0xee]),
            tags: vec!["x".into()],
            done: true,
        };
        let buf = encode(&sample);
        assert_eq!(
            &buf[..],
            &[
                0x7f, // flags
                0x01, 0x02, // count
                0, 0, 0, 9, // stamp
                0, 0, 0, 2, b'a', b'b', // name
                0, 0, 0, 1, 0xee, // blob
                0, 0, 0, 1, 0, 0, 0, 1, b'x', // tags
                1, // done
            ]
        );
        let mut r = Reader::new(&buf);
        assert_eq!(Sample::read(&mut r).unwrap(), sample);
        assert!(r.is_empty());
    }

    #[test]
    fn short_input_is_truncated_not_panic() {
        let mut r = Reader::new(&[0, 0, 0, 10, b'a']);
        assert!(matches!(
            String::read(&mut r),
            Err(WireError::Truncated { needed: 10, .. })
        ));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut r = Reader::new(&[2]);
        assert_eq!(bool::read(&mut r), Err(WireError::InvalidField("bool")));
    }

    #[test]
    fn enum_uses_ordinal() {
        assert_eq!(&encode(&Colour::Green)[..], &[0, 0, 0, 2]);
        let mut r = Reader::new(&[0, 0, 0, 7]);
        assert_eq!(
            Colour::read(&mut r),
            Err(WireError::UnknownOrdinal {
                field: "Colour",
                value: 7
            })
        );
    }

    #[test]
    fn null_identifier_reads_as_none() {
        let none: Option<TestId> = None;
        let buf = encode(&none);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let mut r = Reader::new(&buf);
        assert_eq!(Option::<TestId>::read(&mut r).unwrap(), None);

        let some = Some(TestId([1, 2, 3, 4]));
        let buf = encode(&some);
        let mut r = Reader::new(&buf);
        assert_eq!(Option::<TestId>::read(&mut r).unwrap(), some);
        assert_eq!(TestId::from_hex("01020304"), Some(TestId([1, 2, 3, 4])));
    }

    #[test]
    fn tlv_length_is_patched() {
        let mut buf = BytesMut::new();
        write_tlv_string(&mut buf, TLV_TYPE_STR_HASH_SHA1, "abc");
        assert_eq!(&buf[..6], &[0x00, 0x70, 0, 0, 0, 9]);
        let mut r = Reader::new(&buf);
        assert_eq!(read_tlv_string(&mut r, TLV_TYPE_STR_HASH_SHA1).unwrap(), "abc");
    }

    #[test]
    fn tlv_type_mismatch_is_reported() {
        let mut buf = BytesMut::new();
        write_tlv_binary(&mut buf, 0x0215, b"x");
        let mut r = Reader::new(&buf);
        assert_eq!(
            read_tlv_binary(&mut r, 0x0217).unwrap_err(),
            WireError::TlvType {
                expected: 0x0217,
                found: 0x0215
            }
        );
    }
}
