//! kindred-core: wire format, item codec, GXS data model and crypto.
//! All other Kindred crates depend on this one.

pub mod serial;

pub mod codec;
pub mod config;
pub mod crypto;
pub mod gxs;
pub mod ids;
pub mod wire;

pub use codec::{Item, ItemBody, ItemFactory, ItemWriter, SerializationMode};
pub use ids::{GroupId, IdentityId, MessageId, PeerId, Timestamp};
pub use wire::{ItemPriority, RawItem, ServiceType, WireError};
