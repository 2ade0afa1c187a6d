//! GXS data model: groups, messages, their keys and signatures, and the
//! per-scope authentication policy a service declares.
//!
//! Groups and messages use the meta+data layout: the service payload is
//! written first as its own blob, the metadata (ids, timestamps, keys,
//! signatures) follows as a second blob. In signature mode the metadata
//! omits the signature set so the signed bytes never include themselves.

use std::ops::BitOr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{self, Item, ItemBody, MetaAndData, SerializationMode};
use crate::crypto::Signer;
use crate::ids::{GroupId, IdentityId, MessageId, Timestamp};
use crate::serial::{Reader, WireField};
use crate::wire::WireError;
use crate::{declared_fields, wire_enum};

// ── Scope and policy ─────────────────────────────────────────────────────────

/// Who a group is distributed to. Governs which signatures are required.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DistributionScope {
    #[default]
    Public,
    Restricted,
    Private,
}

wire_enum!(DistributionScope {
    Public = 1,
    Restricted = 2,
    Private = 3,
});

/// A set of signature requirements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Requirements(u8);

impl Requirements {
    pub const NONE: Requirements = Requirements(0);
    /// Top-level messages carry an author signature. A group is checked
    /// against its author only when it declares one.
    pub const ROOT_AUTHOR: Requirements = Requirements(0x01);
    /// Top-level messages (and the group itself) carry a publish signature.
    pub const ROOT_PUBLISH: Requirements = Requirements(0x02);
    /// Replies carry an author signature.
    pub const CHILD_AUTHOR: Requirements = Requirements(0x04);
    /// Replies carry a publish signature.
    pub const CHILD_PUBLISH: Requirements = Requirements(0x08);

    pub fn contains(&self, other: Requirements) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Requirements {
    type Output = Requirements;

    fn bitor(self, rhs: Requirements) -> Requirements {
        Requirements(self.0 | rhs.0)
    }
}

/// Per-scope signature policy of one service. Immutable once built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthenticationRequirements {
    public: Requirements,
    restricted: Requirements,
    private: Requirements,
    optional_author: bool,
}

impl AuthenticationRequirements {
    pub fn builder() -> AuthenticationRequirementsBuilder {
        AuthenticationRequirementsBuilder::default()
    }

    pub fn for_scope(&self, scope: DistributionScope) -> Requirements {
        match scope {
            DistributionScope::Public => self.public,
            DistributionScope::Restricted => self.restricted,
            DistributionScope::Private => self.private,
        }
    }

    /// When set, author signatures are checked only if an author is declared.
    pub fn optional_author(&self) -> bool {
        self.optional_author
    }
}

#[derive(Debug, Default)]
pub struct AuthenticationRequirementsBuilder {
    inner: AuthenticationRequirements,
}

impl AuthenticationRequirementsBuilder {
    pub fn public(mut self, r: Requirements) -> Self {
        self.inner.public = r;
        self
    }

    pub fn restricted(mut self, r: Requirements) -> Self {
        self.inner.restricted = r;
        self
    }

    pub fn private(mut self, r: Requirements) -> Self {
        self.inner.private = r;
        self
    }

    pub fn optional_author(mut self) -> Self {
        self.inner.optional_author = true;
        self
    }

    pub fn build(self) -> AuthenticationRequirements {
        self.inner
    }
}

// ── Keys and signatures ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    Admin,
    Publish,
}

wire_enum!(KeyRole {
    Admin = 0x40,
    Publish = 0x20,
});

/// A public key attached to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityKey {
    pub key_id: IdentityId,
    pub role: KeyRole,
    pub valid_from: u32,
    /// 0 means no expiry.
    pub valid_to: u32,
    pub public_key: [u8; 32],
}

declared_fields!(SecurityKey {
    key_id,
    role,
    valid_from,
    valid_to,
    public_key,
});

impl SecurityKey {
    pub fn new(role: KeyRole, public_key: [u8; 32], valid_from: u32) -> Self {
        Self {
            key_id: IdentityId::from_public_key(&public_key),
            role,
            valid_from,
            valid_to: 0,
            public_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    Author,
    Publish,
    Admin,
}

wire_enum!(SignatureKind {
    Author = 0x10,
    Publish = 0x20,
    Admin = 0x40,
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub kind: SignatureKind,
    pub key_id: IdentityId,
    pub bytes: Bytes,
}

declared_fields!(Signature { kind, key_id, bytes });

fn find_signature(signatures: &[Signature], kind: SignatureKind) -> Option<&Signature> {
    signatures.iter().find(|s| s.kind == kind)
}

fn put_signature(signatures: &mut Vec<Signature>, kind: SignatureKind, signer: &dyn Signer, data: &[u8]) {
    signatures.retain(|s| s.kind != kind);
    signatures.push(Signature {
        kind,
        key_id: IdentityId::from_public_key(&signer.public_key()),
        bytes: Bytes::copy_from_slice(&signer.sign(data)),
    });
}

// ── Group ────────────────────────────────────────────────────────────────────

/// Item sub-type used when a group travels as a stand-alone item.
pub const GROUP_ITEM_SUB_TYPE: u8 = 0x02;

/// Item sub-type used when a message travels as a stand-alone item.
pub const MESSAGE_ITEM_SUB_TYPE: u8 = 0x03;

/// A signed, replicated container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GxsGroup {
    pub id: GroupId,
    pub name: String,
    pub scope: DistributionScope,
    pub published: Timestamp,
    pub author: Option<IdentityId>,
    pub keys: Vec<SecurityKey>,
    pub signatures: Vec<Signature>,
    /// Service payload, opaque to the sync engine.
    pub data: Bytes,

    // Local state, never sent.
    pub subscribed: bool,
    pub last_posted: Timestamp,
}

impl GxsGroup {
    /// A new group whose id is derived from its admin key. Call
    /// [`GxsGroup::sign`] once all fields are final.
    pub fn new(name: impl Into<String>, scope: DistributionScope, admin_key: [u8; 32], data: Bytes) -> Self {
        let published = Timestamp::now().truncated();
        Self {
            id: GroupId::from_admin_key(&admin_key),
            name: name.into(),
            scope,
            published,
            author: None,
            keys: vec![SecurityKey::new(KeyRole::Admin, admin_key, published.to_wire())],
            signatures: Vec::new(),
            data,
            subscribed: false,
            last_posted: Timestamp::EPOCH,
        }
    }

    pub fn key(&self, role: KeyRole) -> Option<&SecurityKey> {
        self.keys.iter().find(|k| k.role == role)
    }

    pub fn signature(&self, kind: SignatureKind) -> Option<&Signature> {
        find_signature(&self.signatures, kind)
    }

    /// Bytes covered by every signature on this group.
    pub fn signable_bytes(&self) -> Bytes {
        codec::signable_parts(self)
    }

    /// Add or replace the signature of `kind`.
    pub fn sign(&mut self, kind: SignatureKind, signer: &dyn Signer) {
        let signable = self.signable_bytes();
        put_signature(&mut self.signatures, kind, signer, &signable);
    }
}

impl MetaAndData for GxsGroup {
    fn write_data(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn write_meta(&self, buf: &mut BytesMut, mode: SerializationMode) {
        self.id.write(buf);
        self.name.write(buf);
        self.scope.write(buf);
        self.published.to_wire().write(buf);
        self.author.write(buf);
        self.keys.write(buf);
        if mode != SerializationMode::Signature {
            self.signatures.write(buf);
        }
    }

    fn from_parts(data: Bytes, meta: &mut Reader<'_>) -> Result<Self, WireError> {
        let id = GroupId::read(meta)?;
        if id.is_null() {
            return Err(WireError::InvalidField("group id"));
        }
        Ok(Self {
            id,
            name: String::read(meta)?,
            scope: DistributionScope::read(meta)?,
            published: Timestamp::from_wire(u32::read(meta)?),
            author: Option::<IdentityId>::read(meta)?,
            keys: Vec::read(meta)?,
            signatures: Vec::read(meta)?,
            data,
            subscribed: false,
            last_posted: Timestamp::EPOCH,
        })
    }
}

impl Item for GxsGroup {
    fn sub_type(&self) -> u8 {
        GROUP_ITEM_SUB_TYPE
    }

    fn body(&self) -> ItemBody<'_> {
        ItemBody::MetaAndData(self)
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// An entry of a group. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GxsMessage {
    pub group_id: GroupId,
    pub id: MessageId,
    /// The message this one replies to. `None` for a top-level message.
    pub parent_id: Option<MessageId>,
    /// The first version of an edited message.
    pub origin_id: Option<MessageId>,
    pub published: Timestamp,
    pub author: Option<IdentityId>,
    /// Service-defined classification of `data` (post, comment, vote...).
    pub content_type: u8,
    pub signatures: Vec<Signature>,
    pub data: Bytes,

    // Local state, never sent.
    pub read: bool,
}

impl GxsMessage {
    /// A new message. The id is computed by [`GxsMessage::seal`].
    pub fn new(group_id: GroupId, content_type: u8, data: Bytes) -> Self {
        Self {
            group_id,
            id: MessageId::default(),
            parent_id: None,
            origin_id: None,
            published: Timestamp::now().truncated(),
            author: None,
            content_type,
            signatures: Vec::new(),
            data,
            read: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn signature(&self, kind: SignatureKind) -> Option<&Signature> {
        find_signature(&self.signatures, kind)
    }

    /// Bytes covered by the message id and every signature. The id itself
    /// is not part of them.
    pub fn signable_bytes(&self) -> Bytes {
        codec::signable_parts(self)
    }

    /// The id this message must carry given its content.
    pub fn derived_id(&self) -> MessageId {
        MessageId::from_signable(&self.signable_bytes())
    }

    /// Fix the content-derived id. Call once every field is final and
    /// before signing.
    pub fn seal(&mut self) {
        self.id = self.derived_id();
    }

    pub fn sign(&mut self, kind: SignatureKind, signer: &dyn Signer) {
        let signable = self.signable_bytes();
        put_signature(&mut self.signatures, kind, signer, &signable);
    }
}

impl MetaAndData for GxsMessage {
    fn write_data(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn write_meta(&self, buf: &mut BytesMut, mode: SerializationMode) {
        self.group_id.write(buf);
        if mode != SerializationMode::Signature {
            self.id.write(buf);
        }
        self.parent_id.write(buf);
        self.origin_id.write(buf);
        self.published.to_wire().write(buf);
        self.author.write(buf);
        self.content_type.write(buf);
        if mode != SerializationMode::Signature {
            self.signatures.write(buf);
        }
    }

    fn from_parts(data: Bytes, meta: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            group_id: GroupId::read(meta)?,
            id: MessageId::read(meta)?,
            parent_id: Option::<MessageId>::read(meta)?,
            origin_id: Option::<MessageId>::read(meta)?,
            published: Timestamp::from_wire(u32::read(meta)?),
            author: Option::<IdentityId>::read(meta)?,
            content_type: u8::read(meta)?,
            signatures: Vec::read(meta)?,
            data,
            read: false,
        })
    }
}

impl Item for GxsMessage {
    fn sub_type(&self) -> u8 {
        MESSAGE_ITEM_SUB_TYPE
    }

    fn body(&self) -> ItemBody<'_> {
        ItemBody::MetaAndData(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
