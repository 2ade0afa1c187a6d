//! Signature checks gating every received or published group and message.
//!
//! What a group or message must carry depends on the group's distribution
//! scope and the service's [`AuthenticationRequirements`]. Anything that
//! fails is rejected and never stored.

use kindred_core::crypto::Verifier;
use kindred_core::gxs::{
    AuthenticationRequirements, GxsGroup, GxsMessage, KeyRole, Requirements, Signature, SignatureKind,
};
use kindred_core::{GroupId, IdentityId, MessageId};
use thiserror::Error;

use crate::identity::IdentityRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("group has no {0:?} key")]
    MissingKey(KeyRole),

    #[error("group id {0} does not match its admin key")]
    GroupIdMismatch(GroupId),

    #[error("message id {0} does not match its content")]
    MessageIdMismatch(MessageId),

    #[error("message belongs to group {found}, checked against {expected}")]
    WrongGroup { expected: GroupId, found: GroupId },

    #[error("missing {0:?} signature")]
    MissingSignature(SignatureKind),

    #[error("invalid {0:?} signature")]
    InvalidSignature(SignatureKind),

    #[error("no author declared")]
    MissingAuthor,

    #[error("unknown author {0}")]
    UnknownAuthor(IdentityId),

    #[error("publish key expired at {0}")]
    KeyExpired(u32),
}

/// Collaborators needed to check signatures.
#[derive(Clone, Copy)]
pub struct AuthContext<'a> {
    pub policy: &'a AuthenticationRequirements,
    pub identities: &'a IdentityRegistry,
    pub verifier: &'a dyn Verifier,
}

impl AuthContext<'_> {
    /// The group must carry a valid admin signature made with the key its
    /// id derives from. A publish signature is needed when the scope asks
    /// for root publish; an author signature is checked when an author is
    /// declared.
    pub fn check_group(&self, group: &GxsGroup) -> Result<(), AuthError> {
        let admin = group.key(KeyRole::Admin).ok_or(AuthError::MissingKey(KeyRole::Admin))?;
        if GroupId::from_admin_key(&admin.public_key) != group.id {
            return Err(AuthError::GroupIdMismatch(group.id));
        }

        let signable = group.signable_bytes();
        let signatures = &group.signatures;
        self.check_signature(signatures, SignatureKind::Admin, &admin.public_key, &signable)?;

        let required = self.policy.for_scope(group.scope);
        if required.contains(Requirements::ROOT_PUBLISH) {
            let publish = group.key(KeyRole::Publish).ok_or(AuthError::MissingKey(KeyRole::Publish))?;
            self.check_signature(signatures, SignatureKind::Publish, &publish.public_key, &signable)?;
        }
        if group.author.is_some() {
            self.check_author(group.author, signatures, &signable, true)?;
        }
        Ok(())
    }

    /// The message id must match its content. Publish and author
    /// signatures are required per the group's scope, with root and child
    /// messages told apart by their parent id.
    pub fn check_message(&self, message: &GxsMessage, group: &GxsGroup) -> Result<(), AuthError> {
        if message.group_id != group.id {
            return Err(AuthError::WrongGroup {
                expected: group.id,
                found: message.group_id,
            });
        }
        if message.derived_id() != message.id {
            return Err(AuthError::MessageIdMismatch(message.id));
        }

        let required = self.policy.for_scope(group.scope);
        let (needs_publish, needs_author) = if message.is_root() {
            (
                required.contains(Requirements::ROOT_PUBLISH),
                required.contains(Requirements::ROOT_AUTHOR),
            )
        } else {
            (
                required.contains(Requirements::CHILD_PUBLISH),
                required.contains(Requirements::CHILD_AUTHOR),
            )
        };

        let signable = message.signable_bytes();
        if needs_publish {
            let publish = group.key(KeyRole::Publish).ok_or(AuthError::MissingKey(KeyRole::Publish))?;
            if publish.valid_to != 0 && message.published.to_wire() > publish.valid_to {
                return Err(AuthError::KeyExpired(publish.valid_to));
            }
            self.check_signature(&message.signatures, SignatureKind::Publish, &publish.public_key, &signable)?;
        }
        if needs_author {
            self.check_author(message.author, &message.signatures, &signable, false)?;
        }
        Ok(())
    }

    fn check_author(
        &self,
        author: Option<IdentityId>,
        signatures: &[Signature],
        signable: &[u8],
        declared_only: bool,
    ) -> Result<(), AuthError> {
        let optional = declared_only || self.policy.optional_author();
        let Some(author) = author else {
            return if optional { Ok(()) } else { Err(AuthError::MissingAuthor) };
        };
        let key = self
            .identities
            .get(&author)
            .ok_or(AuthError::UnknownAuthor(author))?;
        self.check_signature(signatures, SignatureKind::Author, &key, signable)
    }

    fn check_signature(
        &self,
        signatures: &[Signature],
        kind: SignatureKind,
        public_key: &[u8; 32],
        signable: &[u8],
    ) -> Result<(), AuthError> {
        let signature = signatures
            .iter()
            .find(|s| s.kind == kind)
            .ok_or(AuthError::MissingSignature(kind))?;
        if signature.key_id != IdentityId::from_public_key(public_key)
            || !self.verifier.verify(public_key, &signature.bytes, signable)
        {
            return Err(AuthError::InvalidSignature(kind));
        }
        Ok(())
    }
}
