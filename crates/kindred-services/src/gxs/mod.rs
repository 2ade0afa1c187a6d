//! GXS: generic group/message replication between friends.
//!
//! A concrete service plugs into [`GxsService`] through [`GxsHooks`]: it
//! declares its signature policy, which message content types are comments
//! or votes, and gets to inspect every group and message before it is
//! stored. Everything else (advertisement, anti-entropy filtering,
//! transactional transfer, authentication, persistence) is shared.

pub mod auth;
pub mod engine;
pub mod items;
pub mod store;
pub mod transaction;

use std::collections::HashMap;

use kindred_core::gxs::{AuthenticationRequirements, GxsGroup, GxsMessage, Requirements};
use kindred_core::{GroupId, Timestamp};

pub use auth::{AuthContext, AuthError};
pub use engine::{GxsService, PublishError, SyncConfig};
pub use store::{GxsStore, MemoryStore, StoreError, WriteBatch};
pub use transaction::{TransactionError, TransactionKind, TransactionManager};

/// Message content types shared by the bundled services.
pub mod content_types {
    pub const POST: u8 = 0x01;
    pub const COMMENT: u8 = 0x02;
    pub const VOTE: u8 = 0x03;
}

/// Which receive/save hook pair a message goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Message,
    Comment,
    Vote,
}

/// Service-specific behaviour of a GXS service.
///
/// Receive hooks return `false` to reject an item; rejected items are not
/// stored. Save hooks see each committed batch once.
pub trait GxsHooks: Send + Sync + 'static {
    fn authentication(&self) -> AuthenticationRequirements;

    fn message_class(&self, _content_type: u8) -> MessageClass {
        MessageClass::Message
    }

    /// Groups advertised to a friend asking for our list.
    fn list_own_groups_since(&self, store: &dyn GxsStore, since: Timestamp) -> store::Result<Vec<GxsGroup>> {
        Ok(store
            .groups()?
            .into_iter()
            .filter(|g| g.subscribed && g.published > since)
            .collect())
    }

    /// Messages of `group` advertised to a friend asking for them.
    fn list_own_messages_since(
        &self,
        store: &dyn GxsStore,
        group: &GroupId,
        since: Timestamp,
    ) -> store::Result<Vec<GxsMessage>> {
        store.messages_since(group, since)
    }

    fn on_group_received(&self, _group: &mut GxsGroup) -> bool {
        true
    }

    fn on_groups_saved(&self, _groups: &[GxsGroup]) {}

    fn on_message_received(&self, _message: &mut GxsMessage) -> bool {
        true
    }

    fn on_messages_saved(&self, _messages: &[GxsMessage]) {}

    fn on_comment_received(&self, _comment: &mut GxsMessage) -> bool {
        true
    }

    fn on_comments_saved(&self, _comments: &[GxsMessage]) {}

    fn on_vote_received(&self, _vote: &mut GxsMessage) -> bool {
        true
    }

    fn on_votes_saved(&self, _votes: &[GxsMessage]) {}
}

/// Forums: authors sign every post. Restricted and private forums also
/// need the publish key for every post.
pub fn forums_requirements() -> AuthenticationRequirements {
    let all = Requirements::ROOT_AUTHOR | Requirements::ROOT_PUBLISH | Requirements::CHILD_AUTHOR | Requirements::CHILD_PUBLISH;
    AuthenticationRequirements::builder()
        .public(Requirements::ROOT_AUTHOR | Requirements::CHILD_AUTHOR)
        .restricted(all)
        .private(all)
        .build()
}

/// Channels: only the publisher posts, anyone may comment.
pub fn channels_requirements() -> AuthenticationRequirements {
    let public = Requirements::ROOT_PUBLISH | Requirements::CHILD_AUTHOR;
    AuthenticationRequirements::builder()
        .public(public)
        .restricted(public | Requirements::CHILD_PUBLISH)
        .private(public | Requirements::CHILD_PUBLISH)
        .build()
}

/// Hooks for a service that stores whatever passes authentication.
///
/// With `auto_subscribe`, every group received is subscribed to, so its
/// messages are fetched and re-advertised.
#[derive(Debug, Clone)]
pub struct ReplicatingHooks {
    requirements: AuthenticationRequirements,
    auto_subscribe: bool,
    classes: HashMap<u8, MessageClass>,
}

impl ReplicatingHooks {
    pub fn new(requirements: AuthenticationRequirements) -> Self {
        Self {
            requirements,
            auto_subscribe: false,
            classes: HashMap::new(),
        }
    }

    pub fn forums() -> Self {
        Self::new(forums_requirements())
    }

    pub fn channels() -> Self {
        Self::new(channels_requirements())
            .classify(content_types::COMMENT, MessageClass::Comment)
            .classify(content_types::VOTE, MessageClass::Vote)
    }

    pub fn auto_subscribe(mut self, yes: bool) -> Self {
        self.auto_subscribe = yes;
        self
    }

    pub fn classify(mut self, content_type: u8, class: MessageClass) -> Self {
        self.classes.insert(content_type, class);
        self
    }
}

impl GxsHooks for ReplicatingHooks {
    fn authentication(&self) -> AuthenticationRequirements {
        self.requirements
    }

    fn message_class(&self, content_type: u8) -> MessageClass {
        self.classes.get(&content_type).copied().unwrap_or(MessageClass::Message)
    }

    fn on_group_received(&self, group: &mut GxsGroup) -> bool {
        if self.auto_subscribe {
            group.subscribed = true;
        }
        true
    }

    fn on_groups_saved(&self, groups: &[GxsGroup]) {
        for group in groups {
            tracing::debug!(group = %group.id.short(), name = %group.name, "group saved");
        }
    }

    fn on_messages_saved(&self, messages: &[GxsMessage]) {
        tracing::debug!(count = messages.len(), "messages saved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_core::gxs::DistributionScope;

    #[test]
    fn channel_policy_per_scope() {
        let policy = channels_requirements();
        let public = policy.for_scope(DistributionScope::Public);
        assert!(public.contains(Requirements::ROOT_PUBLISH));
        assert!(!public.contains(Requirements::CHILD_PUBLISH));
        assert!(policy
            .for_scope(DistributionScope::Private)
            .contains(Requirements::CHILD_PUBLISH | Requirements::CHILD_AUTHOR));
    }

    #[test]
    fn forum_policy_per_scope() {
        let policy = forums_requirements();
        assert!(!policy
            .for_scope(DistributionScope::Public)
            .contains(Requirements::ROOT_PUBLISH));
        assert!(policy
            .for_scope(DistributionScope::Restricted)
            .contains(Requirements::ROOT_PUBLISH));
    }

    #[test]
    fn channels_classify_comments_and_votes() {
        let hooks = ReplicatingHooks::channels();
        assert_eq!(hooks.message_class(content_types::POST), MessageClass::Message);
        assert_eq!(hooks.message_class(content_types::COMMENT), MessageClass::Comment);
        assert_eq!(hooks.message_class(content_types::VOTE), MessageClass::Vote);
    }
}
