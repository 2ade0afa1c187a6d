//! Service trait for item-based services.
//!
//! Every Kindred service owns a service type and a set of item sub-types.
//! This trait is the contract between the connection manager (which
//! receives and sends items) and the service logic (which interprets them).

use std::sync::Arc;

use anyhow::Result;
use kindred_core::{Item, ItemFactory, PeerId, ServiceType};

use crate::manager::ConnectionManager;
use crate::peer::PeerConnection;

/// A pluggable protocol handler.
///
/// `handle_item` always runs on the sending peer's execution context, so
/// calls for one peer never overlap.
pub trait Service: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// Short name for log lines.
    fn name(&self) -> &str;

    /// Decoders for every sub-type this service accepts.
    fn item_factory(&self) -> &ItemFactory;

    /// Called when a peer that negotiated this service connects.
    fn on_activate(&self, manager: &ConnectionManager, peer: &Arc<PeerConnection>);

    /// Called when that peer disconnects. Its scheduled tasks are already
    /// cancelled.
    fn on_deactivate(&self, peer: &PeerId);

    fn handle_item(
        &self,
        manager: &ConnectionManager,
        peer: &Arc<PeerConnection>,
        item: Box<dyn Item>,
    ) -> Result<()>;
}
