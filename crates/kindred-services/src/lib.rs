//! kindred-services: the peer, dispatch and GXS layers of a Kindred node.

pub mod gxs;
pub mod identity;
pub mod manager;
pub mod peer;
pub mod qos;
pub mod registry;
pub mod service;
pub mod transport;

pub use gxs::{GxsHooks, GxsService, MemoryStore, ReplicatingHooks, SyncConfig};
pub use identity::IdentityRegistry;
pub use manager::{ConnectionManager, PeerError, PeerEvent};
pub use peer::{PeerConnection, PeerSlots};
pub use qos::{Pacer, TokenBucket};
pub use registry::{RegistryError, ServiceRegistry};
pub use service::Service;
pub use transport::{ChannelReceiver, ChannelTransport, Transport, WriteCompleter, WriteError, WriteHandle, WriteResult};
