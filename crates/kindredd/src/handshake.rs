//! Friend handshake on a fresh stream.
//!
//! ```text
//!   Preamble { magic, version, nonce }        both directions
//!   ServiceInfo item (service 0x0020)          both directions
//! ```
//!
//! The service-info item names the sender's node key, the services it
//! runs and the inbound bandwidth it wants paced to. Its signature covers
//! both nonces, so a recorded hello cannot be replayed. Only node keys
//! configured as friends are accepted.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use kindred_core::codec::{Item, ItemBody, ItemFactory, ItemWriter};
use kindred_core::crypto::{self, Keypair, Signer};
use kindred_core::declared_fields;
use kindred_core::wire::{service_types, FrameDecoder};
use kindred_core::{PeerId, RawItem, ServiceType, WireError};

pub const MAGIC: [u8; 4] = *b"KNDR";
pub const PROTOCOL_VERSION: u8 = 1;

const SERVICE_INFO_SUB_TYPE: u8 = 0x01;

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Preamble {
    magic: [u8; 4],
    version: u8,
    reserved: [u8; 3],
    nonce: [u8; 32],
}

const PREAMBLE_SIZE: usize = std::mem::size_of::<Preamble>();

impl Preamble {
    fn new(nonce: [u8; 32]) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            reserved: [0; 3],
            nonce,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub node_id: PeerId,
    pub services: Vec<u16>,
    pub bandwidth: u32,
    pub signature: Bytes,
}

declared_fields!(ServiceInfo {
    node_id,
    services,
    bandwidth,
    signature,
});

impl Item for ServiceInfo {
    fn sub_type(&self) -> u8 {
        SERVICE_INFO_SUB_TYPE
    }

    fn body(&self) -> ItemBody<'_> {
        ItemBody::Declared(self)
    }
}

/// What we tell friends about ourselves.
pub struct LocalInfo {
    pub keypair: Arc<Keypair>,
    pub services: Vec<ServiceType>,
    pub bandwidth: u32,
}

impl LocalInfo {
    pub fn node_id(&self) -> PeerId {
        PeerId(self.keypair.public)
    }
}

/// A verified friend, ready to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub peer: PeerId,
    pub services: Vec<ServiceType>,
    pub bandwidth: u32,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake io: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad preamble (magic {magic:02x?}, version {version})")]
    BadPreamble { magic: [u8; 4], version: u8 },

    #[error("handshake frame: {0}")]
    Wire(#[from] WireError),

    #[error("expected a service-info item, got service {service:#06x} sub-type {sub_type:#04x}")]
    UnexpectedItem { service: ServiceType, sub_type: u8 },

    #[error("{0} is not a configured friend")]
    NotAFriend(PeerId),

    #[error("hello from {0} carries an invalid signature")]
    BadSignature(PeerId),

    #[error("connected to ourselves")]
    SelfConnect,
}

/// Bytes signed in a hello: the receiver's nonce, then the sender's, then
/// the sender's node key.
fn transcript(receiver_nonce: &[u8; 32], sender_nonce: &[u8; 32], sender: &PeerId) -> [u8; 32] {
    let mut hasher = crypto::Hasher::new();
    hasher.update(b"kindred-hello-v1");
    hasher.update(receiver_nonce);
    hasher.update(sender_nonce);
    hasher.update(sender.as_bytes());
    hasher.finalize()
}

/// Run the handshake on `stream`. Returns the verified friend and any
/// bytes read past its hello, which belong to the item stream.
pub async fn perform<S>(
    stream: &mut S,
    local: &LocalInfo,
    friends: &HashSet<PeerId>,
) -> Result<(Hello, FrameDecoder), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    stream.write_all(Preamble::new(nonce).as_bytes()).await?;

    let mut buf = [0u8; PREAMBLE_SIZE];
    stream.read_exact(&mut buf).await?;
    let theirs = Preamble::read_from(&buf[..]).ok_or(HandshakeError::BadPreamble {
        magic: [0; 4],
        version: 0,
    })?;
    if theirs.magic != MAGIC || theirs.version != PROTOCOL_VERSION {
        return Err(HandshakeError::BadPreamble {
            magic: theirs.magic,
            version: theirs.version,
        });
    }

    let node_id = local.node_id();
    let info = ServiceInfo {
        node_id,
        services: local.services.clone(),
        bandwidth: local.bandwidth,
        signature: Bytes::copy_from_slice(&local.keypair.sign(&transcript(&theirs.nonce, &nonce, &node_id))),
    };
    let raw = ItemWriter::new().write(service_types::SERVICE_INFO, &info)?;
    stream.write_all(raw.frame()).await?;
    stream.flush().await?;

    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];
    let frame = loop {
        if let Some(frame) = decoder.next_frame()? {
            break frame;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        decoder.extend(&chunk[..n]);
    };

    let raw = RawItem::parse(frame)?;
    if raw.service_type != service_types::SERVICE_INFO {
        return Err(HandshakeError::UnexpectedItem {
            service: raw.service_type,
            sub_type: raw.sub_type,
        });
    }
    let item = ItemFactory::new()
        .declared::<ServiceInfo>(SERVICE_INFO_SUB_TYPE)
        .decode(&raw)?;
    let hello = item.downcast_ref::<ServiceInfo>().ok_or(HandshakeError::UnexpectedItem {
        service: raw.service_type,
        sub_type: raw.sub_type,
    })?;

    if hello.node_id == node_id {
        return Err(HandshakeError::SelfConnect);
    }
    if !friends.contains(&hello.node_id) {
        return Err(HandshakeError::NotAFriend(hello.node_id));
    }
    let signed = transcript(&nonce, &theirs.nonce, &hello.node_id);
    if !crypto::verify(hello.node_id.as_bytes(), &hello.signature, &signed) {
        return Err(HandshakeError::BadSignature(hello.node_id));
    }

    Ok((
        Hello {
            peer: hello.node_id,
            services: hello.services.clone(),
            bandwidth: hello.bandwidth,
        },
        decoder,
    ))
}
