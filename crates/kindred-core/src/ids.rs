//! Identifiers and timestamps shared across the workspace.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::serial::identifier;

identifier!(
    /// A friend node, identified by its ed25519 public key.
    PeerId,
    32
);

identifier!(
    /// Content-derived group id: the first 16 bytes of the BLAKE3 hash of
    /// the group's admin public key.
    GroupId,
    16
);

identifier!(
    /// Content-derived message id: the first 20 bytes of the BLAKE3 hash of
    /// the message's signable bytes.
    MessageId,
    20
);

identifier!(
    /// An author identity or a signing key, derived from its public key the
    /// same way group ids are.
    IdentityId,
    16
);

impl GroupId {
    pub fn from_admin_key(public_key: &[u8; 32]) -> Self {
        Self(truncated(public_key))
    }
}

impl MessageId {
    pub fn from_signable(signable: &[u8]) -> Self {
        Self(truncated(signable))
    }
}

impl IdentityId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(truncated(public_key))
    }
}

fn truncated<const N: usize>(data: &[u8]) -> [u8; N] {
    let digest = crypto::hash(data);
    let mut out = [0u8; N];
    out.copy_from_slice(&digest[..N]);
    out
}

// ── Timestamp ────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
///
/// The wire carries whole seconds, so any comparison against an advertised
/// value goes through [`Timestamp::as_secs`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(elapsed.as_millis() as u64)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Decode the u32 seconds used on the wire.
    pub fn from_wire(secs: u32) -> Self {
        Self::from_secs(u64::from(secs))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Whole seconds, saturated into the u32 the wire carries.
    pub fn to_wire(&self) -> u32 {
        u32::try_from(self.as_secs()).unwrap_or(u32::MAX)
    }

    pub fn truncated(&self) -> Self {
        Self::from_secs(self.as_secs())
    }

    pub fn saturating_sub(&self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_is_derived_from_admin_key() {
        let a = GroupId::from_admin_key(&[7u8; 32]);
        let b = GroupId::from_admin_key(&[7u8; 32]);
        let c = GroupId::from_admin_key(&[8u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_null());
    }

    #[test]
    fn timestamp_truncates_to_seconds() {
        let t = Timestamp::from_millis(100_999);
        assert_eq!(t.as_secs(), 100);
        assert_eq!(t.to_wire(), 100);
        assert_eq!(t.truncated(), Timestamp::from_secs(100));
        assert_eq!(Timestamp::from_wire(100), Timestamp::from_secs(100));
    }

    #[test]
    fn identifiers_serialize_as_hex() {
        let id = IdentityId([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: IdentityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
