//! Cryptographic primitives for Kindred.
//!
//! Provides two things:
//!   1. BLAKE3 hashing for content-derived ids
//!   2. Ed25519 signing and verification for groups, messages and nodes
//!
//! The sync core only ever sees the [`Signer`] and [`Verifier`] traits.
//! Private key material derives ZeroizeOnDrop and is wiped when dropped.

use std::path::Path;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for ids computed over several pieces.
///
/// # Example
/// ```
/// use kindred_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, kindred_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Collaborator traits ──────────────────────────────────────────────────────

/// Something that can sign on behalf of one public key.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> [u8; 32];
    fn sign(&self, data: &[u8]) -> [u8; 64];
}

/// Checks a signature against a public key.
pub trait Verifier: Send + Sync {
    fn verify(&self, public_key: &[u8; 32], signature: &[u8], data: &[u8]) -> bool;
}

/// Plain ed25519 verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519;

impl Verifier for Ed25519 {
    fn verify(&self, public_key: &[u8; 32], signature: &[u8], data: &[u8]) -> bool {
        verify(public_key, signature, data)
    }
}

/// Verify an ed25519 signature. Malformed keys or signatures are just
/// invalid, never an error.
pub fn verify(public_key: &[u8; 32], signature: &[u8], data: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(data, &signature).is_ok()
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A long-term ed25519 keypair: a node identity, a group admin or publish
/// key, or an author identity.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key, zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            private: Zeroizing::new(signing.to_bytes()),
            public: signing.verifying_key().to_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&private_bytes);
        Self {
            private: Zeroizing::new(private_bytes),
            public: signing.verifying_key().to_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Load the keypair stored at `path`, or generate and store a new one.
    ///
    /// The file holds the 32 raw private key bytes and is created 0600.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(
                std::fs::read(path).map_err(|e| CryptoError::Io(path.display().to_string(), e))?,
            );
            let private: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyFile(path.display().to_string()))?;
            return Ok(Self::from_private(private));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::Io(parent.display().to_string(), e))?;
        }
        write_private(path, &keypair.private_bytes()[..])
            .map_err(|e| CryptoError::Io(path.display().to_string(), e))?;
        Ok(keypair)
    }
}

impl Signer for Keypair {
    fn public_key(&self) -> [u8; 32] {
        self.public
    }

    fn sign(&self, data: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.private).sign(data).to_bytes()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key file {0}: {1}")]
    Io(String, std::io::Error),

    #[error("key file {0} does not hold a 32-byte private key")]
    InvalidKeyFile(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"group payload");
        assert!(verify(&keypair.public, &sig, b"group payload"));
        assert!(!verify(&keypair.public, &sig, b"other payload"));
        assert!(Ed25519.verify(&keypair.public, &sig, b"group payload"));
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let sig = a.sign(b"data");
        assert!(!verify(&b.public, &sig, b"data"));
    }

    #[test]
    fn malformed_signature_is_invalid() {
        let keypair = Keypair::generate();
        assert!(!verify(&keypair.public, &[1, 2, 3], b"data"));
    }

    #[test]
    fn from_private_restores_public_key() {
        let original = Keypair::generate();
        let restored = Keypair::from_private(*original.private_bytes());
        assert_eq!(original.public, restored.public);
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = std::env::temp_dir().join(format!("kindred-key-test-{}", std::process::id()));
        let path = dir.join("node.key");
        let _ = std::fs::remove_dir_all(&dir);

        let first = Keypair::load_or_generate(&path).unwrap();
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public, second.public);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
