//! Known author identities.
//!
//! Author signatures on groups and messages are verified against the
//! public key registered here for the declared author id. The registry
//! is shared by every GXS service.
//!
//! When constructed with a `persist_path`, identities are written to disk
//! on every mutation and reloaded on startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use kindred_core::IdentityId;

#[derive(Clone, Default)]
pub struct IdentityRegistry {
    keys: Arc<DashMap<IdentityId, [u8; 32]>>,
    persist_path: Arc<Option<PathBuf>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry persisted at `path`, loading what is already there.
    pub fn with_persistence(path: PathBuf) -> Self {
        let registry = Self {
            keys: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path)),
        };
        registry.load_from_disk();
        registry
    }

    /// Register a public key. Returns the identity id derived from it.
    pub fn insert(&self, public_key: [u8; 32]) -> IdentityId {
        let id = IdentityId::from_public_key(&public_key);
        if self.keys.insert(id, public_key).is_none() {
            self.save_to_disk();
            tracing::debug!(identity = %id.short(), "identity registered");
        }
        id
    }

    pub fn get(&self, id: &IdentityId) -> Option<[u8; 32]> {
        self.keys.get(id).map(|k| *k.value())
    }

    pub fn contains(&self, id: &IdentityId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn remove(&self, id: &IdentityId) {
        if self.keys.remove(id).is_some() {
            self.save_to_disk();
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Apply config: hex-encoded public keys known ahead of time.
    pub fn apply_config(&self, public_keys: &[String]) {
        for hex_key in public_keys {
            match decode_key(hex_key) {
                Some(key) => {
                    let id = IdentityId::from_public_key(&key);
                    // Config-sourced keys are not written back.
                    self.keys.insert(id, key);
                }
                None => tracing::warn!(key = %hex_key, "ignoring malformed identity key"),
            }
        }
    }
}

fn decode_key(hex_key: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_key).ok()?;
    bytes.as_slice().try_into().ok()
}

impl IdentityRegistry {
    /// Serialize all identities to disk as JSON. Best-effort, logs on failure.
    fn save_to_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let snapshot: HashMap<String, String> = self
            .keys
            .iter()
            .map(|entry| (entry.key().to_hex(), hex::encode(entry.value())))
            .collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist identities");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize identities");
            }
        }
    }

    fn load_from_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read identities");
                return;
            }
        };
        let map: HashMap<String, String> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse identities");
                return;
            }
        };
        let mut loaded = 0usize;
        for hex_key in map.values() {
            if let Some(key) = decode_key(hex_key) {
                self.keys.insert(IdentityId::from_public_key(&key), key);
                loaded += 1;
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted identities");
        }
    }
}
