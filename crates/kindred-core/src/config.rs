//! Configuration system for Kindred.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $KINDRED_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/kindred/config.toml
//!   3. ~/.config/kindred/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{service_types, ServiceType};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KindredConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub friends: FriendsConfig,
    pub gxs: GxsConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the node's ed25519 key. Generated on first run.
    pub keypair_path: PathBuf,
    /// Hex ed25519 keys of authors trusted before they are ever seen.
    pub known_identities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the daemon accepts friend connections on.
    pub listen_addr: String,
    /// Inbound bandwidth we advertise to friends, bytes per second. 0 = unlimited.
    pub bandwidth: u32,
    /// Consecutive frame errors after which a friend is disconnected.
    pub max_frame_errors: u32,
    /// Seconds between reconnection attempts to offline friends.
    pub redial_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FriendsConfig {
    pub peers: Vec<FriendEntry>,
}

/// One friend: their node key and where to reach them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendEntry {
    /// Hex-encoded ed25519 node public key.
    pub id: String,
    /// `host:port`. Empty = only accept, never dial.
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GxsConfig {
    /// First sync runs a random number of seconds in this window after connect.
    pub initial_delay_min_secs: u64,
    pub initial_delay_max_secs: u64,
    /// Seconds between sync cycles with one friend.
    pub sync_period_secs: u64,
    /// How far back to ask for messages on first contact, in days.
    pub message_window_days: u64,
    /// Seconds before an unfinished transaction is dropped.
    pub transaction_timeout_secs: u64,
    /// Directory for group and message snapshots. Empty = memory only.
    pub store_path: PathBuf,
    /// Known author identities, JSON.
    pub identities_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub forums: bool,
    pub channels: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("node.key"),
            known_identities: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7812".to_string(),
            bandwidth: 0,
            max_frame_errors: 8,
            redial_secs: 30,
        }
    }
}

impl Default for GxsConfig {
    fn default() -> Self {
        Self {
            initial_delay_min_secs: 10,
            initial_delay_max_secs: 15,
            sync_period_secs: 60,
            message_window_days: 5 * 365,
            transaction_timeout_secs: 120,
            store_path: data_dir().join("gxs"),
            identities_path: data_dir().join("identities.json"),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            forums: true,
            channels: true,
        }
    }
}

impl GxsConfig {
    pub fn initial_delay(&self) -> (Duration, Duration) {
        let min = self.initial_delay_min_secs;
        let max = self.initial_delay_max_secs.max(min);
        (Duration::from_secs(min), Duration::from_secs(max))
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs.max(1))
    }

    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window_days * 24 * 60 * 60)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

impl ServicesConfig {
    /// Service types enabled in this config.
    pub fn enabled(&self) -> Vec<ServiceType> {
        let mut out = Vec::new();
        if self.forums {
            out.push(service_types::FORUMS);
        }
        if self.channels {
            out.push(service_types::CHANNELS);
        }
        out
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("kindred")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("kindred")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl KindredConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            KindredConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("KINDRED_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&KindredConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply KINDRED_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("KINDRED_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("KINDRED_NETWORK__BANDWIDTH") {
            if let Ok(b) = v.parse() {
                self.network.bandwidth = b;
            }
        }
        if let Some(v) = lookup("KINDRED_GXS__SYNC_PERIOD_SECS") {
            if let Ok(s) = v.parse() {
                self.gxs.sync_period_secs = s;
            }
        }
        if let Some(v) = lookup("KINDRED_GXS__STORE_PATH") {
            self.gxs.store_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KINDRED_SERVICES__FORUMS") {
            self.services.forums = flag(v);
        }
        if let Some(v) = lookup("KINDRED_SERVICES__CHANNELS") {
            self.services.channels = flag(v);
        }
    }
}
