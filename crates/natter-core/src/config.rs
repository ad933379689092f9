//! Configuration system for natter.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NATTER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/natter/config.toml
//!   3. ~/.config/natter/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{HANDSHAKE_TIMEOUT_SECS, MAX_ENVELOPE_LEN};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NatterConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub wire: WireConfig,
    pub liveness: LivenessConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    /// Bound of the outbound envelope queue.
    pub outbound_capacity: usize,
    pub queue_policy: QueuePolicy,
}

/// What the client does when its outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Wait for the writer to free a slot.
    #[default]
    Block,
    /// Drop the envelope being sent.
    DropNewest,
    /// Fail the send.
    Reject,
}

impl std::str::FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "drop_newest" => Ok(Self::DropNewest),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown queue policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub handshake_timeout_secs: u64,
    pub max_envelope_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub ping_interval_ms: u64,
    /// A peer silent for longer than this is closed.
    pub max_no_reply_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Idle time after which an in-flight transfer is abandoned.
    pub timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".into(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8080".into(),
            outbound_capacity: 1000,
            queue_policy: QueuePolicy::Block,
        }
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
            max_envelope_bytes: MAX_ENVELOPE_LEN,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 15_000,
            max_no_reply_ms: 60_000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            timeout_secs: 90,
            sweep_interval_ms: 5_000,
        }
    }
}

impl WireConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl LivenessConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn max_no_reply(&self) -> Duration {
        Duration::from_millis(self.max_no_reply_ms)
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("natter")
}

fn home_dir() -> PathBuf {
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

impl NatterConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read one file, falling back to defaults when it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(NatterConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn file_path() -> PathBuf {
        std::env::var("NATTER_CONFIG")
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
            let text = toml::to_string_pretty(&NatterConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply NATTER_* overrides read through `lookup`. Unparseable values
    /// are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("NATTER_SERVER__LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = lookup("NATTER_CLIENT__SERVER_ADDR") {
            self.client.server_addr = v;
        }
        if let Some(p) = lookup("NATTER_CLIENT__QUEUE_POLICY").and_then(|v| v.parse().ok()) {
            self.client.queue_policy = p;
        }
        if let Some(ms) = lookup("NATTER_LIVENESS__PING_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.liveness.ping_interval_ms = ms;
        }
        if let Some(ms) = lookup("NATTER_LIVENESS__MAX_NO_REPLY_MS").and_then(|v| v.parse().ok()) {
            self.liveness.max_no_reply_ms = ms;
        }
        if let Some(s) = lookup("NATTER_TRANSFER__TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.transfer.timeout_secs = s;
        }
    }
}
