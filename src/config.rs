//! Configuration file (TOML).
//!
//! One file configures both roles: `[server]` lists the files offered to
//! clients, `[client]` says where to connect and where files land, and
//! `[transfer]` tunes chunking. Every field has a default.

use crate::error::{Result, SyncError};
use crate::exchange::chunker::{Chunker, FRAGMENT_TIMEOUT, MAX_PENDING_TRANSFERS};
use crate::exchange::protocol::{MAX_IDENTIFIER_LEN, MAX_MESSAGE_SIZE};
use crate::exchange::registry::validate_identifier;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest accepted fragment size
pub const MIN_FRAGMENT_SIZE: usize = 1024;

/// Smallest accepted per-message limit
pub const MIN_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version string exchanged during the handshake
    pub mod_version: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub transfer: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mod_version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub files: Vec<FileConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25580".to_string(),
            files: Vec::new(),
        }
    }
}

/// A file the server offers, by identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileConfig {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub data_dir: PathBuf,
    /// Request every offered file that differs from the local copy
    pub auto_sync: bool,
    /// Explicit identifiers to request; overrides `auto_sync` when non-empty
    pub files: Vec<String>,
    /// Give up on the exchange after this many seconds
    pub sync_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:25580".to_string(),
            data_dir: PathBuf::from("."),
            auto_sync: true,
            files: Vec::new(),
            sync_timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest message (identifier + body) sent in a single frame
    pub max_message_size: usize,
    /// Fragment size for messages above `max_message_size`
    pub fragment_size: usize,
    pub fragment_timeout_secs: u64,
    pub max_pending_transfers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            fragment_size: crate::exchange::chunker::FRAGMENT_SIZE,
            fragment_timeout_secs: FRAGMENT_TIMEOUT.as_secs(),
            max_pending_transfers: MAX_PENDING_TRANSFERS,
        }
    }
}

impl TransferConfig {
    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.fragment_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size < MIN_MESSAGE_SIZE || self.max_message_size > MAX_MESSAGE_SIZE {
            return Err(SyncError::Config(format!(
                "transfer.max_message_size must be between {} and {}, got {}",
                MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE, self.max_message_size
            )));
        }
        // A full chunk frame carries the chunk identifier on top of the chunk body
        let chunk_message =
            Chunker::new(self.fragment_size).max_chunk_body() + 2 + MAX_IDENTIFIER_LEN;
        let chunk_overhead = chunk_message.saturating_sub(self.fragment_size);
        if self.fragment_size < MIN_FRAGMENT_SIZE || chunk_message > self.max_message_size {
            return Err(SyncError::Config(format!(
                "transfer.fragment_size must be between {} and {}, got {}",
                MIN_FRAGMENT_SIZE,
                self.max_message_size.saturating_sub(chunk_overhead),
                self.fragment_size
            )));
        }
        if self.max_pending_transfers == 0 {
            return Err(SyncError::Config(
                "transfer.max_pending_transfers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate a config file. Relative paths are resolved against
    /// the directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for file in &mut self.server.files {
            file.path = resolve(base, &file.path);
        }
        self.client.data_dir = resolve(base, &self.client.data_dir);
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for file in &self.server.files {
            validate_identifier(&file.id)?;
            if !seen.insert(file.id.as_str()) {
                return Err(SyncError::Config(format!(
                    "server.files lists '{}' more than once",
                    file.id
                )));
            }
        }
        for id in &self.client.files {
            validate_identifier(id)?;
        }
        if self.client.sync_timeout_secs == 0 {
            return Err(SyncError::Config(
                "client.sync_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.transfer.validate()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}
