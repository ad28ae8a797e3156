//! Runtime configuration

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::TransportKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Multiplexer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub suspension: SuspensionConfig,
    pub write_queue: WriteQueueConfig,
    pub visibility: VisibilityConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
}

/// When and how render buffers of hidden terminals are released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspensionConfig {
    /// Delay between a terminal becoming hidden and its suspension (ms)
    pub suspend_after_ms: u32,

    /// Cap on terminals suspended with a snapshot (0 = never snapshot)
    pub max_suspended_terminals: u32,

    /// Snapshots larger than this are skipped and the buffer kept
    pub snapshot_size_limit_bytes: u64,

    /// Terminals that are never suspended
    pub keep_alive_terminal_ids: BTreeSet<String>,

    /// Size of each slice written back while resuming
    pub replay_chunk_bytes: usize,
}

impl Default for SuspensionConfig {
    fn default() -> Self {
        Self {
            suspend_after_ms: 5_000,
            max_suspended_terminals: 10,
            snapshot_size_limit_bytes: 2 * 1024 * 1024,
            keep_alive_terminal_ids: BTreeSet::new(),
            replay_chunk_bytes: 64 * 1024,
        }
    }
}

/// Bounds on per-terminal pending output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueConfig {
    /// Queue size that triggers dropping old output
    pub max_queue_bytes: usize,

    /// Queue size to drop down to once over the limit
    pub target_after_drop: usize,

    /// An overflow episode ends once a flush leaves at most this much queued
    pub low_water_mark: usize,

    /// Largest chunk handed to the render buffer per flush
    pub max_write_chunk: usize,

    /// Notice injected once per overflow episode; `{kb}` is replaced with
    /// the kilobytes dropped
    pub overflow_notice: String,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: 1024 * 1024,
            target_after_drop: 512 * 1024,
            low_water_mark: 64 * 1024,
            max_write_chunk: 16 * 1024,
            overflow_notice: "\r\n\x1b[33m[output truncated: {kb} KB dropped]\x1b[0m\r\n"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Fraction of a terminal's region that must be on screen to count as visible
    pub threshold: f64,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self { threshold: 0.01 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport used unless a terminal overrides it
    pub default_kind: TransportKind,

    /// Capacity of the bounded frame channel per subscription
    pub frame_channel_capacity: usize,

    /// Unacknowledged bytes a sequenced subscriber may have in flight
    pub ack_window_bytes: usize,

    /// Output kept per session for snapshots and backfill
    pub backlog_limit_bytes: usize,

    /// How often the process layer polls its sessions (ms)
    pub pump_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_kind: TransportKind::default(),
            frame_channel_capacity: 256,
            ack_window_bytes: 256 * 1024,
            backlog_limit_bytes: 1024 * 1024,
            pump_interval_ms: 10,
        }
    }
}

/// Defaults for spawned sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell used to run commands (`$SHELL` when unset)
    pub shell: Option<String>,
    pub rows: u16,
    pub cols: u16,

    /// Scrollback lines kept by each render buffer
    pub scrollback: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            rows: 24,
            cols: 80,
            scrollback: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("termplex/config.toml")),
            Some(PathBuf::from("/etc/termplex/config.toml")),
        ];

        for path in config_paths.into_iter().flatten() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => {
                        tracing::info!(
                            ?path,
                            transport = %config.transport.default_kind,
                            max_suspended = config.suspension.max_suspended_terminals,
                            "loaded configuration"
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "failed to load config");
                    }
                }
            }
        }

        tracing::info!("using default configuration");
        Self::default()
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = &self.write_queue;
        if queue.max_write_chunk == 0 {
            return Err(ConfigError::Invalid("write_queue.max_write_chunk must be > 0".into()));
        }
        if queue.target_after_drop > queue.max_queue_bytes {
            return Err(ConfigError::Invalid(format!(
                "write_queue.target_after_drop ({}) exceeds max_queue_bytes ({})",
                queue.target_after_drop, queue.max_queue_bytes
            )));
        }
        if queue.low_water_mark > queue.target_after_drop {
            return Err(ConfigError::Invalid(format!(
                "write_queue.low_water_mark ({}) exceeds target_after_drop ({})",
                queue.low_water_mark, queue.target_after_drop
            )));
        }

        if self.suspension.replay_chunk_bytes == 0 {
            return Err(ConfigError::Invalid("suspension.replay_chunk_bytes must be > 0".into()));
        }

        let threshold = self.visibility.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "visibility.threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        if self.transport.frame_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "transport.frame_channel_capacity must be > 0".into(),
            ));
        }
        if self.transport.ack_window_bytes == 0 {
            return Err(ConfigError::Invalid("transport.ack_window_bytes must be > 0".into()));
        }

        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::Invalid(format!(
                "session size must be non-zero, got {}x{}",
                self.session.cols, self.session.rows
            )));
        }

        Ok(())
    }
}

/// Helper for getting XDG directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
}
