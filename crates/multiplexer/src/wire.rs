//! Messages exchanged with the process layer
//!
//! Serialized as JSON, one message per line, when they cross a process
//! boundary.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum size of one JSON message line (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of environment variables in a spawn request
const MAX_ENV_VARS: usize = 1000;

/// Maximum size of a single environment variable (key + value)
const MAX_ENV_VAR_SIZE: usize = 1024 * 10; // 10 KB

/// Maximum command string size
const MAX_COMMAND_SIZE: usize = 1024 * 10; // 10 KB

#[derive(Debug, Error)]
pub enum WireError {
    /// Empty message received
    #[error("empty message received")]
    EmptyMessage,

    /// Message too large
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// JSON parse error
    #[error("failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),
}

/// Opaque key identifying one terminal session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(pub String);

impl TerminalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TerminalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TerminalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One chunk of process output
///
/// `seq` is strictly increasing per terminal, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// Reply to a subscribe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscribeReply {
    /// Caller had no position: the whole buffered backlog, up to `seq`
    Snapshot { seq: u64, bytes: Vec<u8> },

    /// Caller resumes from a known position; frames after it will stream
    DeltaReady { seq: u64 },
}

impl SubscribeReply {
    pub fn seq(&self) -> u64 {
        match self {
            SubscribeReply::Snapshot { seq, .. } | SubscribeReply::DeltaReady { seq } => *seq,
        }
    }
}

/// Request for output buffered after `from_seq` (everything when absent)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub id: TerminalId,
    #[serde(default)]
    pub from_seq: Option<u64>,
}

/// Buffered output covering frames `start_seq..=seq`
///
/// `data` is empty (and `start_seq > seq`) when nothing newer is buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backfill {
    pub seq: u64,
    pub start_seq: u64,
    pub data: Vec<u8>,
}

/// Start a process for a terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub id: TerminalId,
    /// Working directory for the process
    pub cwd: PathBuf,
    pub rows: u16,
    pub cols: u16,
    /// Environment variables layered over the host's
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Command run through the shell; an interactive shell when absent
    #[serde(default)]
    pub command: Option<String>,
}

impl SpawnRequest {
    /// Check size limits on the request's fields
    pub fn validate(&self) -> Result<(), WireError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(WireError::Validation(format!(
                "invalid size: {}x{}",
                self.cols, self.rows
            )));
        }
        if let Some(command) = &self.command {
            if command.len() > MAX_COMMAND_SIZE {
                return Err(WireError::Validation(format!(
                    "command too large: {} bytes (max {})",
                    command.len(),
                    MAX_COMMAND_SIZE
                )));
            }
        }
        if self.env.len() > MAX_ENV_VARS {
            return Err(WireError::Validation(format!(
                "too many environment variables: {} (max {})",
                self.env.len(),
                MAX_ENV_VARS
            )));
        }
        for (key, value) in &self.env {
            let total = key.len() + value.len();
            if total > MAX_ENV_VAR_SIZE {
                return Err(WireError::Validation(format!(
                    "environment variable too large: {} ({} bytes, max {})",
                    key, total, MAX_ENV_VAR_SIZE
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate one JSON line
    pub fn from_json_line(line: &str) -> Result<Self, WireError> {
        if line.trim().is_empty() {
            return Err(WireError::EmptyMessage);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let request: SpawnRequest = serde_json::from_str(line)?;
        request.validate()?;
        Ok(request)
    }
}

/// A spawned session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: TerminalId,
    pub pid: Option<u32>,
}

/// Broadcast by the process layer to push listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyEvent {
    Output { id: TerminalId, frame: Frame },
    Exited { id: TerminalId },
}

impl PtyEvent {
    pub fn id(&self) -> &TerminalId {
        match self {
            PtyEvent::Output { id, .. } | PtyEvent::Exited { id } => id,
        }
    }
}

/// Which transport protocol a terminal's stream uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Push events filtered by id, no handshake, no flow control
    Standard,
    /// Subscribe with resume position, per-frame acknowledgement
    #[default]
    Sequenced,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Standard => f.write_str("standard"),
            TransportKind::Sequenced => f.write_str("sequenced"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(TransportKind::Standard),
            "sequenced" => Ok(TransportKind::Sequenced),
            other => Err(WireError::Validation(format!(
                "unknown transport kind: {}",
                other
            ))),
        }
    }
}
