//! Errors shared between the process layer, transports and streams

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::wire::TerminalId;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unknown terminal: {0}")]
    UnknownTerminal(TerminalId),

    #[error("terminal already exists: {0}")]
    AlreadyExists(TerminalId),

    #[error("failed to spawn {id}: {reason}")]
    Spawn { id: TerminalId, reason: String },

    #[error("I/O error on {id}: {source}")]
    Io {
        id: TerminalId,
        #[source]
        source: std::io::Error,
    },

    #[error("process layer unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Failure to start a stream
///
/// Cloneable so every caller awaiting the same start sees the error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream {0} was disposed while starting")]
    Disposed(TerminalId),
}

impl From<TransportError> for StreamError {
    fn from(e: TransportError) -> Self {
        StreamError::Transport(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MultiplexerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("terminal not open: {0}")]
    NotOpen(TerminalId),
}
