use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MuxError>;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("no session matches '{0}'")]
    NoSuchSession(String),
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl MuxError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Encoding failures for inbound event records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event name must be non-empty and free of spaces")]
    BadName,
    #[error("event payload contains a reserved byte {0:#04x}")]
    ReservedByte(u8),
}
