//! Error types for the daemon
//!
//! Transport failures halt the owning worker, duplicate keys are invariant
//! violations, persistence failures are retried on the next flush.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MvboxError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Duplicate message id in store: {0}")]
    DuplicateKey(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message-ID mismatch for {seq}: headers say {expected}, body says {actual}")]
    MessageIdMismatch {
        seq: u32,
        expected: String,
        actual: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Worker for {0} stopped before finishing its first pass")]
    PeerStopped(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl MvboxError {
    /// Errors a reconnect can cure
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::MessageIdMismatch { .. })
    }
}

impl From<std::io::Error> for MvboxError {
    fn from(err: std::io::Error) -> Self {
        MvboxError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for MvboxError {
    fn from(e: rusqlite::Error) -> Self {
        MvboxError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for MvboxError {
    fn from(e: r2d2::Error) -> Self {
        MvboxError::Database(e.to_string())
    }
}

impl From<toml::de::Error> for MvboxError {
    fn from(err: toml::de::Error) -> Self {
        MvboxError::Config(err.to_string())
    }
}

impl From<mailparse::MailParseError> for MvboxError {
    fn from(err: mailparse::MailParseError) -> Self {
        MvboxError::Parse(err.to_string())
    }
}

impl From<async_imap::error::Error> for MvboxError {
    fn from(err: async_imap::error::Error) -> Self {
        MvboxError::Transport(err.to_string())
    }
}

/// Result type alias using MvboxError
pub type Result<T> = std::result::Result<T, MvboxError>;
