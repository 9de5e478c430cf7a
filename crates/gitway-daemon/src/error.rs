//! Daemon error types.

use gitway_git::GitError;
use thiserror::Error;

/// Errors raised while accepting and dispatching connections.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The `git://` request line is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Session failure.
    #[error(transparent)]
    Git(#[from] GitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
