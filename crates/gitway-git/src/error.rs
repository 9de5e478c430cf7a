//! Git protocol error types.

use gitway_storage::{ObjectId, StorageError};
use thiserror::Error;

/// Flat classification of session failures, for transports that map errors
/// to their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Framing,
    Capability,
    UnknownWant,
    CorruptPack,
    Backend,
    Protocol,
    Cancelled,
    Io,
}

/// Errors that terminate a protocol session.
#[derive(Debug, Error)]
pub enum GitError {
    /// Repository (or another addressed entity) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed pkt-line input, or a line too long to frame.
    #[error("invalid pkt-line: {0}")]
    Framing(String),

    /// A capability was required that cannot be honoured.
    #[error("capability error: {0}")]
    Capability(String),

    /// The client wanted an object the server will not serve.
    #[error("not our ref {0}")]
    UnknownWant(ObjectId),

    /// Pack ingestion or generation failed.
    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    /// Storage failure, message preserved.
    #[error("backend error: {0}")]
    Backend(String),

    /// Unexpected line for the current phase.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session was cancelled by its transport.
    #[error("session cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Returns the flat kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Framing(_) => ErrorKind::Framing,
            Self::Capability(_) => ErrorKind::Capability,
            Self::UnknownWant(_) => ErrorKind::UnknownWant,
            Self::CorruptPack(_) => ErrorKind::CorruptPack,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<StorageError> for GitError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RepositoryNotFound(path) => Self::NotFound(path),
            StorageError::CorruptPack(msg) => Self::CorruptPack(msg),
            StorageError::Io(e) => Self::Io(e),
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Per-command rejection reported in `ng` lines; never aborts siblings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The ref no longer holds the command's old id.
    #[error("stale info")]
    StaleRef,

    /// The new id does not resolve after pack ingestion.
    #[error("missing necessary objects")]
    MissingObject,

    #[error("funny refname")]
    InvalidRefName,

    #[error("deletion prohibited")]
    DeletionDenied,

    #[error("non-fast-forward")]
    NonFastForward,

    /// Another command in an atomic batch failed.
    #[error("atomic push failed")]
    AtomicAborted,

    /// The pushed pack could not be ingested.
    #[error("unpacker error")]
    UnpackerError,

    #[error("{0}")]
    Backend(String),
}
