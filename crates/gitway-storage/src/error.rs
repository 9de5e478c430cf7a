//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No repository exists at the requested path.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The repository path is not acceptable to this backend.
    #[error("invalid repository path: {0}")]
    InvalidPath(String),

    /// The requested reference was not found.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// The requested object was not found.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// An object or object id could not be parsed.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A reference could not be interpreted.
    #[error("invalid reference: {0}")]
    InvalidRef(String),

    /// The repository or one of its refs is locked by another writer.
    #[error("locked: {0}")]
    Locked(String),

    /// Incoming pack data could not be decoded.
    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// A corruption was detected.
    #[error("corruption detected: {0}")]
    Corruption(String),
}
