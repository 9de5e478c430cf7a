//! Repository storage for Gitway.
//!
//! This crate provides content-addressed storage for git objects, reference
//! management with compare-and-swap updates, and the pack codec used by the
//! protocol sessions. The [`Repository`] and [`PackCodec`] traits are the
//! seam through which a session reaches its backend.

mod delta;
mod error;
mod object;
mod pack;
mod refs;
mod store;
mod traits;

pub use delta::apply_delta;
pub use error::StorageError;
pub use object::{GitObject, HashAlgorithm, Hasher, ObjectId, ObjectType, TreeEntry};
pub use pack::{BasicPackCodec, PackBuilder, PackParser};
pub use refs::{RefStore, RefUpdate, RefUpdateError, Reference};
pub use store::{MemoryRepository, MemoryStore, ObjectStore};
pub use traits::{PackCodec, ReferenceSet, Repository, RepositoryStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
