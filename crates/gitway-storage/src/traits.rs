//! Storage backend traits.
//!
//! Defines the interface the protocol core consumes, so that sessions stay
//! independent of how a given engine stores objects and refs.

use crate::{GitObject, HashAlgorithm, ObjectId, RefUpdate, RefUpdateError, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

/// Snapshot of a repository's refs, keyed and iterated by name.
pub type ReferenceSet = BTreeMap<String, ObjectId>;

/// Resolves repository paths to repositories.
pub trait RepositoryStore: Send + Sync {
    /// Opens the repository at `path`.
    ///
    /// Fails with [`crate::StorageError::RepositoryNotFound`] when nothing
    /// lives there.
    fn resolve(&self, path: &str) -> Result<Arc<dyn Repository>>;
}

/// One repository as seen by a protocol session.
///
/// Implementations must make [`Repository::apply_updates`] a per-ref
/// compare-and-swap that returns only after the new values are durable;
/// concurrent sessions rely on it instead of locking among themselves.
pub trait Repository: Send + Sync {
    /// Hash function naming the objects of this repository.
    fn hash_algorithm(&self) -> HashAlgorithm;

    /// Direct refs under `refs/`.
    fn list_refs(&self) -> Result<ReferenceSet>;

    /// Target of a symbolic `HEAD`, if HEAD is symbolic.
    fn head_target(&self) -> Result<Option<String>>;

    /// Current value of a ref, `None` if it does not exist.
    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Applies ref updates in order, one result per update.
    fn apply_updates(
        &self,
        updates: &[RefUpdate],
        atomic: bool,
    ) -> Result<Vec<std::result::Result<(), RefUpdateError>>>;

    /// Reads an object.
    fn read_object(&self, id: &ObjectId) -> Result<Option<GitObject>>;

    /// Stores an object and returns its id.
    fn write_object(&self, object: GitObject) -> Result<ObjectId>;

    /// True if the object is part of this repository.
    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.read_object(id)?.is_some())
    }

    /// Ids the object points at; empty for unknown objects.
    fn object_links(&self, id: &ObjectId) -> Result<Vec<ObjectId>> {
        match self.read_object(id)? {
            Some(object) => object.links(),
            None => Ok(Vec::new()),
        }
    }

    /// Follows annotated tags down to the first non-tag object.
    ///
    /// Returns `None` when `id` is not a tag.
    fn peel_tag(&self, id: &ObjectId) -> Result<Option<ObjectId>> {
        let mut current = *id;
        let mut peeled = None;
        while let Some(object) = self.read_object(&current)? {
            if object.object_type != crate::ObjectType::Tag {
                break;
            }
            match object.links()?.first() {
                Some(target) => {
                    current = *target;
                    peeled = Some(current);
                }
                None => break,
            }
        }
        Ok(peeled)
    }
}

/// Serialises object sets into packs and ingests incoming packs.
pub trait PackCodec: Send + Sync {
    /// Writes a pack holding exactly `objects` to `out`, returning the count.
    fn generate_pack(
        &self,
        repo: &dyn Repository,
        objects: &[ObjectId],
        out: &mut dyn Write,
    ) -> Result<u32>;

    /// Reads one pack from `input`, storing its objects in `repo`.
    ///
    /// Consumes exactly the pack's bytes. Fails with
    /// [`crate::StorageError::CorruptPack`] on malformed data.
    fn ingest_pack(&self, repo: &dyn Repository, input: &mut dyn BufRead) -> Result<Vec<ObjectId>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectType, StorageError};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    // Minimal repository exercising the default methods.
    #[derive(Default)]
    struct MockRepository {
        objects: RwLock<HashMap<ObjectId, GitObject>>,
    }

    impl Repository for MockRepository {
        fn hash_algorithm(&self) -> HashAlgorithm {
            HashAlgorithm::Sha1
        }

        fn list_refs(&self) -> Result<ReferenceSet> {
            Ok(ReferenceSet::new())
        }

        fn head_target(&self) -> Result<Option<String>> {
            Ok(None)
        }

        fn read_ref(&self, _name: &str) -> Result<Option<ObjectId>> {
            Ok(None)
        }

        fn apply_updates(
            &self,
            _updates: &[RefUpdate],
            _atomic: bool,
        ) -> Result<Vec<std::result::Result<(), RefUpdateError>>> {
            Err(StorageError::Locked("read-only".into()))
        }

        fn read_object(&self, id: &ObjectId) -> Result<Option<GitObject>> {
            Ok(self.objects.read().get(id).cloned())
        }

        fn write_object(&self, object: GitObject) -> Result<ObjectId> {
            let id = object.id;
            self.objects.write().insert(id, object);
            Ok(id)
        }
    }

    #[test]
    fn test_default_has_object() {
        let repo = MockRepository::default();
        let id = repo.write_object(GitObject::blob(b"x".to_vec())).unwrap();
        assert!(repo.has_object(&id).unwrap());
        assert!(!repo.has_object(&ObjectId::from_bytes([1; 20])).unwrap());
    }

    #[test]
    fn test_default_peel_tag_chain() {
        let repo = MockRepository::default();
        let tree = repo.write_object(GitObject::tree(&[])).unwrap();
        let commit = repo
            .write_object(GitObject::commit(&tree, &[], "a", "a", "m"))
            .unwrap();
        let inner = repo
            .write_object(GitObject::tag(&commit, ObjectType::Commit, "v1", "t", "m"))
            .unwrap();
        let outer = repo
            .write_object(GitObject::tag(&inner, ObjectType::Tag, "v1-signed", "t", "m"))
            .unwrap();

        assert_eq!(repo.peel_tag(&outer).unwrap(), Some(commit));
        assert_eq!(repo.peel_tag(&commit).unwrap(), None);
    }

    #[test]
    fn test_default_object_links_unknown() {
        let repo = MockRepository::default();
        assert!(repo
            .object_links(&ObjectId::from_bytes([5; 20]))
            .unwrap()
            .is_empty());
    }
}
