//! Object store and repository management.

use crate::traits::{ReferenceSet, Repository, RepositoryStore};
use crate::{
    GitObject, HashAlgorithm, ObjectId, RefStore, RefUpdate, RefUpdateError, Reference, Result,
    StorageError,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Content-addressed object store.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Objects indexed by their hash.
    objects: RwLock<HashMap<ObjectId, GitObject>>,
}

impl ObjectStore {
    /// Creates a new empty object store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object and returns its ID.
    pub fn put(&self, object: GitObject) -> ObjectId {
        let id = object.id;
        self.objects.write().insert(id, object);
        id
    }

    /// Retrieves an object by ID.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Checks if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

/// A git repository with objects and references.
#[derive(Debug)]
pub struct MemoryRepository {
    /// Repository path as registered in its store.
    pub name: String,
    /// Hash function naming the objects.
    pub algorithm: HashAlgorithm,
    /// Object store.
    pub objects: Arc<ObjectStore>,
    /// Reference store.
    pub refs: Arc<RefStore>,
}

impl MemoryRepository {
    /// Creates a new empty SHA-1 repository.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_algorithm(name, HashAlgorithm::Sha1)
    }

    /// Creates a new empty repository using the given hash function.
    pub fn with_algorithm(name: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        let refs = Arc::new(RefStore::new());
        // Initialize HEAD to point to main branch
        refs.set_symbolic("HEAD", "refs/heads/main");

        Self {
            name: name.into(),
            algorithm,
            objects: Arc::new(ObjectStore::new()),
            refs,
        }
    }
}

impl Repository for MemoryRepository {
    fn hash_algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    fn list_refs(&self) -> Result<ReferenceSet> {
        Ok(self
            .refs
            .list("refs/")
            .into_iter()
            .filter_map(|(name, reference)| reference.as_direct().map(|id| (name, id)))
            .collect())
    }

    fn head_target(&self) -> Result<Option<String>> {
        match self.refs.get("HEAD") {
            Ok(Reference::Symbolic(target)) => Ok(Some(target)),
            Ok(Reference::Direct(_)) | Err(StorageError::RefNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.refs.get_direct(name))
    }

    fn apply_updates(
        &self,
        updates: &[RefUpdate],
        atomic: bool,
    ) -> Result<Vec<std::result::Result<(), RefUpdateError>>> {
        Ok(self.refs.apply_batch(updates, atomic))
    }

    fn read_object(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        match self.objects.get(id) {
            Ok(object) => Ok(Some(object)),
            Err(StorageError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_object(&self, object: GitObject) -> Result<ObjectId> {
        if object.id.algorithm() != self.algorithm {
            return Err(StorageError::InvalidObject(format!(
                "{} object in a {} repository",
                object.id.algorithm(),
                self.algorithm
            )));
        }
        Ok(self.objects.put(object))
    }

    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.contains(id))
    }
}

/// Store managing multiple in-memory repositories by path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    repos: RwLock<HashMap<String, Arc<MemoryRepository>>>,
    locked: RwLock<HashSet<String>>,
}

impl MemoryStore {
    /// Creates a new repository store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalises a request path: no leading or trailing slashes, no `..`.
    pub fn normalize(path: &str) -> Result<String> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() || trimmed.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(trimmed.to_string())
    }

    /// Creates a new SHA-1 repository.
    pub fn create(&self, path: &str) -> Result<Arc<MemoryRepository>> {
        self.create_with_algorithm(path, HashAlgorithm::Sha1)
    }

    /// Creates a new repository using the given hash function.
    pub fn create_with_algorithm(
        &self,
        path: &str,
        algorithm: HashAlgorithm,
    ) -> Result<Arc<MemoryRepository>> {
        let key = Self::normalize(path)?;
        let mut repos = self.repos.write();
        if repos.contains_key(&key) {
            return Err(StorageError::InvalidPath(format!("{} already exists", key)));
        }

        let repo = Arc::new(MemoryRepository::with_algorithm(key.clone(), algorithm));
        repos.insert(key.clone(), repo.clone());
        tracing::debug!(repo = %key, algorithm = %algorithm, "created repository");
        Ok(repo)
    }

    /// Gets a repository by path, trying a `.git` suffix as well.
    pub fn get(&self, path: &str) -> Result<Arc<MemoryRepository>> {
        let key = Self::normalize(path)?;
        let repos = self.repos.read();
        repos
            .get(&key)
            .or_else(|| repos.get(&format!("{}.git", key)))
            .cloned()
            .ok_or(StorageError::RepositoryNotFound(key))
    }

    /// Marks a repository as locked; resolving it fails until unlocked.
    pub fn set_locked(&self, path: &str, locked: bool) -> Result<()> {
        let key = Self::normalize(path)?;
        if locked {
            self.locked.write().insert(key);
        } else {
            self.locked.write().remove(&key);
        }
        Ok(())
    }
}

impl RepositoryStore for MemoryStore {
    fn resolve(&self, path: &str) -> Result<Arc<dyn Repository>> {
        let repo = self.get(path)?;
        if self.locked.read().contains(&repo.name) {
            return Err(StorageError::Locked(repo.name.clone()));
        }
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_store_roundtrip() {
        let store = ObjectStore::new();
        let id = store.put(GitObject::blob(b"hello".to_vec()));

        assert!(store.contains(&id));
        assert_eq!(store.get(&id).unwrap().data.as_ref(), b"hello");
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.get(&ObjectId::from_bytes([0; 20])),
            Err(StorageError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_repository_head_symbolic() {
        let repo = MemoryRepository::new("alice/project");
        assert_eq!(
            repo.head_target().unwrap(),
            Some("refs/heads/main".to_string())
        );
        // Unborn branch: HEAD dangles and is not listed.
        assert_eq!(repo.read_ref("HEAD").unwrap(), None);
        assert!(repo.list_refs().unwrap().is_empty());
    }

    #[test]
    fn test_list_refs_excludes_head() {
        let repo = MemoryRepository::new("alice/project");
        let id = repo.objects.put(GitObject::blob(b"x".to_vec()));
        repo.refs.set("refs/heads/main", id);
        repo.refs.set("refs/tags/v1", id);

        let refs = repo.list_refs().unwrap();
        let names: Vec<&String> = refs.keys().collect();
        assert_eq!(names, vec!["refs/heads/main", "refs/tags/v1"]);
    }

    #[test]
    fn test_write_object_rejects_foreign_algorithm() {
        let repo = MemoryRepository::with_algorithm("r", HashAlgorithm::Sha256);
        assert!(repo.write_object(GitObject::blob(b"x".to_vec())).is_err());
    }

    #[test]
    fn test_store_resolve() {
        let store = MemoryStore::new();
        store.create("/alice/project.git").unwrap();

        assert!(store.resolve("alice/project.git").is_ok());
        assert!(store.resolve("/alice/project").is_ok());
        assert!(matches!(
            store.resolve("bob/other"),
            Err(StorageError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_store_rejects_traversal() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(store.create("").is_err());
    }

    #[test]
    fn test_store_locked() {
        let store = MemoryStore::new();
        store.create("repo.git").unwrap();
        store.set_locked("repo.git", true).unwrap();
        assert!(matches!(store.resolve("repo.git"), Err(StorageError::Locked(_))));

        store.set_locked("repo.git", false).unwrap();
        assert!(store.resolve("repo.git").is_ok());
    }

    #[test]
    fn test_store_create_duplicate() {
        let store = MemoryStore::new();
        store.create("a/b").unwrap();
        assert!(matches!(store.create("/a/b/"), Err(StorageError::InvalidPath(_))));
    }
}
