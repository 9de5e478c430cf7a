//! Git object types and utilities.

use crate::{Result, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

/// Hash function a repository uses to name its objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-1, 20-byte ids.
    #[default]
    Sha1,
    /// SHA-256, 32-byte ids.
    Sha256,
}

impl HashAlgorithm {
    /// Returns the name used by the `object-format` capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of a raw digest in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Length of a hex-encoded digest.
    pub fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    /// The all-zero id of this algorithm.
    pub fn null_id(&self) -> ObjectId {
        match self {
            Self::Sha1 => ObjectId::Sha1([0u8; 20]),
            Self::Sha256 => ObjectId::Sha256([0u8; 32]),
        }
    }

    /// Creates a fresh incremental hasher.
    pub fn hasher(&self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(Sha1::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown hash algorithm: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher for either supported algorithm.
#[derive(Clone)]
pub enum Hasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA-256 state.
    Sha256(Sha256),
}

impl Hasher {
    /// Feeds more data into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finishes hashing and returns the raw digest.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }

    /// Finishes hashing and returns the digest as an object id.
    pub fn finalize_id(self) -> ObjectId {
        match self {
            Self::Sha1(h) => {
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(&h.finalize());
                ObjectId::Sha1(bytes)
            }
            Self::Sha256(h) => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&h.finalize());
                ObjectId::Sha256(bytes)
            }
        }
    }
}

/// An object identifier: a SHA-1 or SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// 20-byte SHA-1 id.
    Sha1([u8; 20]),
    /// 32-byte SHA-256 id.
    Sha256([u8; 32]),
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates a SHA-1 ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self::Sha1(bytes)
    }

    /// Creates an ObjectId from a raw digest; the length selects the algorithm.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if let Ok(raw) = <[u8; 20]>::try_from(bytes) {
            return Ok(Self::Sha1(raw));
        }
        if let Ok(raw) = <[u8; 32]>::try_from(bytes) {
            return Ok(Self::Sha256(raw));
        }
        Err(StorageError::InvalidObject(format!(
            "invalid object id length: {} bytes",
            bytes.len()
        )))
    }

    /// Creates an ObjectId from a hex string of 40 (SHA-1) or 64 (SHA-256) digits.
    pub fn from_hex(hex: &str) -> Result<Self> {
        match hex.len() {
            40 => {
                let mut bytes = [0u8; 20];
                hex::decode_to_slice(hex, &mut bytes)
                    .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
                Ok(Self::Sha1(bytes))
            }
            64 => {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(hex, &mut bytes)
                    .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
                Ok(Self::Sha256(bytes))
            }
            len => Err(StorageError::InvalidObject(format!(
                "invalid object id length: {}",
                len
            ))),
        }
    }

    /// Returns the all-zero id for the given algorithm.
    pub fn null(algorithm: HashAlgorithm) -> Self {
        algorithm.null_id()
    }

    /// Returns true if every byte of the id is zero.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// The algorithm this id was produced by.
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(bytes) => bytes,
            Self::Sha256(bytes) => bytes,
        }
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Computes the hash of data with a git object header.
    pub fn hash_object(algorithm: HashAlgorithm, object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = algorithm.hasher();
        hasher.update(header.as_bytes());
        hasher.update(data);
        hasher.finalize_id()
    }
}

impl FromStr for ObjectId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used in git.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Unix-style mode, e.g. `0o100644` or `0o40000`.
    pub mode: u32,
    /// Path component.
    pub name: String,
    /// Id of the blob, tree or submodule commit.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Mode of a subdirectory.
    pub const MODE_TREE: u32 = 0o40000;
    /// Mode of a regular file.
    pub const MODE_BLOB: u32 = 0o100644;
    /// Mode of a submodule commit; never stored in this repository.
    pub const MODE_GITLINK: u32 = 0o160000;

    /// A regular-file entry.
    pub fn file(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            mode: Self::MODE_BLOB,
            name: name.into(),
            id,
        }
    }

    /// A subdirectory entry.
    pub fn dir(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            mode: Self::MODE_TREE,
            name: name.into(),
            id,
        }
    }
}

/// A git object (blob, tree, commit, or tag).
#[derive(Debug, Clone)]
pub struct GitObject {
    /// The object's unique identifier.
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed).
    pub data: Bytes,
}

impl GitObject {
    /// Creates a new SHA-1 git object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        Self::with_algorithm(HashAlgorithm::Sha1, object_type, data)
    }

    /// Creates a new git object named by the given algorithm.
    pub fn with_algorithm(
        algorithm: HashAlgorithm,
        object_type: ObjectType,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(algorithm, object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Creates a blob object from file content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a tree object. Entries are sorted by name; an empty tree is SHA-1.
    pub fn tree(entries: &[TreeEntry]) -> Self {
        let algorithm = entries
            .first()
            .map(|e| e.id.algorithm())
            .unwrap_or_default();
        let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut content = Vec::new();
        for entry in sorted {
            content.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
            content.extend_from_slice(entry.id.as_bytes());
        }
        Self::with_algorithm(algorithm, ObjectType::Tree, content)
    }

    /// Creates a commit object.
    pub fn commit(
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::with_algorithm(tree_id.algorithm(), ObjectType::Commit, content.into_bytes())
    }

    /// Creates an annotated tag object.
    pub fn tag(
        target: &ObjectId,
        target_type: ObjectType,
        name: &str,
        tagger: &str,
        message: &str,
    ) -> Self {
        let content = format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n{}",
            target,
            target_type.as_str(),
            name,
            tagger,
            message
        );
        Self::with_algorithm(target.algorithm(), ObjectType::Tag, content.into_bytes())
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Parses the entries of a tree object.
    pub fn tree_entries(&self) -> Result<Vec<TreeEntry>> {
        if self.object_type != ObjectType::Tree {
            return Err(StorageError::InvalidObject(format!(
                "{} is a {}, not a tree",
                self.id,
                self.object_type.as_str()
            )));
        }

        let id_len = self.id.algorithm().digest_len();
        let mut entries = Vec::new();
        let mut rest: &[u8] = &self.data;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| StorageError::InvalidObject("tree entry without mode".into()))?;
            let mode_str = std::str::from_utf8(&rest[..space])
                .map_err(|_| StorageError::InvalidObject("non-utf8 tree mode".into()))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| StorageError::InvalidObject(format!("bad tree mode: {}", mode_str)))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| StorageError::InvalidObject("tree entry without name".into()))?;
            let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
            rest = &rest[nul + 1..];

            if rest.len() < id_len {
                return Err(StorageError::InvalidObject("truncated tree entry".into()));
            }
            let id = ObjectId::from_slice(&rest[..id_len])?;
            rest = &rest[id_len..];

            entries.push(TreeEntry { mode, name, id });
        }
        Ok(entries)
    }

    /// Returns the ids this object points at: tree and parents of a commit,
    /// the entries of a tree (submodules excluded), the target of a tag.
    pub fn links(&self) -> Result<Vec<ObjectId>> {
        match self.object_type {
            ObjectType::Blob => Ok(Vec::new()),
            ObjectType::Tree => Ok(self
                .tree_entries()?
                .into_iter()
                .filter(|e| e.mode != TreeEntry::MODE_GITLINK)
                .map(|e| e.id)
                .collect()),
            ObjectType::Commit => self.header_ids(&["tree", "parent"]),
            ObjectType::Tag => self.header_ids(&["object"]),
        }
    }

    /// Returns the parents of a commit, or nothing for other types.
    pub fn parents(&self) -> Result<Vec<ObjectId>> {
        if self.object_type != ObjectType::Commit {
            return Ok(Vec::new());
        }
        self.header_ids(&["parent"])
    }

    /// Collects ids from header lines (`<key> <hex>`) up to the first blank line.
    fn header_ids(&self, keys: &[&str]) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for line in self.data.split(|&b| b == b'\n') {
            if line.is_empty() {
                break;
            }
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            if let Some((key, value)) = line.split_once(' ') {
                if keys.contains(&key) {
                    ids.push(ObjectId::from_hex(value)?);
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex() {
        let id = ObjectId::from_hex("a94a8fe5ccb19ba61c4c0873d391e987982fbbd3").unwrap();
        assert_eq!(id.to_hex(), "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
        assert_eq!(id.algorithm(), HashAlgorithm::Sha1);
    }

    #[test]
    fn test_object_id_sha256_hex() {
        let hex = "6".repeat(64);
        let id = ObjectId::from_hex(&hex).unwrap();
        assert_eq!(id.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(id.as_bytes().len(), 32);
    }

    #[test]
    fn test_object_id_invalid_length() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_slice(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_null_ids() {
        assert!(HashAlgorithm::Sha1.null_id().is_null());
        assert_eq!(HashAlgorithm::Sha256.null_id().to_hex(), "0".repeat(64));
        assert!(!ObjectId::from_bytes([1u8; 20]).is_null());
    }

    #[test]
    fn test_blob_hash() {
        // echo -n "test" | git hash-object --stdin
        let blob = GitObject::blob(b"test".to_vec());
        assert_eq!(blob.id.to_hex(), "30d74d258442c7c65512eafab474568dd706c430");
    }

    #[test]
    fn test_empty_tree_hash() {
        let tree = GitObject::tree(&[]);
        assert_eq!(tree.id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_tree_entries_roundtrip() {
        let a = GitObject::blob(b"a".to_vec());
        let b = GitObject::blob(b"b".to_vec());
        let tree = GitObject::tree(&[TreeEntry::file("b.txt", b.id), TreeEntry::file("a.txt", a.id)]);

        let entries = tree.tree_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].id, a.id);
        assert_eq!(entries[1].mode, TreeEntry::MODE_BLOB);
    }

    #[test]
    fn test_commit_links() {
        let tree = GitObject::tree(&[]);
        let parent = ObjectId::from_bytes([7u8; 20]);
        let commit = GitObject::commit(&tree.id, &[parent], "A <a@x> 0 +0000", "A <a@x> 0 +0000", "msg");

        let links = commit.links().unwrap();
        assert_eq!(links, vec![tree.id, parent]);
        assert_eq!(commit.parents().unwrap(), vec![parent]);
    }

    #[test]
    fn test_tag_links() {
        let target = ObjectId::from_bytes([3u8; 20]);
        let tag = GitObject::tag(&target, ObjectType::Commit, "v1", "T <t@x> 0 +0000", "release");
        assert_eq!(tag.links().unwrap(), vec![target]);
    }

    #[test]
    fn test_tree_links_skip_gitlinks() {
        let blob = GitObject::blob(b"x".to_vec());
        let submodule = ObjectId::from_bytes([9u8; 20]);
        let tree = GitObject::tree(&[
            TreeEntry::file("x", blob.id),
            TreeEntry {
                mode: TreeEntry::MODE_GITLINK,
                name: "vendor".into(),
                id: submodule,
            },
        ]);
        assert_eq!(tree.links().unwrap(), vec![blob.id]);
    }

    #[test]
    fn test_sha256_commit_inherits_algorithm() {
        let blob = GitObject::with_algorithm(HashAlgorithm::Sha256, ObjectType::Blob, b"x".to_vec());
        let tree = GitObject::tree(&[TreeEntry::file("x", blob.id)]);
        let commit = GitObject::commit(&tree.id, &[], "A <a@x> 0 +0000", "A <a@x> 0 +0000", "m");

        assert_eq!(tree.id.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(commit.id.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(tree.tree_entries().unwrap()[0].id, blob.id);
    }

    #[test]
    fn test_object_id_serde() {
        let id = ObjectId::from_bytes([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_hash_algorithm_parse() {
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
