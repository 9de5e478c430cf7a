//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format

use crate::delta::apply_delta;
use crate::traits::{PackCodec, Repository};
use crate::{GitObject, HashAlgorithm, Hasher, ObjectId, ObjectType, Result, StorageError};
use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we write.
const PACK_VERSION: u32 = 2;
/// Entry type of a delta against an earlier entry of the same pack.
const OFS_DELTA: u8 = 6;
/// Entry type of a delta against an object named by id.
const REF_DELTA: u8 = 7;
/// Largest inflated entry accepted.
pub(crate) const MAX_ENTRY_SIZE: usize = 1 << 30;
/// Cap on buffers sized from header fields before any data backs them.
pub(crate) const PREALLOC_LIMIT: usize = 1 << 16;

fn corrupt(msg: impl Into<String>) -> StorageError {
    StorageError::CorruptPack(msg.into())
}

fn read_error(e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        corrupt("unexpected end of pack")
    } else {
        StorageError::Io(e)
    }
}

/// Builds a pack file from a set of objects.
pub struct PackBuilder {
    algorithm: HashAlgorithm,
    objects: Vec<GitObject>,
}

impl PackBuilder {
    /// Creates a new SHA-1 pack builder.
    pub fn new() -> Self {
        Self::with_algorithm(HashAlgorithm::Sha1)
    }

    /// Creates a pack builder whose trailer uses the given hash function.
    pub fn with_algorithm(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            objects: Vec::new(),
        }
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Adds an object from a repository by ID.
    pub fn add_from_store(&mut self, repo: &dyn Repository, id: &ObjectId) -> Result<()> {
        let object = repo
            .read_object(id)?
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))?;
        self.objects.push(object);
        Ok(())
    }

    /// Number of objects added so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects were added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file in memory.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();
        self.write_to(&mut pack)?;
        Ok(pack)
    }

    /// Streams the pack file to `out`, returning the number of objects written.
    pub fn write_to(self, out: &mut dyn Write) -> Result<u32> {
        let count = u32::try_from(self.objects.len())
            .map_err(|_| StorageError::InvalidObject("too many objects for one pack".into()))?;
        let mut writer = HashingWriter {
            inner: out,
            hasher: self.algorithm.hasher(),
        };

        // Write header
        writer.write_all(PACK_SIGNATURE)?;
        writer.write_all(&PACK_VERSION.to_be_bytes())?;
        writer.write_all(&count.to_be_bytes())?;

        // Write objects
        for object in &self.objects {
            Self::write_object(&mut writer, object)?;
        }

        // Append checksum
        let checksum = writer.hasher.finalize();
        writer.inner.write_all(&checksum)?;
        Ok(count)
    }

    /// Writes a single object entry.
    fn write_object(pack: &mut dyn Write, object: &GitObject) -> Result<()> {
        let obj_type = object.object_type.pack_type();
        let size = object.data.len();

        // First byte: (MSB=more bytes) (3 bits type) (4 bits size)
        let mut header = Vec::with_capacity(10);
        let mut first_byte = (obj_type << 4) | ((size & 0x0F) as u8);
        let mut remaining_size = size >> 4;
        if remaining_size > 0 {
            first_byte |= 0x80;
        }
        header.push(first_byte);

        // Additional size bytes (7 bits each, MSB=continue)
        while remaining_size > 0 {
            let mut byte = (remaining_size & 0x7F) as u8;
            remaining_size >>= 7;
            if remaining_size > 0 {
                byte |= 0x80;
            }
            header.push(byte);
        }
        pack.write_all(&header)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&object.data)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        pack.write_all(&compressed)?;

        Ok(())
    }
}

impl Default for PackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct HashingWriter<'a> {
    inner: &'a mut dyn Write,
    hasher: Hasher,
}

impl Write for HashingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hashes and counts every byte consumed from the wrapped reader.
struct TrackingReader<'a> {
    inner: &'a mut dyn BufRead,
    hasher: Hasher,
    consumed: u64,
}

impl Read for TrackingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.inner.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for TrackingReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        // The buffer is already filled, so this does no I/O.
        if let Ok(buf) = self.inner.fill_buf() {
            let n = amt.min(buf.len());
            self.hasher.update(&buf[..n]);
        }
        self.inner.consume(amt);
        self.consumed += amt as u64;
    }
}

/// Parses a pack stream and extracts objects.
///
/// Reads exactly one pack from the input and nothing beyond its trailer.
/// Objects are handed to the repository only after the trailer checksum
/// has been verified.
pub struct PackParser<'a> {
    input: TrackingReader<'a>,
    algorithm: HashAlgorithm,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser over a buffered stream.
    pub fn new(input: &'a mut dyn BufRead, algorithm: HashAlgorithm) -> Self {
        Self {
            input: TrackingReader {
                inner: input,
                hasher: algorithm.hasher(),
                consumed: 0,
            },
            algorithm,
        }
    }

    /// Parses the pack and stores its objects in `repo`.
    pub fn parse(&mut self, repo: &dyn Repository) -> Result<Vec<ObjectId>> {
        let mut header = [0u8; 12];
        self.input.read_exact(&mut header).map_err(read_error)?;
        if &header[0..4] != PACK_SIGNATURE {
            return Err(corrupt("invalid signature"));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(corrupt(format!("unsupported version: {}", version)));
        }
        let object_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        let mut resolved: HashMap<ObjectId, GitObject> = HashMap::new();
        let mut order = Vec::with_capacity((object_count as usize).min(1024));
        let mut by_offset: HashMap<u64, ObjectId> = HashMap::new();
        let mut pending: Vec<(ObjectId, Vec<u8>, u64)> = Vec::new();

        for _ in 0..object_count {
            let offset = self.input.consumed;
            let (type_code, size) = self.read_entry_header()?;

            match type_code {
                1..=4 => {
                    let object_type = ObjectType::from_pack_type(type_code)?;
                    let data = self.inflate(size)?;
                    let object = GitObject::with_algorithm(self.algorithm, object_type, data);
                    by_offset.insert(offset, object.id);
                    order.push(object.id);
                    resolved.insert(object.id, object);
                }
                OFS_DELTA => {
                    let distance = self.read_ofs_distance()?;
                    let base_offset = offset
                        .checked_sub(distance)
                        .ok_or_else(|| corrupt("delta base before start of pack"))?;
                    let delta = self.inflate(size)?;
                    let base_id = by_offset
                        .get(&base_offset)
                        .copied()
                        .ok_or_else(|| corrupt(format!("no entry at offset {}", base_offset)))?;
                    let object = Self::resolve_delta(repo, &resolved, &base_id, &delta)?
                        .ok_or_else(|| corrupt("unresolvable offset delta"))?;
                    by_offset.insert(offset, object.id);
                    order.push(object.id);
                    resolved.insert(object.id, object);
                }
                REF_DELTA => {
                    let mut raw = vec![0u8; self.algorithm.digest_len()];
                    self.input.read_exact(&mut raw).map_err(read_error)?;
                    let base_id = ObjectId::from_slice(&raw)?;
                    let delta = self.inflate(size)?;
                    match Self::resolve_delta(repo, &resolved, &base_id, &delta)? {
                        Some(object) => {
                            by_offset.insert(offset, object.id);
                            order.push(object.id);
                            resolved.insert(object.id, object);
                        }
                        None => pending.push((base_id, delta, offset)),
                    }
                }
                other => return Err(corrupt(format!("unknown entry type: {}", other))),
            }
        }

        // Ref deltas may name bases that appear later in the pack.
        while !pending.is_empty() {
            let before = pending.len();
            let mut still_pending = Vec::new();
            for (base_id, delta, offset) in pending {
                match Self::resolve_delta(repo, &resolved, &base_id, &delta)? {
                    Some(object) => {
                        by_offset.insert(offset, object.id);
                        order.push(object.id);
                        resolved.insert(object.id, object);
                    }
                    None => still_pending.push((base_id, delta, offset)),
                }
            }
            if still_pending.len() == before {
                return Err(corrupt(format!(
                    "missing delta base {}",
                    still_pending[0].0
                )));
            }
            pending = still_pending;
        }

        self.verify_trailer()?;

        for id in &order {
            if let Some(object) = resolved.remove(id) {
                repo.write_object(object)?;
            }
        }
        tracing::debug!(objects = order.len(), "ingested pack");
        Ok(order)
    }

    fn resolve_delta(
        repo: &dyn Repository,
        resolved: &HashMap<ObjectId, GitObject>,
        base_id: &ObjectId,
        delta: &[u8],
    ) -> Result<Option<GitObject>> {
        let base = match resolved.get(base_id) {
            Some(base) => base.clone(),
            None => match repo.read_object(base_id)? {
                Some(base) => base,
                None => return Ok(None),
            },
        };
        let data = apply_delta(&base.data, delta)?;
        Ok(Some(GitObject::with_algorithm(
            base.id.algorithm(),
            base.object_type,
            data,
        )))
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.input.read_exact(&mut byte).map_err(read_error)?;
        Ok(byte[0])
    }

    fn read_entry_header(&mut self) -> Result<(u8, usize)> {
        let first_byte = self.read_byte()?;
        let type_code = (first_byte >> 4) & 0x07;
        let mut size = (first_byte & 0x0F) as usize;
        let mut shift = 4u32;
        let mut byte = first_byte;
        while byte & 0x80 != 0 {
            byte = self.read_byte()?;
            if shift >= usize::BITS - 7 {
                return Err(corrupt("entry size overflow"));
            }
            size |= ((byte & 0x7F) as usize) << shift;
            shift += 7;
        }
        if size > MAX_ENTRY_SIZE {
            return Err(corrupt(format!("entry too large: {} bytes", size)));
        }
        Ok((type_code, size))
    }

    fn read_ofs_distance(&mut self) -> Result<u64> {
        let mut byte = self.read_byte()?;
        let mut distance = (byte & 0x7F) as u64;
        while byte & 0x80 != 0 {
            if distance > (u64::MAX >> 7) - 1 {
                return Err(corrupt("offset overflow"));
            }
            byte = self.read_byte()?;
            distance = ((distance + 1) << 7) | (byte & 0x7F) as u64;
        }
        Ok(distance)
    }

    fn inflate(&mut self, size: usize) -> Result<Vec<u8>> {
        let decoder = ZlibDecoder::new(&mut self.input);
        let mut data = Vec::with_capacity(size.min(PREALLOC_LIMIT));
        decoder
            .take(size as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|e| corrupt(format!("decompression failed: {}", e)))?;
        if data.len() != size {
            return Err(corrupt(format!(
                "entry inflated to {} bytes, header says {}",
                data.len(),
                size
            )));
        }
        Ok(data)
    }

    fn verify_trailer(&mut self) -> Result<()> {
        let computed = self.input.hasher.clone().finalize();
        let mut trailer = vec![0u8; self.algorithm.digest_len()];
        self.input
            .inner
            .read_exact(&mut trailer)
            .map_err(read_error)?;
        if computed != trailer {
            return Err(corrupt("checksum mismatch"));
        }
        Ok(())
    }
}

/// Pack codec writing undeltified packs and reading deltified ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicPackCodec;

impl PackCodec for BasicPackCodec {
    fn generate_pack(
        &self,
        repo: &dyn Repository,
        objects: &[ObjectId],
        out: &mut dyn Write,
    ) -> Result<u32> {
        let mut builder = PackBuilder::with_algorithm(repo.hash_algorithm());
        for id in objects {
            builder.add_from_store(repo, id)?;
        }
        builder.write_to(out)
    }

    fn ingest_pack(&self, repo: &dyn Repository, input: &mut dyn BufRead) -> Result<Vec<ObjectId>> {
        PackParser::new(input, repo.hash_algorithm()).parse(repo)
    }
}
