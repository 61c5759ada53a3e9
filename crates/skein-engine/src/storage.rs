//! Chunk storage — three layers, queried cheapest-first.
//!
//!   1. Memory cache: byte-bounded LRU of recently touched ciphertext.
//!   2. Encrypted blob store: one immutable file per chunk under
//!      `{system_path}/blocks/{BASE32(ct_hash)}`. The authoritative layer
//!      for Download-tier nodes.
//!   3. Open storage: re-encrypt the recorded span of an assembled
//!      plaintext file under the chunk's pinned IV. Needs ReadOnly+.
//!
//! A blob file is immutable once written — if the name matches, the
//! content is correct. Writes go through a temp file and rename.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;
use data_encoding::BASE32_NOPAD;
use lru::LruCache;
use memmap2::Mmap;
use thiserror::Error;

use skein_core::crypto::{self, CtHash};
use skein_core::meta::Meta;
use skein_core::path::{PathError, PathNormalizer};
use skein_core::secret::{Secret, SecretError};

use crate::index::{Index, IndexError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such chunk")]
    NoSuchChunk,

    #[error("chunk bytes do not hash to their claimed identity")]
    ChunkMismatch,

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Layer 1: memory cache ─────────────────────────────────────────────────────

/// Opportunistic whole-chunk cache, evicting least-recently-used entries
/// once the byte budget is exceeded.
struct MemoryCache {
    entries: LruCache<CtHash, Bytes>,
    used: usize,
    budget: usize,
}

impl MemoryCache {
    fn new(budget: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            used: 0,
            budget,
        }
    }

    fn get(&mut self, ct_hash: &CtHash) -> Option<Bytes> {
        self.entries.get(ct_hash).cloned()
    }

    fn contains(&self, ct_hash: &CtHash) -> bool {
        self.entries.contains(ct_hash)
    }

    fn put(&mut self, ct_hash: CtHash, bytes: Bytes) {
        if bytes.len() > self.budget || self.entries.contains(&ct_hash) {
            return;
        }
        self.used += bytes.len();
        self.entries.put(ct_hash, bytes);
        while self.used > self.budget {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.used -= evicted.len(),
                None => break,
            }
        }
    }
}

// ── Layer 2: encrypted blob store ─────────────────────────────────────────────

struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, ct_hash: &CtHash) -> PathBuf {
        self.root.join(BASE32_NOPAD.encode(ct_hash))
    }

    fn have(&self, ct_hash: &CtHash) -> bool {
        self.blob_path(ct_hash).exists()
    }

    fn get(&self, ct_hash: &CtHash) -> Result<Option<Bytes>, StorageError> {
        let path = self.blob_path(ct_hash);
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path)?;
        // Safety: opened read-only and never mutated while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Atomic write: temp file, then rename. Re-putting an existing chunk
    /// is a no-op (immutability makes it idempotent).
    fn put(&self, ct_hash: &CtHash, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(ct_hash);
        if path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, ct_hash: &CtHash) -> Result<bool, StorageError> {
        let path = self.blob_path(ct_hash);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

// ── The three-layer facade ────────────────────────────────────────────────────

pub struct ChunkStorage {
    cache: MemoryCache,
    blobs: BlobStore,
    normalizer: PathNormalizer,
    secret: Secret,
}

impl ChunkStorage {
    pub fn new(
        system_path: &std::path::Path,
        secret: Secret,
        normalizer: PathNormalizer,
        cache_budget: u64,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            cache: MemoryCache::new(cache_budget as usize),
            blobs: BlobStore::new(system_path.join("blocks"))?,
            normalizer,
            secret,
        })
    }

    /// Is the chunk available from any layer?
    ///
    /// Open-storage presence means "an assembled openfs row exists"; the
    /// bytes are only verified when actually read.
    pub fn have(&self, index: &Index, ct_hash: &CtHash) -> bool {
        if self.cache.contains(ct_hash) || self.blobs.have(ct_hash) {
            return true;
        }
        index
            .openfs_sources(ct_hash)
            .map(|sources| !sources.is_empty())
            .unwrap_or(false)
    }

    /// Ciphertext for the wire: cache, blob store, then open storage.
    pub fn get_ciphertext(
        &mut self,
        index: &mut Index,
        ct_hash: &CtHash,
    ) -> Result<Bytes, StorageError> {
        if let Some(bytes) = self.cache.get(ct_hash) {
            return Ok(bytes);
        }
        if let Some(bytes) = self.blobs.get(ct_hash)? {
            self.cache.put(*ct_hash, bytes.clone());
            return Ok(bytes);
        }
        if let Some(bytes) = self.read_from_open_storage(index, ct_hash)? {
            self.cache.put(*ct_hash, bytes.clone());
            return Ok(bytes);
        }
        Err(StorageError::NoSuchChunk)
    }

    /// Plaintext for local use (assembly). Requires ReadOnly+.
    pub fn get_plaintext(
        &mut self,
        index: &mut Index,
        ct_hash: &CtHash,
    ) -> Result<Bytes, StorageError> {
        let (_, iv) = index
            .chunk_info(ct_hash)?
            .ok_or(StorageError::NoSuchChunk)?;
        let ciphertext = self.get_ciphertext(index, ct_hash)?;
        Ok(Bytes::from(self.secret.decrypt(&ciphertext, &iv)?))
    }

    /// Accept a chunk from the wire. The identity is verified before
    /// anything touches disk; a mismatch is the sender's problem.
    pub fn put_chunk(&mut self, ct_hash: &CtHash, bytes: &[u8]) -> Result<(), StorageError> {
        if crypto::ct_hash(bytes) != *ct_hash {
            return Err(StorageError::ChunkMismatch);
        }
        self.blobs.put(ct_hash, bytes)?;
        self.cache.put(*ct_hash, Bytes::copy_from_slice(bytes));
        Ok(())
    }

    /// One bit per chunk of the Meta, set iff any layer has it.
    pub fn make_bitfield(&self, index: &Index, meta: &Meta) -> Vec<bool> {
        meta.chunks
            .iter()
            .map(|chunk| self.have(index, &chunk.ct_hash))
            .collect()
    }

    /// Reclaim blob files whose chunks are reachable via open storage —
    /// once the plaintext file is assembled, the blob is redundant.
    pub fn cleanup(&mut self, index: &Index, meta: &Meta) -> Result<usize, StorageError> {
        let mut removed = 0;
        for chunk in &meta.chunks {
            let reachable = !index.openfs_sources(&chunk.ct_hash)?.is_empty();
            if reachable && self.blobs.remove(&chunk.ct_hash)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Reconstruct ciphertext from an assembled plaintext file. Each
    /// candidate row is verified against the chunk identity; rows that no
    /// longer match (the file changed underneath us) are invalidated and
    /// the next candidate is tried.
    fn read_from_open_storage(
        &mut self,
        index: &mut Index,
        ct_hash: &CtHash,
    ) -> Result<Option<Bytes>, StorageError> {
        // Download-tier nodes cannot re-encrypt plaintext.
        let Ok(key) = self.secret.symmetric_key() else {
            return Ok(None);
        };
        let key = *key;

        let Some((size, iv)) = index.chunk_info(ct_hash)? else {
            return Ok(None);
        };

        for (path_id, offset) in index.openfs_sources(ct_hash)? {
            let signed = match index.get_meta(&path_id) {
                Ok(signed) => signed,
                Err(IndexError::NoSuchMeta) => continue,
                Err(e) => return Err(e.into()),
            };
            let canonical = self.secret.decrypt(
                &signed.meta().encrypted_path,
                &signed.meta().encrypted_path_iv,
            )?;
            let abs = self.normalizer.absolutize(&canonical)?;

            let plaintext = match read_span(&abs, offset, size as usize) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(
                        path = %abs.display(),
                        offset,
                        error = %e,
                        "open storage read failed, trying next source"
                    );
                    continue;
                }
            };

            let ciphertext = crypto::encrypt(&key, &iv, &plaintext);
            if crypto::ct_hash(&ciphertext) == *ct_hash {
                return Ok(Some(Bytes::from(ciphertext)));
            }

            tracing::debug!(
                ct_hash = hex::encode(&ct_hash[..8]),
                path = %abs.display(),
                offset,
                "stale openfs row invalidated"
            );
            index.invalidate_openfs(ct_hash, &path_id, offset)?;
        }
        Ok(None)
    }
}

fn read_span(path: &std::path::Path, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
