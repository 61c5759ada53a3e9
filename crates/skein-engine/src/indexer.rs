//! The indexer — turns filesystem state into signed Metas.
//!
//! Per path: canonicalize, bail on ignores, short-circuit when mtime and
//! size match the stored record, otherwise chunk + encrypt and sign a new
//! revision. A full scan walks the tree and then sweeps the index for
//! paths that vanished, producing DELETED records.
//!
//! Indexing requires the ReadWrite tier — lower tiers never author.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use walkdir::WalkDir;

use skein_core::chunker::{Chunker, ChunkerError, ChunkerParams};
use skein_core::config::FolderParams;
use skein_core::crypto::{self, Iv, PtHmac, SymmetricKey};
use skein_core::meta::{ChunkRef, Meta, MetaKind, SignedMeta};
use skein_core::path::{self, PathError, PathNormalizer};
use skein_core::secret::{Secret, SecretError};

use crate::index::{iv_reuse_map, Index, IndexError};

#[derive(Debug, Error)]
pub enum IndexerError {
    /// The folder deactivated mid-file; nothing was committed for it.
    #[error("indexing interrupted")]
    Interrupted,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("indexing I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened for one path.
#[derive(Debug)]
pub enum IndexOutcome {
    /// Stored record still describes the path.
    Unchanged,
    /// Nothing to record (ignored, unsupported type, redundant delete…).
    Suppressed,
    /// A new revision was signed and stored.
    Indexed(SignedMeta),
}

pub struct Indexer {
    params: FolderParams,
    normalizer: PathNormalizer,
    secret: Secret,
    chunker_params: ChunkerParams,
    /// Cleared to interrupt indexing at the next chunk boundary.
    active: Arc<AtomicBool>,
}

impl Indexer {
    pub fn new(params: FolderParams, secret: Secret, active: Arc<AtomicBool>) -> Self {
        let normalizer = PathNormalizer::new(
            params.path.clone(),
            params.normalize_unicode,
            params.lowercase_paths,
        );
        Self {
            params,
            normalizer,
            secret,
            chunker_params: ChunkerParams::default(),
            active,
        }
    }

    /// Override the chunking parameters used for paths with no prior Meta.
    pub fn with_chunker(mut self, chunker_params: ChunkerParams) -> Self {
        self.chunker_params = chunker_params;
        self
    }

    pub fn normalizer(&self) -> &PathNormalizer {
        &self.normalizer
    }

    /// Index a single absolute path. Commits the new record (if any) into
    /// the index with its openfs rows marked assembled — the plaintext we
    /// just read IS the file on disk.
    pub fn index_path(
        &self,
        index: &mut Index,
        abspath: &Path,
    ) -> Result<IndexOutcome, IndexerError> {
        if !self.active.load(Ordering::Relaxed) {
            return Err(IndexerError::Interrupted);
        }

        let canonical = self.normalizer.normalize(abspath)?;
        if canonical.is_empty() || self.params.is_ignored(&canonical) {
            return Ok(IndexOutcome::Suppressed);
        }
        let key = *self.secret.symmetric_key()?;
        let path_id = path::path_id(&key, &canonical);

        let old = match index.get_meta(&path_id) {
            Ok(signed) => Some(signed),
            Err(IndexError::NoSuchMeta) => None,
            Err(e) => return Err(e.into()),
        };

        let stat = if self.params.preserve_symlinks {
            fs::symlink_metadata(abspath)
        } else {
            fs::metadata(abspath)
        };
        let stat = match stat {
            Ok(stat) => Some(stat),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let kind = match &stat {
            None => MetaKind::Deleted,
            Some(st) if st.file_type().is_symlink() => MetaKind::Symlink,
            Some(st) if st.is_dir() => MetaKind::Directory,
            Some(st) if st.is_file() => MetaKind::File,
            // Sockets, fifos, devices — not synchronizable.
            Some(_) => return Ok(IndexOutcome::Suppressed),
        };

        // Redundant deletes never produce a record.
        if kind == MetaKind::Deleted {
            match &old {
                None => return Ok(IndexOutcome::Suppressed),
                Some(prior) if prior.meta().kind == MetaKind::Deleted => {
                    return Ok(IndexOutcome::Suppressed)
                }
                _ => {}
            }
        }

        let (mode, uid, gid) = match (&stat, self.params.preserve_unix_attrib) {
            (Some(st), true) => unix_attribs(st),
            _ => (0, 0, 0),
        };
        let mtime = stat.as_ref().map(mtime_secs).unwrap_or(0);

        if let Some(prior) = &old {
            let prior_meta = prior.meta();
            // Same mtime and size: the content is taken as unchanged.
            if kind == MetaKind::File
                && prior_meta.kind == MetaKind::File
                && prior_meta.mtime == mtime
                && prior_meta.size() == stat.as_ref().map(|s| s.len()).unwrap_or(0)
            {
                return Ok(IndexOutcome::Unchanged);
            }
            // A directory that only got re-stat'd carries no new information.
            if kind == MetaKind::Directory
                && prior_meta.kind == MetaKind::Directory
                && (prior_meta.mode, prior_meta.uid, prior_meta.gid) == (mode, uid, gid)
            {
                return Ok(IndexOutcome::Unchanged);
            }
        }

        let mut meta = Meta::new(path_id, kind, next_revision(old.as_ref()));
        meta.mtime = mtime;
        meta.mode = mode;
        meta.uid = uid;
        meta.gid = gid;
        let (encrypted_path, path_iv) = path::encrypt_path(&self.secret, &canonical)?;
        meta.encrypted_path = encrypted_path;
        meta.encrypted_path_iv = path_iv;

        match kind {
            MetaKind::File => {
                // Keep the author's chunking so unchanged spans line up,
                // and the pinned IVs so unchanged chunks stay bit-stable.
                let chunker_params = old
                    .as_ref()
                    .and_then(|o| o.meta().chunker)
                    .unwrap_or(self.chunker_params);
                let iv_map = iv_reuse_map(index, &path_id)?;
                meta.chunker = Some(chunker_params);
                meta.chunks = self.chunk_file(abspath, chunker_params, &key, &iv_map)?;
            }
            MetaKind::Symlink => {
                let target = fs::read_link(abspath)?;
                let target = target
                    .to_str()
                    .ok_or_else(|| PathError::NonUtf8(target.clone()))?
                    .as_bytes()
                    .to_vec();
                let iv = crypto::random_iv();
                meta.encrypted_target = self.secret.encrypt(&target, &iv)?;
                meta.encrypted_target_iv = iv;
            }
            MetaKind::Directory | MetaKind::Deleted => {}
        }

        let signed = SignedMeta::sign(meta, &self.secret)?;
        index.put_meta(&signed, true)?;
        tracing::debug!(
            path_id = hex::encode(&path_id[..8]),
            kind = ?kind,
            revision = signed.revision(),
            "indexed"
        );
        Ok(IndexOutcome::Indexed(signed))
    }

    /// Full pass: walk the tree, then sweep the index for vanished paths.
    /// Returns every new record for the folder to gossip.
    pub fn scan(&self, index: &mut Index) -> Result<Vec<SignedMeta>, IndexerError> {
        let mut produced = Vec::new();
        let system_path = self.params.system_path();

        let walker = WalkDir::new(self.normalizer.root())
            .follow_links(!self.params.preserve_symlinks)
            .min_depth(1);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "scan entry skipped");
                    continue;
                }
            };
            if entry.path().starts_with(&system_path) {
                continue;
            }
            match self.index_path(index, entry.path()) {
                Ok(IndexOutcome::Indexed(signed)) => produced.push(signed),
                Ok(_) => {}
                Err(IndexerError::Interrupted) => return Err(IndexerError::Interrupted),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "index failed");
                }
            }
        }

        // Anything still recorded but gone from disk becomes DELETED.
        for signed in index.all_metas()? {
            if signed.meta().kind == MetaKind::Deleted {
                continue;
            }
            let meta = signed.meta();
            let canonical = match self
                .secret
                .decrypt(&meta.encrypted_path, &meta.encrypted_path_iv)
            {
                Ok(canonical) => canonical,
                Err(e) => {
                    tracing::warn!(error = %e, "undecryptable path in own index");
                    continue;
                }
            };
            let abspath = self.normalizer.absolutize(&canonical)?;
            if fs::symlink_metadata(&abspath).is_ok() {
                continue;
            }
            match self.index_path(index, &abspath) {
                Ok(IndexOutcome::Indexed(signed)) => produced.push(signed),
                Ok(_) => {}
                Err(IndexerError::Interrupted) => return Err(IndexerError::Interrupted),
                Err(e) => {
                    tracing::warn!(path = %abspath.display(), error = %e, "delete pass failed");
                }
            }
        }
        Ok(produced)
    }

    fn chunk_file(
        &self,
        abspath: &Path,
        chunker_params: ChunkerParams,
        key: &SymmetricKey,
        iv_map: &HashMap<PtHmac, Iv>,
    ) -> Result<Vec<ChunkRef>, IndexerError> {
        let mut chunker = Chunker::new(chunker_params)?;
        let mut reader = BufReader::with_capacity(64 * 1024, fs::File::open(abspath)?);
        let mut chunks = Vec::new();
        let mut current = Vec::with_capacity(chunker_params.min_chunksize as usize);
        let mut buf = [0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                current.push(byte);
                if chunker.push(byte) {
                    if !self.active.load(Ordering::Relaxed) {
                        return Err(IndexerError::Interrupted);
                    }
                    chunks.push(seal_chunk(key, &mut current, iv_map));
                }
            }
        }
        if !current.is_empty() {
            chunks.push(seal_chunk(key, &mut current, iv_map));
        }
        Ok(chunks)
    }
}

/// Encrypt one finished chunk, reusing the prior IV when the content
/// already appeared in this path's previous revision.
fn seal_chunk(
    key: &SymmetricKey,
    plaintext: &mut Vec<u8>,
    iv_map: &HashMap<PtHmac, Iv>,
) -> ChunkRef {
    let pt_hmac = crypto::keyed_hash(key, plaintext);
    let iv = iv_map
        .get(&pt_hmac)
        .copied()
        .unwrap_or_else(crypto::random_iv);
    let ciphertext = crypto::encrypt(key, &iv, plaintext);
    let chunk = ChunkRef {
        pt_hmac,
        iv,
        size: plaintext.len() as u32,
        ct_hash: crypto::ct_hash(&ciphertext),
    };
    plaintext.clear();
    chunk
}

fn mtime_secs(stat: &fs::Metadata) -> i64 {
    stat.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn next_revision(old: Option<&SignedMeta>) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    // A second edit within the same wall-clock second still needs to
    // supersede the record it replaces.
    match old {
        Some(prior) => now.max(prior.revision() + 1),
        None => now,
    }
}

#[cfg(unix)]
fn unix_attribs(stat: &fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (stat.mode(), stat.uid(), stat.gid())
}

#[cfg(not(unix))]
fn unix_attribs(_stat: &fs::Metadata) -> (u32, u32, u32) {
    (0, 0, 0)
}
