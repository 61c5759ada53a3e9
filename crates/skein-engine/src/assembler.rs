//! The assembler — materializes plaintext once every chunk is local.
//!
//! Runs off `meta_added`/`chunk_added` triggers. A FILE meta whose chunks
//! are all present is decrypted and written to its real path (prior
//! content archived per strategy); DIRECTORY makes the directory, SYMLINK
//! links, DELETED removes. Assembly is idempotent — a byte-identical file
//! already in place is left untouched — and failures leave the record
//! unassembled so the next trigger retries.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;

use skein_core::config::{ArchiveStrategy, FolderParams};
use skein_core::meta::{Meta, MetaKind, SignedMeta};
use skein_core::path::{PathError, PathNormalizer};
use skein_core::secret::{Secret, SecretError};

use crate::archive::Archive;
use crate::index::{Index, IndexError};
use crate::storage::{ChunkStorage, StorageError};

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("assembly I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// The record's on-disk state now matches the meta.
    Assembled,
    /// Chunks are still missing; try again on the next `chunk_added`.
    Pending,
}

pub struct Assembler {
    normalizer: PathNormalizer,
    secret: Secret,
    archive: Archive,
    preserve_unix_attrib: bool,
}

impl Assembler {
    pub fn new(params: &FolderParams, secret: Secret) -> Self {
        Self {
            normalizer: PathNormalizer::new(
                params.path.clone(),
                params.normalize_unicode,
                params.lowercase_paths,
            ),
            secret,
            archive: Archive::new(params),
            preserve_unix_attrib: params.preserve_unix_attrib,
        }
    }

    /// Try to apply one record to disk.
    pub fn assemble(
        &self,
        index: &mut Index,
        storage: &mut ChunkStorage,
        signed: &SignedMeta,
    ) -> Result<AssembleOutcome, AssemblerError> {
        if index.is_assembled(&signed.path_id())? {
            return Ok(AssembleOutcome::Assembled);
        }
        let meta = signed.meta();
        let dest = self.dest_path(meta)?;

        let outcome = match meta.kind {
            MetaKind::File => self.assemble_file(index, storage, meta, &dest)?,
            MetaKind::Directory => {
                fs::create_dir_all(&dest)?;
                self.apply_attribs(&dest, meta);
                AssembleOutcome::Assembled
            }
            MetaKind::Symlink => {
                self.assemble_symlink(meta, &dest)?;
                AssembleOutcome::Assembled
            }
            MetaKind::Deleted => {
                self.archive.dispose(&dest)?;
                AssembleOutcome::Assembled
            }
        };

        if outcome == AssembleOutcome::Assembled {
            index.mark_assembled(&meta.path_id, true)?;
            // Once the plaintext is the source of truth, the blobs are
            // redundant — except under the block strategy, which keeps
            // ciphertext history around.
            if meta.kind == MetaKind::File && self.archive.strategy() != ArchiveStrategy::Block {
                storage.cleanup(index, meta)?;
            }
            tracing::debug!(
                path = %dest.display(),
                kind = ?meta.kind,
                revision = meta.revision,
                "assembled"
            );
        }
        Ok(outcome)
    }

    fn dest_path(&self, meta: &Meta) -> Result<PathBuf, AssemblerError> {
        let canonical = self
            .secret
            .decrypt(&meta.encrypted_path, &meta.encrypted_path_iv)?;
        Ok(self.normalizer.absolutize(&canonical)?)
    }

    fn assemble_file(
        &self,
        index: &mut Index,
        storage: &mut ChunkStorage,
        meta: &Meta,
        dest: &Path,
    ) -> Result<AssembleOutcome, AssemblerError> {
        if storage
            .make_bitfield(index, meta)
            .iter()
            .any(|present| !present)
        {
            return Ok(AssembleOutcome::Pending);
        }

        let mut plaintext = Vec::with_capacity(meta.size() as usize);
        for chunk in &meta.chunks {
            plaintext.extend_from_slice(&storage.get_plaintext(index, &chunk.ct_hash)?);
        }

        let identical = fs::metadata(dest)
            .map(|st| st.is_file() && st.len() == plaintext.len() as u64)
            .unwrap_or(false)
            && fs::read(dest).map(|old| old == plaintext).unwrap_or(false);

        if !identical {
            self.archive.dispose(dest)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = tmp_sibling(dest);
            {
                let mut file = fs::File::create(&tmp)?;
                file.write_all(&plaintext)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, dest)?;
        }
        self.apply_attribs(dest, meta);
        Ok(AssembleOutcome::Assembled)
    }

    fn assemble_symlink(&self, meta: &Meta, dest: &Path) -> Result<(), AssemblerError> {
        let target_bytes = self
            .secret
            .decrypt(&meta.encrypted_target, &meta.encrypted_target_iv)?;
        let target = PathBuf::from(String::from_utf8_lossy(&target_bytes).into_owned());

        if fs::read_link(dest).map(|t| t == target).unwrap_or(false) {
            return Ok(());
        }
        self.archive.dispose(dest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dest)?;
        #[cfg(not(unix))]
        {
            let _ = target;
            return Err(AssemblerError::Io(std::io::Error::other(
                "symlinks unsupported on this platform",
            )));
        }
        Ok(())
    }

    /// Attribute application is best-effort: a chown without privilege or
    /// an mtime set on a read-only filesystem must not fail the assembly.
    fn apply_attribs(&self, dest: &Path, meta: &Meta) {
        #[cfg(unix)]
        if self.preserve_unix_attrib && meta.mode != 0 {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                fs::set_permissions(dest, fs::Permissions::from_mode(meta.mode & 0o7777))
            {
                tracing::trace!(path = %dest.display(), error = %e, "chmod skipped");
            }
            if let Err(e) = std::os::unix::fs::chown(dest, Some(meta.uid), Some(meta.gid)) {
                tracing::trace!(path = %dest.display(), error = %e, "chown skipped");
            }
        }
        if meta.mtime != 0 {
            if let Err(e) =
                filetime::set_file_mtime(dest, FileTime::from_unix_time(meta.mtime, 0))
            {
                tracing::trace!(path = %dest.display(), error = %e, "mtime skipped");
            }
        }
    }
}

fn tmp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("assembly");
    dest.with_file_name(format!(".{name}.part"))
}
