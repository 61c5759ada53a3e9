//! The metadata index — one SQLite database per folder.
//!
//! Three tables mirror the data model: `meta` (one row per path, always the
//! highest accepted revision), `chunk` (the catalog of referenced chunks)
//! and `openfs` (which chunk lives at which offset of which file — the map
//! open storage reconstructs ciphertext from).
//!
//! All mutations go through the owning folder actor, so there is a single
//! writer; multi-statement operations are bracketed by savepoints and roll
//! back wholesale on failure.

use std::path::Path;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

use bytes::Bytes;
use skein_core::crypto::{CtHash, Iv};
use skein_core::meta::{MetaError, MetaKind, SignedMeta};
use skein_core::path::PathId;
use skein_core::secret::Secret;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no such meta")]
    NoSuchMeta,

    #[error("incoming revision {incoming} does not supersede stored {stored}")]
    RevisionRegress { stored: i64, incoming: i64 },

    #[error("database corrupted: {0}")]
    Corrupted(rusqlite::Error),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("database error: {0}")]
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::DatabaseCorrupt
                    || failure.code == ErrorCode::NotADatabase =>
            {
                IndexError::Corrupted(e)
            }
            _ => IndexError::Db(e),
        }
    }
}

/// What `put_meta` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New record accepted (first revision or superseding one).
    Inserted,
    /// Byte-identical record already stored — idempotent no-op.
    Identical,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStatus {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub deleted: u64,
}

impl IndexStatus {
    pub fn total(&self) -> u64 {
        self.files + self.directories + self.symlinks + self.deleted
    }
}

pub struct Index {
    conn: Connection,
    secret: Secret,
}

impl Index {
    pub fn open(db_path: &Path, secret: Secret) -> Result<Self, IndexError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, secret)
    }

    pub fn open_in_memory(secret: Secret) -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, secret)
    }

    fn init(conn: Connection, secret: Secret) -> Result<Self, IndexError> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                path_id    BLOB PRIMARY KEY NOT NULL,
                revision   INTEGER NOT NULL,
                meta_bytes BLOB NOT NULL,
                signature  BLOB NOT NULL,
                kind       INTEGER NOT NULL,
                assembled  INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS chunk (
                ct_hash BLOB PRIMARY KEY NOT NULL,
                size    INTEGER NOT NULL,
                iv      BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS openfs (
                ct_hash   BLOB NOT NULL REFERENCES chunk (ct_hash) ON DELETE CASCADE,
                path_id   BLOB NOT NULL REFERENCES meta (path_id) ON DELETE CASCADE,
                "offset"  INTEGER NOT NULL,
                assembled INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS openfs_ct   ON openfs (ct_hash);
            CREATE INDEX IF NOT EXISTS openfs_path ON openfs (path_id);
            "#,
        )?;
        Ok(Self { conn, secret })
    }

    /// Accept a signed record. The caller decides what to do with the
    /// outcome (gossip, assembly); the index only guards the invariants:
    /// valid signature, monotone revision, consistent chunk/openfs rows.
    ///
    /// `fully_assembled` is set by the local indexer: the plaintext it just
    /// chunked IS the file on disk, so its openfs rows are born valid.
    /// Records from peers arrive with `false` and flip when assembled.
    pub fn put_meta(
        &mut self,
        signed: &SignedMeta,
        fully_assembled: bool,
    ) -> Result<PutOutcome, IndexError> {
        self.secret
            .verify(signed.raw(), signed.signature())
            .map_err(|_| MetaError::InvalidSignature)?;

        let path_id = signed.path_id();
        if let Some(stored) = self.lookup(&path_id)? {
            if stored.raw() == signed.raw() {
                return Ok(PutOutcome::Identical);
            }
            if !signed.supersedes(&stored) {
                return Err(IndexError::RevisionRegress {
                    stored: stored.revision(),
                    incoming: signed.revision(),
                });
            }
        }

        let meta = signed.meta();
        let assembled = fully_assembled as i64;
        let sp = self.conn.savepoint()?;
        sp.execute(
            "INSERT OR REPLACE INTO meta (path_id, revision, meta_bytes, signature, kind, assembled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                path_id.as_slice(),
                meta.revision,
                signed.raw().as_ref(),
                signed.signature().as_slice(),
                meta.kind.as_i64(),
                assembled,
            ],
        )?;
        // Replacing the meta row leaves stale openfs rows behind (REPLACE
        // deletes + reinserts the parent, cascading), but be explicit: the
        // new chunk layout fully supersedes the old one.
        sp.execute(
            "DELETE FROM openfs WHERE path_id = ?1",
            params![path_id.as_slice()],
        )?;
        let mut offset = 0u64;
        for chunk in &meta.chunks {
            sp.execute(
                "INSERT OR IGNORE INTO chunk (ct_hash, size, iv) VALUES (?1, ?2, ?3)",
                params![chunk.ct_hash.as_slice(), chunk.size, chunk.iv.as_slice()],
            )?;
            sp.execute(
                "INSERT INTO openfs (ct_hash, path_id, \"offset\", assembled)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    chunk.ct_hash.as_slice(),
                    path_id.as_slice(),
                    offset as i64,
                    assembled,
                ],
            )?;
            offset += chunk.size as u64;
        }
        sp.commit()?;
        Ok(PutOutcome::Inserted)
    }

    fn lookup(&self, path_id: &PathId) -> Result<Option<SignedMeta>, IndexError> {
        let row: Option<(Vec<u8>, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT meta_bytes, signature FROM meta WHERE path_id = ?1",
                params![path_id.as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((bytes, sig)) => Ok(Some(self.reconstruct(bytes, sig)?)),
        }
    }

    fn reconstruct(&self, bytes: Vec<u8>, sig: Vec<u8>) -> Result<SignedMeta, IndexError> {
        let signature: [u8; 64] = sig
            .as_slice()
            .try_into()
            .map_err(|_| MetaError::BadField("signature"))?;
        Ok(SignedMeta::from_parts(
            Bytes::from(bytes),
            signature,
            &self.secret,
        )?)
    }

    pub fn get_meta(&self, path_id: &PathId) -> Result<SignedMeta, IndexError> {
        self.lookup(path_id)?.ok_or(IndexError::NoSuchMeta)
    }

    /// Exact-revision lookup, for serving MetaRequests: a peer asking for a
    /// revision we no longer hold gets `NoSuchMeta`, never different bytes.
    pub fn get_meta_at(&self, path_id: &PathId, revision: i64) -> Result<SignedMeta, IndexError> {
        let signed = self.get_meta(path_id)?;
        if signed.revision() != revision {
            return Err(IndexError::NoSuchMeta);
        }
        Ok(signed)
    }

    /// Pre-check before downloading an announced meta.
    pub fn put_allowed(&self, path_id: &PathId, revision: i64) -> Result<bool, IndexError> {
        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT revision FROM meta WHERE path_id = ?1",
                params![path_id.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        // Equal revisions stay eligible: the byte tie-break in put_meta
        // decides once the record arrives.
        Ok(stored.map(|s| s <= revision).unwrap_or(true))
    }

    /// Every stored meta referencing a chunk — the fan-out set when that
    /// chunk arrives.
    pub fn containing_chunk(&self, ct_hash: &CtHash) -> Result<Vec<SignedMeta>, IndexError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT m.meta_bytes, m.signature
             FROM meta m JOIN openfs o ON o.path_id = m.path_id
             WHERE o.ct_hash = ?1",
        )?;
        let rows = stmt.query_map(params![ct_hash.as_slice()], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut metas = Vec::new();
        for row in rows {
            let (bytes, sig) = row?;
            metas.push(self.reconstruct(bytes, sig)?);
        }
        Ok(metas)
    }

    /// Catalog row for a chunk: plaintext size and pinned IV.
    pub fn chunk_info(&self, ct_hash: &CtHash) -> Result<Option<(u32, Iv)>, IndexError> {
        let row: Option<(u32, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT size, iv FROM chunk WHERE ct_hash = ?1",
                params![ct_hash.as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((size, iv)) => {
                let iv: Iv = iv
                    .as_slice()
                    .try_into()
                    .map_err(|_| MetaError::BadField("iv"))?;
                Ok(Some((size, iv)))
            }
        }
    }

    /// Assembled openfs locations of a chunk: `(path_id, offset)` pairs
    /// open storage can re-encrypt from.
    pub fn openfs_sources(&self, ct_hash: &CtHash) -> Result<Vec<(PathId, u64)>, IndexError> {
        let mut stmt = self.conn.prepare(
            "SELECT path_id, \"offset\" FROM openfs WHERE ct_hash = ?1 AND assembled = 1",
        )?;
        let rows = stmt.query_map(params![ct_hash.as_slice()], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (path_id, offset) = row?;
            let path_id: PathId = path_id
                .as_slice()
                .try_into()
                .map_err(|_| MetaError::BadField("path_id"))?;
            out.push((path_id, offset as u64));
        }
        Ok(out)
    }

    /// Drop one openfs row whose on-disk bytes no longer hash correctly.
    pub fn invalidate_openfs(
        &mut self,
        ct_hash: &CtHash,
        path_id: &PathId,
        offset: u64,
    ) -> Result<(), IndexError> {
        self.conn.execute(
            "DELETE FROM openfs WHERE ct_hash = ?1 AND path_id = ?2 AND \"offset\" = ?3",
            params![ct_hash.as_slice(), path_id.as_slice(), offset as i64],
        )?;
        Ok(())
    }

    /// Flip the assembled bit for a path (meta row and its openfs rows).
    pub fn mark_assembled(&mut self, path_id: &PathId, assembled: bool) -> Result<(), IndexError> {
        let sp = self.conn.savepoint()?;
        let flag = assembled as i64;
        sp.execute(
            "UPDATE meta SET assembled = ?2 WHERE path_id = ?1",
            params![path_id.as_slice(), flag],
        )?;
        sp.execute(
            "UPDATE openfs SET assembled = ?2 WHERE path_id = ?1",
            params![path_id.as_slice(), flag],
        )?;
        sp.commit()?;
        Ok(())
    }

    pub fn is_assembled(&self, path_id: &PathId) -> Result<bool, IndexError> {
        let flag: Option<i64> = self
            .conn
            .query_row(
                "SELECT assembled FROM meta WHERE path_id = ?1",
                params![path_id.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub fn all_metas(&self) -> Result<Vec<SignedMeta>, IndexError> {
        let mut stmt = self
            .conn
            .prepare("SELECT meta_bytes, signature FROM meta ORDER BY path_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut metas = Vec::new();
        for row in rows {
            let (bytes, sig) = row?;
            metas.push(self.reconstruct(bytes, sig)?);
        }
        Ok(metas)
    }

    pub fn status(&self) -> Result<IndexStatus, IndexError> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, COUNT(*) FROM meta GROUP BY kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut status = IndexStatus::default();
        for row in rows {
            let (kind, count) = row?;
            let count = count as u64;
            match MetaKind::from_i64(kind) {
                Ok(MetaKind::File) => status.files = count,
                Ok(MetaKind::Directory) => status.directories = count,
                Ok(MetaKind::Symlink) => status.symlinks = count,
                Ok(MetaKind::Deleted) => status.deleted = count,
                Err(_) => {}
            }
        }
        Ok(status)
    }

    /// Drop chunk catalog rows nothing references anymore.
    pub fn gc_orphan_chunks(&mut self) -> Result<usize, IndexError> {
        let removed = self.conn.execute(
            "DELETE FROM chunk WHERE ct_hash NOT IN (SELECT DISTINCT ct_hash FROM openfs)",
            [],
        )?;
        Ok(removed)
    }

    /// Truncate everything. Used when hash.txt disagrees with the
    /// configured secret: the stored state belongs to another folder.
    pub fn wipe(&mut self) -> Result<(), IndexError> {
        let sp = self.conn.savepoint()?;
        sp.execute("DELETE FROM openfs", [])?;
        sp.execute("DELETE FROM chunk", [])?;
        sp.execute("DELETE FROM meta", [])?;
        sp.commit()?;
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }
}

/// Pinned IVs from the previous revision of a path: `pt_hmac → iv`.
/// Consulted by the indexer so unchanged chunks re-encrypt bit-identically.
pub fn iv_reuse_map(
    index: &Index,
    path_id: &PathId,
) -> Result<std::collections::HashMap<[u8; 32], Iv>, IndexError> {
    match index.get_meta(path_id) {
        Ok(signed) => Ok(signed
            .meta()
            .chunks
            .iter()
            .map(|c| (c.pt_hmac, c.iv))
            .collect()),
        Err(IndexError::NoSuchMeta) => Ok(Default::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::chunker::ChunkerParams;
    use skein_core::crypto::IV_LEN;
    use skein_core::meta::{ChunkRef, Meta};

    fn test_index() -> (Index, Secret) {
        let secret = Secret::generate();
        (Index::open_in_memory(secret.clone()).unwrap(), secret)
    }

    fn file_meta(path_id: PathId, revision: i64, chunk_fill: u8) -> Meta {
        let mut meta = Meta::new(path_id, MetaKind::File, revision);
        meta.chunker = Some(ChunkerParams::default());
        meta.chunks = vec![
            ChunkRef {
                pt_hmac: [chunk_fill; 32],
                iv: [1; IV_LEN],
                size: 100,
                ct_hash: [chunk_fill; 28],
            },
            ChunkRef {
                pt_hmac: [chunk_fill + 1; 32],
                iv: [2; IV_LEN],
                size: 50,
                ct_hash: [chunk_fill + 1; 28],
            },
        ];
        meta
    }

    #[test]
    fn put_then_get_roundtrip() {
        let (mut index, secret) = test_index();
        let signed = SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap();

        assert_eq!(index.put_meta(&signed, false).unwrap(), PutOutcome::Inserted);
        let fetched = index.get_meta(&[1; 32]).unwrap();
        assert_eq!(fetched.raw(), signed.raw());
        assert_eq!(fetched.meta().chunks.len(), 2);
    }

    #[test]
    fn missing_meta_is_no_such_meta() {
        let (index, _) = test_index();
        assert!(matches!(
            index.get_meta(&[9; 32]),
            Err(IndexError::NoSuchMeta)
        ));
    }

    #[test]
    fn put_is_idempotent_on_identical_bytes() {
        let (mut index, secret) = test_index();
        let signed = SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap();
        index.put_meta(&signed, false).unwrap();
        assert_eq!(index.put_meta(&signed, false).unwrap(), PutOutcome::Identical);
    }

    #[test]
    fn lower_revision_is_rejected() {
        let (mut index, secret) = test_index();
        let newer = SignedMeta::sign(file_meta([1; 32], 20, 5), &secret).unwrap();
        let older = SignedMeta::sign(file_meta([1; 32], 10, 6), &secret).unwrap();

        index.put_meta(&newer, false).unwrap();
        assert!(matches!(
            index.put_meta(&older, false),
            Err(IndexError::RevisionRegress {
                stored: 20,
                incoming: 10
            })
        ));
        // Stored record unchanged
        assert_eq!(index.get_meta(&[1; 32]).unwrap().revision(), 20);
    }

    #[test]
    fn higher_revision_replaces_and_rewrites_openfs() {
        let (mut index, secret) = test_index();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap(), false)
            .unwrap();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 20, 40), &secret).unwrap(), false)
            .unwrap();

        // Old chunks are no longer reachable through openfs…
        assert!(index.containing_chunk(&[5; 28]).unwrap().is_empty());
        // …the new ones are.
        let holders = index.containing_chunk(&[40; 28]).unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].revision(), 20);
        // …and the catalog rows can be reaped.
        assert_eq!(index.gc_orphan_chunks().unwrap(), 2);
    }

    #[test]
    fn equal_revision_ties_break_on_bytes() {
        let (mut index, secret) = test_index();
        let a = SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap();
        let b = SignedMeta::sign(file_meta([1; 32], 10, 6), &secret).unwrap();
        let (winner, loser) = if a.supersedes(&b) { (a, b) } else { (b, a) };

        index.put_meta(&loser, false).unwrap();
        index.put_meta(&winner, false).unwrap();
        assert_eq!(index.get_meta(&[1; 32]).unwrap().raw(), winner.raw());
        // The loser can no longer displace the winner.
        assert!(index.put_meta(&loser, false).is_err());
    }

    #[test]
    fn put_allowed_tracks_stored_revision() {
        let (mut index, secret) = test_index();
        assert!(index.put_allowed(&[1; 32], 1).unwrap());

        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap(), false)
            .unwrap();
        assert!(!index.put_allowed(&[1; 32], 9).unwrap());
        assert!(index.put_allowed(&[1; 32], 10).unwrap());
        assert!(index.put_allowed(&[1; 32], 11).unwrap());
    }

    #[test]
    fn get_meta_at_requires_exact_revision() {
        let (mut index, secret) = test_index();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap(), false)
            .unwrap();
        assert!(index.get_meta_at(&[1; 32], 10).is_ok());
        assert!(matches!(
            index.get_meta_at(&[1; 32], 9),
            Err(IndexError::NoSuchMeta)
        ));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let (mut index, _) = test_index();
        let stranger = Secret::generate();
        let signed = SignedMeta::sign(file_meta([1; 32], 10, 5), &stranger).unwrap();
        assert!(matches!(
            index.put_meta(&signed, false),
            Err(IndexError::Meta(MetaError::InvalidSignature))
        ));
    }

    #[test]
    fn chunk_info_and_sources() {
        let (mut index, secret) = test_index();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap(), false)
            .unwrap();

        let (size, iv) = index.chunk_info(&[6; 28]).unwrap().unwrap();
        assert_eq!(size, 50);
        assert_eq!(iv, [2; IV_LEN]);
        assert!(index.chunk_info(&[99; 28]).unwrap().is_none());

        // Not assembled yet — open storage has nothing to read from.
        assert!(index.openfs_sources(&[6; 28]).unwrap().is_empty());
        index.mark_assembled(&[1; 32], true).unwrap();
        let sources = index.openfs_sources(&[6; 28]).unwrap();
        assert_eq!(sources, vec![([1; 32], 100)]);
    }

    #[test]
    fn invalidate_openfs_removes_one_row() {
        let (mut index, secret) = test_index();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 10, 5), &secret).unwrap(), false)
            .unwrap();
        index.mark_assembled(&[1; 32], true).unwrap();
        index.invalidate_openfs(&[6; 28], &[1; 32], 100).unwrap();
        assert!(index.openfs_sources(&[6; 28]).unwrap().is_empty());
        // The sibling chunk's row is untouched.
        assert_eq!(index.openfs_sources(&[5; 28]).unwrap().len(), 1);
    }

    #[test]
    fn status_counts_by_kind() {
        let (mut index, secret) = test_index();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 1, 5), &secret).unwrap(), false)
            .unwrap();
        index
            .put_meta(
                &SignedMeta::sign(Meta::new([2; 32], MetaKind::Directory, 1), &secret).unwrap(),
                false,
            )
            .unwrap();
        index
            .put_meta(&SignedMeta::sign(Meta::new([3; 32], MetaKind::Deleted, 1), &secret).unwrap(), false)
            .unwrap();

        let status = index.status().unwrap();
        assert_eq!(status.files, 1);
        assert_eq!(status.directories, 1);
        assert_eq!(status.deleted, 1);
        assert_eq!(status.total(), 3);
    }

    #[test]
    fn wipe_truncates_everything() {
        let (mut index, secret) = test_index();
        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 1, 5), &secret).unwrap(), false)
            .unwrap();
        index.wipe().unwrap();
        assert_eq!(index.status().unwrap().total(), 0);
        assert!(index.all_metas().unwrap().is_empty());
        assert!(index.chunk_info(&[5; 28]).unwrap().is_none());
    }

    #[test]
    fn iv_reuse_map_reflects_previous_revision() {
        let (mut index, secret) = test_index();
        assert!(iv_reuse_map(&index, &[1; 32]).unwrap().is_empty());

        index
            .put_meta(&SignedMeta::sign(file_meta([1; 32], 1, 5), &secret).unwrap(), false)
            .unwrap();
        let map = iv_reuse_map(&index, &[1; 32]).unwrap();
        assert_eq!(map.get(&[5; 32]), Some(&[1; IV_LEN]));
        assert_eq!(map.get(&[6; 32]), Some(&[2; IV_LEN]));
    }
}
