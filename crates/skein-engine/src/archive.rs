//! Archival — what happens to the previous version of a path when a newer
//! revision lands on top of it (or deletes it).
//!
//! Four strategies, chosen per folder:
//!   none      — the old file is simply removed.
//!   trash     — moved under `{system_path}/archive/` with a timestamp
//!               suffix; entries older than the TTL are purged on each
//!               archival event.
//!   timestamp — kept next to the original as `name~YYYYMMDD-HHMMSS`,
//!               at most N copies.
//!   block     — removed, but the replaced revision's chunks stay in the
//!               encrypted blob store (storage cleanup is skipped).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;

use skein_core::config::{ArchiveStrategy, FolderParams};

pub struct Archive {
    strategy: ArchiveStrategy,
    archive_dir: PathBuf,
    trash_ttl: Duration,
    timestamp_keep: usize,
}

impl Archive {
    pub fn new(params: &FolderParams) -> Self {
        Self {
            strategy: params.archive_strategy,
            archive_dir: params.system_path().join("archive"),
            trash_ttl: Duration::from_secs(params.archive_trash_ttl_days as u64 * 86_400),
            timestamp_keep: params.archive_timestamp_keep.max(1),
        }
    }

    pub fn strategy(&self) -> ArchiveStrategy {
        self.strategy
    }

    /// Dispose of whatever currently occupies `path`, per strategy.
    /// Missing paths are fine; directories are only ever removed when empty
    /// (their children carry their own deletion records).
    pub fn dispose(&self, path: &Path) -> io::Result<()> {
        let stat = match fs::symlink_metadata(path) {
            Ok(stat) => stat,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if stat.is_dir() {
            return fs::remove_dir(path);
        }
        // Symlinks are never archived — the target isn't ours to keep.
        if stat.file_type().is_symlink() {
            return fs::remove_file(path);
        }

        match self.strategy {
            ArchiveStrategy::None | ArchiveStrategy::Block => fs::remove_file(path),
            ArchiveStrategy::Trash => self.trash(path),
            ArchiveStrategy::Timestamp => self.timestamp(path),
        }
    }

    fn trash(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.archive_dir)?;
        self.purge_expired()?;

        let dest = self.archive_dir.join(stamped_name(path));
        fs::rename(path, dest)
    }

    /// Sweep trash entries older than the TTL. Runs on every archival
    /// event rather than on a timer.
    fn purge_expired(&self) -> io::Result<()> {
        let cutoff = SystemTime::now()
            .checked_sub(self.trash_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for entry in fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if expired {
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %e, "trash purge failed");
                }
            }
        }
        Ok(())
    }

    fn timestamp(&self, path: &Path) -> io::Result<()> {
        let dest = path.with_file_name(stamped_name(path));
        fs::rename(path, &dest)?;
        self.prune_timestamped(path)
    }

    /// Keep at most `timestamp_keep` stamped siblings, oldest out first.
    fn prune_timestamped(&self, original: &Path) -> io::Result<()> {
        let Some(parent) = original.parent() else {
            return Ok(());
        };
        let Some(name) = original.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let prefix = format!("{name}~");

        let mut stamped: Vec<PathBuf> = fs::read_dir(parent)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        // The stamp format sorts chronologically.
        stamped.sort();
        while stamped.len() > self.timestamp_keep {
            let victim = stamped.remove(0);
            if let Err(e) = fs::remove_file(&victim) {
                tracing::warn!(path = %victim.display(), error = %e, "timestamp prune failed");
            }
        }
        Ok(())
    }
}

fn stamped_name(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    format!("{name}~{}", Local::now().format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dir: &Path, strategy: ArchiveStrategy) -> FolderParams {
        FolderParams {
            path: dir.to_path_buf(),
            system_path: dir.join(".skein"),
            archive_strategy: strategy,
            archive_timestamp_keep: 2,
            ..FolderParams::default()
        }
    }

    #[test]
    fn none_strategy_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("old.txt");
        fs::write(&file, b"old").unwrap();

        Archive::new(&params(dir.path(), ArchiveStrategy::None))
            .dispose(&file)
            .unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn missing_path_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        Archive::new(&params(dir.path(), ArchiveStrategy::Trash))
            .dispose(&dir.path().join("ghost"))
            .unwrap();
    }

    #[test]
    fn trash_moves_into_archive_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("old.txt");
        fs::write(&file, b"precious").unwrap();

        Archive::new(&params(dir.path(), ArchiveStrategy::Trash))
            .dispose(&file)
            .unwrap();
        assert!(!file.exists());

        let archived: Vec<_> = fs::read_dir(dir.path().join(".skein/archive"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archived.len(), 1);
        let name = archived[0].file_name().into_string().unwrap();
        assert!(name.starts_with("old.txt~"));
        assert_eq!(fs::read(archived[0].path()).unwrap(), b"precious");
    }

    #[test]
    fn timestamp_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(&params(dir.path(), ArchiveStrategy::Timestamp));
        let file = dir.path().join("doc.md");

        // Stamps have one-second resolution, so fake older siblings.
        for stamp in ["20200101-000001", "20200101-000002", "20200101-000003"] {
            fs::write(dir.path().join(format!("doc.md~{stamp}")), stamp).unwrap();
        }
        fs::write(&file, b"current").unwrap();
        archive.dispose(&file).unwrap();

        let mut stamped: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.starts_with("doc.md~"))
            .collect();
        stamped.sort();
        assert_eq!(stamped.len(), 2, "prune must keep at most N siblings");
        // The survivors are the most recent ones.
        assert!(stamped[0].as_str() > "doc.md~20200101-000002");
    }

    #[test]
    fn empty_directory_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        Archive::new(&params(dir.path(), ArchiveStrategy::Trash))
            .dispose(&sub)
            .unwrap();
        assert!(!sub.exists());
    }
}
