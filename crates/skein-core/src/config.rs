//! Configuration for the daemon and its folders.
//!
//! One TOML file: global knobs plus a `[[folders]]` table per synchronized
//! folder. Constructed at startup and passed by reference into each
//! folder's construction — no process-wide mutable state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Human-readable name announced in the folder handshake.
    pub client_name: String,
    pub user_agent: String,

    /// Local control RPC endpoint (line-delimited JSON).
    pub control_listen: String,
    /// P2P listener. Port 0 = OS-assigned.
    pub p2p_listen: String,

    /// Path to the X25519 node key. Auto-generated on first run.
    pub node_key_path: PathBuf,

    /// Memory chunk cache budget per folder, in bytes.
    pub chunk_cache_bytes: u64,
    /// Seconds before an unanswered BlockRequest is re-dispatched.
    pub request_timeout_secs: u64,
    /// Max in-flight block requests per peer.
    pub peer_inflight_cap: usize,
    /// Peers kept unchoked by reciprocation, besides the optimistic slot.
    pub unchoke_slots: usize,

    pub folders: Vec<FolderParams>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            client_name: hostname(),
            user_agent: concat!("skein/", env!("CARGO_PKG_VERSION")).to_string(),
            control_listen: "127.0.0.1:42346".to_string(),
            p2p_listen: "0.0.0.0:42345".to_string(),
            node_key_path: PathBuf::from("node_key"),
            chunk_cache_bytes: 64 * 1024 * 1024,
            request_timeout_secs: 10,
            peer_inflight_cap: 16,
            unchoke_slots: 4,
            folders: Vec::new(),
        }
    }
}

impl GlobalConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "skein-node".to_string())
}

/// What to do with the previous version of a file when a newer revision
/// is assembled over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStrategy {
    /// Overwrite in place.
    None,
    /// Move under `.archive/`, purge entries older than the TTL.
    Trash,
    /// Keep alongside with a `~YYYYMMDD-HHMMSS` suffix, at most N copies.
    Timestamp,
    /// The old chunks stay in block storage; the file is just replaced.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderParams {
    /// Secret string (`A…`/`B…`/`C…`). Tier decides what this node can do.
    pub secret: String,

    /// The synchronized directory.
    pub path: PathBuf,
    /// Metadata home: meta.db, blocks/, hash.txt, archive/.
    /// Empty = `{path}/.skein`.
    pub system_path: PathBuf,

    /// Full rescan cadence, seconds. 0 disables periodic scans.
    pub index_interval_secs: u64,

    /// Canonical-path prefixes excluded from indexing.
    pub ignore_paths: Vec<String>,

    pub preserve_unix_attrib: bool,
    pub preserve_windows_attrib: bool,
    pub preserve_symlinks: bool,

    /// NFC-normalize canonical paths.
    pub normalize_unicode: bool,
    /// Case-fold canonical paths.
    pub lowercase_paths: bool,

    pub archive_strategy: ArchiveStrategy,
    pub archive_trash_ttl_days: u32,
    pub archive_timestamp_keep: usize,
}

impl Default for FolderParams {
    fn default() -> Self {
        Self {
            secret: String::new(),
            path: PathBuf::new(),
            system_path: PathBuf::new(),
            index_interval_secs: 60,
            ignore_paths: Vec::new(),
            preserve_unix_attrib: cfg!(unix),
            preserve_windows_attrib: false,
            preserve_symlinks: true,
            normalize_unicode: true,
            lowercase_paths: false,
            archive_strategy: ArchiveStrategy::Trash,
            archive_trash_ttl_days: 30,
            archive_timestamp_keep: 10,
        }
    }
}

impl FolderParams {
    /// Resolved metadata home.
    pub fn system_path(&self) -> PathBuf {
        if self.system_path.as_os_str().is_empty() {
            self.path.join(".skein")
        } else {
            self.system_path.clone()
        }
    }

    /// Is this canonical path excluded from sync?
    pub fn is_ignored(&self, canonical: &[u8]) -> bool {
        // The metadata home inside the folder is always excluded.
        if canonical.starts_with(b".skein") {
            return true;
        }
        self.ignore_paths.iter().any(|prefix| {
            canonical.starts_with(prefix.as_bytes())
                && matches!(canonical.get(prefix.len()), None | Some(&b'/'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GlobalConfig::default();
        assert!(config.chunk_cache_bytes > 0);
        assert!(config.peer_inflight_cap > 0);
        assert!(config.folders.is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let mut config = GlobalConfig::default();
        config.folders.push(FolderParams {
            secret: "Axyz".into(),
            path: PathBuf::from("/data/docs"),
            ..FolderParams::default()
        });
        let text = config.to_toml().unwrap();
        let parsed = GlobalConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.folders.len(), 1);
        assert_eq!(parsed.folders[0].path, PathBuf::from("/data/docs"));
        assert_eq!(parsed.folders[0].archive_strategy, ArchiveStrategy::Trash);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = GlobalConfig::from_toml("client_name = \"box\"").unwrap();
        assert_eq!(config.client_name, "box");
        assert_eq!(config.peer_inflight_cap, 16);
    }

    #[test]
    fn system_path_defaults_under_folder() {
        let params = FolderParams {
            path: PathBuf::from("/data/docs"),
            ..FolderParams::default()
        };
        assert_eq!(params.system_path(), PathBuf::from("/data/docs/.skein"));
    }

    #[test]
    fn ignore_matches_whole_segments() {
        let params = FolderParams {
            ignore_paths: vec!["build".into()],
            ..FolderParams::default()
        };
        assert!(params.is_ignored(b"build"));
        assert!(params.is_ignored(b"build/out.o"));
        assert!(!params.is_ignored(b"builder/x"));
        assert!(params.is_ignored(b".skein/meta.db"));
    }
}
