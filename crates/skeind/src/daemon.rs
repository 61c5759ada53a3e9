//! Daemon state — the folder registry and process-wide services.
//!
//! Folders are spawned as independent actors and addressed through their
//! handles; the registry maps folder ids (from the wire) to entries. The
//! node key is immutable after startup; configuration lives behind a lock
//! so the control RPC can replace it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};

use skein_core::config::{FolderParams, GlobalConfig};
use skein_core::secret::{FolderId, Secret};
use skein_core::transport::{NodeDigest, NodeKey};
use skein_engine::folder::{FolderActor, FolderHandle};

use crate::portmap::PortMapper;

pub struct FolderEntry {
    pub handle: FolderHandle,
    pub secret: Secret,
    pub params: FolderParams,
    /// Peers currently attached, for dial deduplication.
    pub connected: DashMap<NodeDigest, SocketAddr>,
}

impl FolderEntry {
    pub fn connected_to_endpoint(&self, endpoint: &SocketAddr) -> bool {
        self.connected.iter().any(|kv| kv.value() == endpoint)
    }
}

pub struct Daemon {
    pub node_key: NodeKey,
    pub config: RwLock<GlobalConfig>,
    pub portmap: PortMapper,
    pub shutdown: broadcast::Sender<()>,
    folders: DashMap<FolderId, Arc<FolderEntry>>,
}

impl Daemon {
    pub fn new(config: GlobalConfig, node_key: NodeKey) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(4);
        Arc::new(Self {
            node_key,
            config: RwLock::new(config),
            portmap: PortMapper::new(),
            shutdown,
            folders: DashMap::new(),
        })
    }

    pub fn folder(&self, folder_id: &FolderId) -> Option<Arc<FolderEntry>> {
        self.folders.get(folder_id).map(|entry| entry.clone())
    }

    pub fn folder_entries(&self) -> Vec<Arc<FolderEntry>> {
        self.folders.iter().map(|entry| entry.clone()).collect()
    }

    /// Construct, register and spawn one folder actor.
    pub async fn add_folder(self: &Arc<Self>, params: FolderParams) -> Result<FolderId> {
        let global = self.config.read().await.clone();
        let (actor, handle) = FolderActor::new(params.clone(), &global)
            .with_context(|| format!("starting folder at {}", params.path.display()))?;
        let secret = actor.secret().clone();
        let folder_id = handle.folder_id;

        if self.folders.contains_key(&folder_id) {
            anyhow::bail!("folder already registered");
        }

        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = actor.run(shutdown).await {
                tracing::error!(error = %e, "folder actor failed");
            }
        });

        self.folders.insert(
            folder_id,
            Arc::new(FolderEntry {
                handle,
                secret,
                params,
                connected: DashMap::new(),
            }),
        );
        tracing::info!(folder = hex::encode(&folder_id[..8]), "folder added");
        Ok(folder_id)
    }

    /// Unregister a folder by its secret string. The actor winds down once
    /// the last handle clone (registry + live sessions) is gone.
    pub fn remove_folder(&self, secret: &str) -> Result<bool> {
        let secret: Secret = secret
            .parse()
            .map_err(|e| anyhow::anyhow!("bad secret: {e}"))?;
        let folder_id = secret.folder_id();
        let removed = self.folders.remove(&folder_id).is_some();
        if removed {
            tracing::info!(folder = hex::encode(&folder_id[..8]), "folder removed");
        }
        Ok(removed)
    }
}
