//! Local control RPC — line-delimited JSON over a loopback socket.
//!
//! Front-ends send one command per line (`set_config`, `add_folder`,
//! `remove_folder`) and receive a full `state` object once per second:
//! globals, configured folders, and per-folder runtime state including
//! per-peer traffic figures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use skein_core::config::{FolderParams, GlobalConfig};
use skein_engine::folder::{FolderEvent, FolderStatus};

use crate::daemon::Daemon;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlCommand {
    SetConfig { globals: GlobalConfig },
    AddFolder { folder: FolderParams },
    RemoveFolder { secret: String },
}

pub async fn serve(daemon: Arc<Daemon>, listener: TcpListener) {
    let mut shutdown = daemon.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("control server shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "control accept failed");
                        continue;
                    }
                };
                tracing::debug!(client = %addr, "control client connected");
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(daemon, stream).await {
                        tracing::debug!(client = %addr, error = %e, "control client ended");
                    }
                });
            }
        }
    }
}

async fn handle_client(daemon: Arc<Daemon>, stream: TcpStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut push = tokio::time::interval(Duration::from_secs(1));
    let mut shutdown = daemon.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = push.tick() => {
                let state = state_snapshot(&daemon).await;
                let mut line = serde_json::to_string(&state)?;
                line.push('\n');
                write_half.write_all(line.as_bytes()).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ControlCommand>(&line) {
                    Ok(command) => {
                        if let Err(e) = apply(&daemon, command).await {
                            tracing::warn!(error = %e, "control command failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "unparseable control command"),
                }
            }
        }
    }
}

async fn apply(daemon: &Arc<Daemon>, command: ControlCommand) -> Result<()> {
    match command {
        ControlCommand::SetConfig { globals } => {
            let mut config = daemon.config.write().await;
            // The folder list is managed through add/remove commands.
            let folders = std::mem::take(&mut config.folders);
            *config = globals;
            config.folders = folders;
            tracing::info!("globals updated via control rpc");
        }
        ControlCommand::AddFolder { folder } => {
            daemon
                .add_folder(folder.clone())
                .await
                .context("adding folder")?;
            daemon.config.write().await.folders.push(folder);
        }
        ControlCommand::RemoveFolder { secret } => {
            if daemon.remove_folder(&secret)? {
                daemon
                    .config
                    .write()
                    .await
                    .folders
                    .retain(|params| params.secret != secret);
            }
        }
    }
    Ok(())
}

async fn state_snapshot(daemon: &Arc<Daemon>) -> serde_json::Value {
    let mut folder_states = Vec::new();
    for entry in daemon.folder_entries() {
        let (reply, rx) = oneshot::channel();
        let sent = entry
            .handle
            .tx
            .send(FolderEvent::Status { reply })
            .await
            .is_ok();
        if !sent {
            continue;
        }
        if let Ok(Ok(status)) = tokio::time::timeout(Duration::from_millis(500), rx).await {
            folder_states.push(folder_state_json(&status));
        }
    }

    let config = daemon.config.read().await.clone();
    json!({
        "globals": {
            "client_name": config.client_name,
            "user_agent": config.user_agent,
            "p2p_listen": config.p2p_listen,
        },
        "folders": config.folders,
        "state": {
            "folders": folder_states,
            "dht_nodes_count": 0,
        },
    })
}

fn folder_state_json(status: &FolderStatus) -> serde_json::Value {
    json!({
        "path": status.path,
        "secret": status.secret,
        "is_indexing": status.is_indexing,
        "files": status.files,
        "directories": status.directories,
        "symlinks": status.symlinks,
        "deleted": status.deleted,
        "peers": status.peers.iter().map(|peer| json!({
            "endpoint": peer.endpoint,
            "client_name": peer.client_name,
            "user_agent": peer.user_agent,
            "up_bytes": peer.up_bytes,
            "down_bytes": peer.down_bytes,
            "up_bandwidth": peer.up_bandwidth,
            "down_bandwidth": peer.down_bandwidth,
        })).collect::<Vec<_>>(),
    })
}
