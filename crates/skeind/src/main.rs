//! skeind — peer-to-peer encrypted folder synchronization daemon.

mod control;
mod daemon;
mod discovery;
mod portmap;
mod session;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use skein_core::config::GlobalConfig;
use skein_core::transport::NodeKey;

use daemon::Daemon;
use portmap::PortProto;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=skeind=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("SKEIND_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("skeind.toml"));
    let config = match std::fs::read_to_string(&config_path) {
        Ok(text) => GlobalConfig::from_toml(&text)
            .with_context(|| format!("parsing {}", config_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %config_path.display(), "no config file, using defaults");
            GlobalConfig::default()
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", config_path.display())),
    };

    let node_key = load_or_generate_node_key(&config.node_key_path)?;
    tracing::info!(
        node = hex::encode(&node_key.digest()[..8]),
        client_name = %config.client_name,
        "skeind starting"
    );

    let daemon = Daemon::new(config.clone(), node_key);

    for params in &config.folders {
        if let Err(e) = daemon.add_folder(params.clone()).await {
            tracing::error!(path = %params.path.display(), error = %e, "folder skipped");
        }
    }

    let p2p_listener = tokio::net::TcpListener::bind(&config.p2p_listen)
        .await
        .with_context(|| format!("binding p2p listener on {}", config.p2p_listen))?;
    let p2p_port = p2p_listener.local_addr()?.port();
    daemon
        .portmap
        .add_port("p2p", p2p_port, PortProto::Tcp, "skein p2p listener");
    tracing::info!(port = p2p_port, "p2p listener up");

    let control_listener = tokio::net::TcpListener::bind(&config.control_listen)
        .await
        .with_context(|| format!("binding control socket on {}", config.control_listen))?;
    tracing::info!(listen = %config.control_listen, "control rpc up");

    // Discovery sources (LAN, DHT, trackers) feed this channel; the daemon
    // dials whatever they surface.
    let (discovery_tx, discovery_rx) = discovery::channel();

    let session_task = tokio::spawn(session::listen(daemon.clone(), p2p_listener));
    let control_task = tokio::spawn(control::serve(daemon.clone(), control_listener));
    let discovery_task = tokio::spawn(discovery::intake(daemon.clone(), discovery_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    let _ = daemon.shutdown.send(());
    drop(discovery_tx);

    let drain = async {
        let _ = session_task.await;
        let _ = control_task.await;
        let _ = discovery_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown drain timed out");
    }
    daemon.portmap.remove_port("p2p");
    Ok(())
}

/// The node key is generated on first start and persisted read-only for
/// the owner. Its digest is this node's identity to every peer.
fn load_or_generate_node_key(path: &Path) -> Result<NodeKey> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .context("node key file must hold exactly 32 bytes")?;
            Ok(NodeKey::from_private(seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = NodeKey::generate();
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            write_private(path, &*key.private_bytes())?;
            tracing::info!(path = %path.display(), "generated new node key");
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("reading node key {}", path.display())),
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}
