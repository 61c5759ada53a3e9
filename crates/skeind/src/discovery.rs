//! Discovery intake — the seam where peer sources plug in.
//!
//! LAN multicast, DHT and tracker integrations all reduce to the same
//! event: "someone at this endpoint claims to serve this folder". The
//! daemon consumes the events and dials when the folder is known and the
//! peer isn't already connected.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use skein_core::secret::FolderId;

use crate::daemon::Daemon;
use crate::session;

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryEvent {
    pub folder_id: FolderId,
    pub endpoint: SocketAddr,
}

pub fn channel() -> (mpsc::Sender<DiscoveryEvent>, mpsc::Receiver<DiscoveryEvent>) {
    mpsc::channel(64)
}

/// Drain discovery events, dialing newly seen peers.
pub async fn intake(daemon: Arc<Daemon>, mut rx: mpsc::Receiver<DiscoveryEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(entry) = daemon.folder(&event.folder_id) else {
            tracing::trace!(
                folder = hex::encode(&event.folder_id[..8]),
                "discovery hit for unknown folder"
            );
            continue;
        };
        if entry.connected_to_endpoint(&event.endpoint) {
            continue;
        }
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = session::dial(daemon, event.folder_id, event.endpoint).await {
                tracing::debug!(endpoint = %event.endpoint, error = %e, "dial failed");
            }
        });
    }
}
