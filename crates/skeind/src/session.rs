//! P2P sessions — TCP streams wrapped in Noise, then the folder handshake.
//!
//! A session is established in three stages:
//!   1. Noise_XX over the raw stream (mutual node authentication).
//!   2. Loopback and duplicate-connection checks on the peer digest.
//!   3. The folder `Handshake` frame: folder id + an HMAC auth token
//!      proving possession of the folder secret. The dialer speaks first.
//!
//! After that the connection is a pair of pumps: a writer draining the
//! peer's outbound queue into sealed records, and a reader turning
//! records back into frames for the folder actor's mailbox.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use skein_core::proto::{auth_token, FrameDecoder, Handshake, Message};
use skein_core::secret::FolderId;
use skein_core::transport::{
    Channel, HandshakeInitiator, HandshakeResponder, RecordDecoder,
};
use skein_engine::folder::FolderEvent;
use skein_engine::peer::PeerInfo;

use crate::daemon::{Daemon, FolderEntry};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial a discovered endpoint for a folder we serve.
pub async fn dial(daemon: Arc<Daemon>, folder_id: FolderId, endpoint: SocketAddr) -> Result<()> {
    let entry = daemon
        .folder(&folder_id)
        .context("dialing for an unregistered folder")?;

    let mut stream = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    stream.set_nodelay(true).ok();

    let channel = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let (initiator, msg1) = HandshakeInitiator::new(&daemon.node_key)?;
        write_plain_record(&mut stream, &msg1).await?;
        let msg2 = read_plain_record(&mut stream).await?;
        let (channel, msg3) = initiator.finish(&msg2)?;
        write_plain_record(&mut stream, &msg3).await?;
        Ok::<_, anyhow::Error>(channel)
    })
    .await
    .context("noise handshake timed out")??;

    establish(daemon, stream, channel, Some(entry)).await
}

/// Serve one inbound connection.
pub async fn accept(daemon: Arc<Daemon>, mut stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true).ok();
    let channel = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let responder = HandshakeResponder::new(&daemon.node_key)?;
        let msg1 = read_plain_record(&mut stream).await?;
        let (pending, msg2) = responder.respond(&msg1)?;
        write_plain_record(&mut stream, &msg2).await?;
        let msg3 = read_plain_record(&mut stream).await?;
        Ok::<_, anyhow::Error>(pending.finish(&msg3)?)
    })
    .await
    .context("noise handshake timed out")??;

    establish(daemon, stream, channel, None).await
}

async fn establish(
    daemon: Arc<Daemon>,
    mut stream: TcpStream,
    mut channel: Channel,
    dialed: Option<Arc<FolderEntry>>,
) -> Result<()> {
    let our_digest = daemon.node_key.digest();
    let peer_digest = channel.peer_digest();
    if peer_digest == our_digest {
        bail!("loopback connection rejected");
    }
    let endpoint = stream.peer_addr().context("peer address")?;

    let (client_name, user_agent) = {
        let config = daemon.config.read().await;
        (config.client_name.clone(), config.user_agent.clone())
    };
    let mut reader = SessionReader::new();

    // The dialer announces the folder first; the listener learns which
    // folder is wanted from that frame.
    let (entry, their_handshake) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        match dialed {
            Some(entry) => {
                let ours = folder_handshake(&entry, &peer_digest, &our_digest, &client_name, &user_agent)?;
                send_frame(&mut stream, &mut channel, &ours).await?;
                let theirs = reader.expect_handshake(&mut stream, &mut channel).await?;
                Ok::<_, anyhow::Error>((entry, theirs))
            }
            None => {
                let theirs = reader.expect_handshake(&mut stream, &mut channel).await?;
                let entry = daemon
                    .folder(&theirs.folder_id)
                    .context("handshake for unknown folder")?;
                let ours = folder_handshake(&entry, &peer_digest, &our_digest, &client_name, &user_agent)?;
                send_frame(&mut stream, &mut channel, &ours).await?;
                Ok((entry, theirs))
            }
        }
    })
    .await
    .context("folder handshake timed out")??;

    if their_handshake.folder_id != entry.handle.folder_id {
        bail!("auth failed: handshake names a different folder");
    }
    // The sender computed HMAC(key, receiver ∥ sender); we are the receiver.
    let expected = auth_token(
        entry.secret.symmetric_key().context("folder has no symmetric key")?,
        &our_digest,
        &peer_digest,
    );
    if their_handshake.auth_token != expected {
        bail!("auth failed: bad folder auth token");
    }

    if entry.connected.insert(peer_digest, endpoint).is_some() {
        // Keep the older session; this one is redundant.
        bail!("already connected to this node");
    }

    let result = pump(
        entry.clone(),
        stream,
        channel,
        reader,
        peer_digest,
        endpoint,
        their_handshake,
    )
    .await;
    entry.connected.remove(&peer_digest);
    result
}

/// Attach the peer to its folder and run the read/write pumps until the
/// connection dies or the folder drops the peer.
#[allow(clippy::too_many_arguments)]
async fn pump(
    entry: Arc<FolderEntry>,
    stream: TcpStream,
    channel: Channel,
    mut reader: SessionReader,
    peer_digest: [u8; 32],
    endpoint: SocketAddr,
    their_handshake: Handshake,
) -> Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let (reply_tx, reply_rx) = oneshot::channel();
    entry
        .handle
        .tx
        .send(FolderEvent::PeerConnected {
            info: PeerInfo {
                digest: peer_digest,
                endpoint,
                client_name: their_handshake.peer_name,
                user_agent: their_handshake.user_agent,
            },
            outbound: outbound_tx,
            reply: reply_tx,
        })
        .await
        .context("folder actor is gone")?;
    let peer_id = reply_rx.await.context("folder refused the peer")?;

    tracing::info!(
        folder = hex::encode(&entry.handle.folder_id[..8]),
        peer = hex::encode(&peer_digest[..8]),
        endpoint = %endpoint,
        "session established"
    );

    let channel = Arc::new(Mutex::new(channel));
    let (mut read_half, mut write_half) = stream.into_split();

    let writer_channel = channel.clone();
    let writer = tokio::spawn(async move {
        let mut wire = Vec::new();
        while let Some(frame) = outbound_rx.recv().await {
            wire.clear();
            writer_channel.lock().await.seal(&frame, &mut wire)?;
            write_half.write_all(&wire).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let read_result: Result<()> = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            reader.records.extend(&buf[..n]);
            {
                let mut channel = channel.lock().await;
                while let Some(record) = reader.records.next() {
                    let mut plaintext = Vec::new();
                    channel.open(&record, &mut plaintext)?;
                    reader.frames.extend(&plaintext);
                }
            }
            while let Some((message, frame_len)) = reader.frames.next()? {
                entry
                    .handle
                    .tx
                    .send(FolderEvent::PeerMessage {
                        peer: peer_id,
                        message,
                        frame_len,
                    })
                    .await
                    .context("folder actor is gone")?;
            }
        }
    }
    .await;

    // Whatever ended the read loop ends the session.
    writer.abort();
    let _ = entry
        .handle
        .tx
        .send(FolderEvent::PeerDisconnected { peer: peer_id })
        .await;
    tracing::info!(
        peer = hex::encode(&peer_digest[..8]),
        endpoint = %endpoint,
        "session closed"
    );
    read_result
}

fn folder_handshake(
    entry: &FolderEntry,
    peer_digest: &[u8; 32],
    our_digest: &[u8; 32],
    client_name: &str,
    user_agent: &str,
) -> Result<Message> {
    Ok(Message::Handshake(Handshake {
        folder_id: entry.handle.folder_id,
        peer_name: client_name.to_string(),
        user_agent: user_agent.to_string(),
        auth_token: auth_token(
            entry.secret.symmetric_key().context("folder has no symmetric key")?,
            peer_digest,
            our_digest,
        ),
    }))
}

async fn send_frame(
    stream: &mut TcpStream,
    channel: &mut Channel,
    message: &Message,
) -> Result<()> {
    let mut wire = Vec::new();
    channel.seal(&message.encode(), &mut wire)?;
    stream.write_all(&wire).await?;
    Ok(())
}

/// Incremental record + frame parsing state, carried from the handshake
/// phase into the session reader so no bytes are lost in between.
struct SessionReader {
    records: RecordDecoder,
    frames: FrameDecoder,
}

impl SessionReader {
    fn new() -> Self {
        Self {
            records: RecordDecoder::new(),
            frames: FrameDecoder::new(),
        }
    }

    /// Read until one complete message arrives; it must be a Handshake.
    async fn expect_handshake<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut R,
        channel: &mut Channel,
    ) -> Result<Handshake> {
        let mut buf = vec![0u8; 4096];
        loop {
            while let Some(record) = self.records.next() {
                let mut plaintext = Vec::new();
                channel.open(&record, &mut plaintext)?;
                self.frames.extend(&plaintext);
            }
            if let Some((message, _)) = self.frames.next()? {
                match message {
                    Message::Handshake(handshake) => return Ok(handshake),
                    other => bail!("expected handshake, got {:?} frame", other.kind()),
                }
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                bail!("connection closed during folder handshake");
            }
            self.records.extend(&buf[..n]);
        }
    }
}

/// `u16 BE length ∥ bytes` — the framing for the three Noise handshake
/// messages, before any session keys exist.
async fn write_plain_record(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    let mut wire = Vec::with_capacity(2 + bytes.len());
    wire.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    wire.extend_from_slice(bytes);
    stream.write_all(&wire).await?;
    Ok(())
}

async fn read_plain_record(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut record = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut record).await?;
    Ok(record)
}

/// Accept loop for the daemon's P2P listener.
pub async fn listen(daemon: Arc<Daemon>, listener: tokio::net::TcpListener) {
    let mut shutdown = daemon.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("p2p listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(peer = %addr, "inbound connection");
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept(daemon, stream).await {
                        tracing::debug!(peer = %addr, error = %e, "session ended with error");
                    }
                });
            }
        }
    }
}
