//! The folder actor — one owning task per synchronized folder.
//!
//! All mutable folder state (index, chunk storage, peer table, downloader)
//! lives here and is touched only from this task; everything else talks to
//! the folder through its mailbox. The run loop multiplexes the mailbox,
//! a 1 Hz tick (bandwidth snapshots, request timeouts, rechoke, rescan
//! countdown) and the daemon-wide shutdown signal.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use skein_core::config::{FolderParams, GlobalConfig};
use skein_core::crypto::CtHash;
use skein_core::meta::{MetaKind, SignedMeta};
use skein_core::path::{PathId, PathNormalizer};
use skein_core::proto::Message;
use skein_core::secret::{Capability, FolderId, Secret};

use crate::assembler::Assembler;
use crate::downloader::Downloader;
use crate::index::{Index, IndexError, PutOutcome};
use crate::indexer::{Indexer, IndexerError};
use crate::peer::{Peer, PeerId, PeerInfo};
use crate::storage::{ChunkStorage, StorageError};
use crate::uploader::Uploader;

/// Seconds without any traffic before a session is considered dead.
const SESSION_TIMEOUT_SECS: u64 = 90;
/// Choke re-evaluation cadence, in ticks.
const RECHOKE_TICKS: u64 = 10;
/// Orphaned chunk catalog sweep cadence, in ticks.
const GC_TICKS: u64 = 60;

pub enum FolderEvent {
    PeerConnected {
        info: PeerInfo,
        outbound: mpsc::UnboundedSender<Bytes>,
        reply: oneshot::Sender<PeerId>,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    PeerMessage {
        peer: PeerId,
        message: Message,
        frame_len: usize,
    },
    /// Run a full filesystem scan now.
    IndexScan,
    Status {
        reply: oneshot::Sender<FolderStatus>,
    },
}

#[derive(Debug, Clone)]
pub struct FolderStatus {
    pub path: std::path::PathBuf,
    pub secret: String,
    pub is_indexing: bool,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub deleted: u64,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub endpoint: String,
    pub client_name: String,
    pub user_agent: String,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub up_bandwidth: u64,
    pub down_bandwidth: u64,
}

/// Cheap cloneable address of a running folder actor.
#[derive(Clone)]
pub struct FolderHandle {
    pub folder_id: FolderId,
    pub tx: mpsc::Sender<FolderEvent>,
}

pub struct FolderActor {
    params: FolderParams,
    secret: Secret,
    folder_id: FolderId,
    index: Index,
    storage: ChunkStorage,
    /// ReadOnly+ tiers assemble; Download relays ciphertext blindly.
    assembler: Option<Assembler>,
    /// Only the ReadWrite tier authors records.
    indexer: Option<Indexer>,
    downloader: Downloader,
    uploader: Uploader,
    peers: Vec<Option<Peer>>,
    rx: mpsc::Receiver<FolderEvent>,
    active: Arc<AtomicBool>,
    /// Metas whose assembly failed and should be retried on the next tick.
    retry_assembly: std::collections::HashSet<PathId>,
    is_indexing: bool,
    ticks: u64,
}

impl FolderActor {
    pub fn new(
        params: FolderParams,
        global: &GlobalConfig,
    ) -> Result<(Self, FolderHandle)> {
        let secret: Secret = params
            .secret
            .parse()
            .map_err(|e| anyhow::anyhow!("bad folder secret: {e}"))?;
        let folder_id = secret.folder_id();

        let system_path = params.system_path();
        fs::create_dir_all(&system_path)
            .with_context(|| format!("creating {}", system_path.display()))?;

        let mut index = Index::open(&system_path.join("meta.db"), secret.clone())
            .context("opening folder index")?;
        ensure_identity_marker(&system_path, &folder_id, &mut index)?;

        let normalizer = PathNormalizer::new(
            params.path.clone(),
            params.normalize_unicode,
            params.lowercase_paths,
        );
        let storage = ChunkStorage::new(
            &system_path,
            secret.clone(),
            normalizer,
            global.chunk_cache_bytes,
        )
        .context("opening chunk storage")?;

        let active = Arc::new(AtomicBool::new(true));
        let assembler = (secret.level() >= Capability::ReadOnly)
            .then(|| Assembler::new(&params, secret.clone()));
        let indexer = (secret.level() == Capability::ReadWrite)
            .then(|| Indexer::new(params.clone(), secret.clone(), active.clone()));

        let (tx, rx) = mpsc::channel(256);
        let actor = Self {
            params,
            secret: secret.clone(),
            folder_id,
            index,
            storage,
            assembler,
            indexer,
            downloader: Downloader::new(
                global.peer_inflight_cap,
                Duration::from_secs(global.request_timeout_secs),
            ),
            uploader: Uploader::new(global.unchoke_slots),
            peers: Vec::new(),
            rx,
            active,
            retry_assembly: Default::default(),
            is_indexing: false,
            ticks: 0,
        };
        Ok((actor, FolderHandle { folder_id, tx }))
    }

    pub fn folder_id(&self) -> FolderId {
        self.folder_id
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    /// Read access to the folder's metadata index.
    pub fn index(&self) -> &Index {
        &self.index
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        // First scan on startup so a fresh folder announces its content.
        self.run_scan();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.shutdown();
                    return Ok(());
                }
                _ = tick.tick() => self.on_tick(),
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        self.shutdown();
                        return Ok(());
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        // Stop the indexer at its next chunk boundary; peers close when
        // their outbound senders drop with the peer table.
        self.active.store(false, Ordering::Relaxed);
        self.peers.clear();
        tracing::info!(
            folder = hex::encode(&self.folder_id[..8]),
            "folder shut down"
        );
    }

    pub fn handle_event(&mut self, event: FolderEvent) {
        match event {
            FolderEvent::PeerConnected {
                info,
                outbound,
                reply,
            } => {
                let peer = self.attach_peer(info, outbound);
                let _ = reply.send(peer);
            }
            FolderEvent::PeerDisconnected { peer } => self.detach_peer(peer),
            FolderEvent::PeerMessage {
                peer,
                message,
                frame_len,
            } => self.on_message(peer, message, frame_len),
            FolderEvent::IndexScan => self.run_scan(),
            FolderEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    fn attach_peer(&mut self, info: PeerInfo, outbound: mpsc::UnboundedSender<Bytes>) -> PeerId {
        let digest = info.digest;
        let peer = Peer::new(info, outbound);
        let id = match self.peers.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                self.peers[free] = Some(peer);
                free
            }
            None => {
                self.peers.push(Some(peer));
                self.peers.len() - 1
            }
        };
        tracing::info!(
            folder = hex::encode(&self.folder_id[..8]),
            peer = hex::encode(&digest[..8]),
            "peer attached"
        );
        self.announce_state(id);
        id
    }

    fn detach_peer(&mut self, id: PeerId) {
        if id < self.peers.len() && self.peers[id].is_some() {
            self.peers[id] = None;
            self.downloader.drop_peer(id);
            tracing::info!(folder = hex::encode(&self.folder_id[..8]), peer = id, "peer detached");
        }
    }

    /// Tell a fresh peer everything we hold: every meta, and every chunk
    /// of those metas that any storage layer has.
    fn announce_state(&mut self, id: PeerId) {
        let metas = match self.index.all_metas() {
            Ok(metas) => metas,
            Err(e) => {
                self.on_index_error(e);
                return;
            }
        };
        let mut announced: std::collections::HashSet<CtHash> = Default::default();
        let mut messages = Vec::new();
        for signed in &metas {
            messages.push(Message::HaveMeta {
                path_id: signed.path_id(),
                revision: signed.revision(),
            });
            for (chunk, present) in signed
                .meta()
                .chunks
                .iter()
                .zip(self.storage.make_bitfield(&self.index, signed.meta()))
            {
                if present && announced.insert(chunk.ct_hash) {
                    messages.push(Message::HaveChunk {
                        ct_hash: chunk.ct_hash,
                    });
                }
            }
        }
        self.send_to(id, &messages);
    }

    fn send_to(&mut self, id: PeerId, messages: &[Message]) {
        let alive = match self.peers.get_mut(id).and_then(|slot| slot.as_mut()) {
            Some(peer) => messages.iter().all(|m| peer.send(m)),
            None => return,
        };
        if !alive {
            self.detach_peer(id);
        }
    }

    fn broadcast(&mut self, message: &Message, except: Option<PeerId>) {
        let ids: Vec<PeerId> = (0..self.peers.len())
            .filter(|id| self.peers[*id].is_some() && Some(*id) != except)
            .collect();
        for id in ids {
            self.send_to(id, std::slice::from_ref(message));
        }
    }

    // ── Protocol ──────────────────────────────────────────────────────────────

    fn on_message(&mut self, id: PeerId, message: Message, frame_len: usize) {
        let Some(peer) = self.peers.get_mut(id).and_then(|slot| slot.as_mut()) else {
            return;
        };
        peer.note_received(frame_len, message.payload_len());

        match message {
            // The handshake is consumed by the session layer before attach.
            Message::Handshake(_) => {
                tracing::warn!(peer = id, "unexpected handshake mid-session");
                self.detach_peer(id);
            }
            Message::Choke => {
                peer.peer_choking = true;
                // Outstanding requests to a choking peer are void.
                self.downloader.drop_peer(id);
            }
            Message::Unchoke => {
                peer.peer_choking = false;
                self.dispatch_requests();
            }
            Message::Interested => {
                peer.peer_interested = true;
            }
            Message::NotInterested => {
                peer.peer_interested = false;
            }
            Message::HaveMeta { path_id, revision } => self.on_have_meta(id, path_id, revision),
            Message::HaveChunk { ct_hash } => {
                peer.have.insert(ct_hash);
                self.refresh_interest();
                self.dispatch_requests();
            }
            Message::MetaRequest { path_id, revision } => {
                match self.index.get_meta_at(&path_id, revision) {
                    Ok(signed) => {
                        let reply = Message::MetaReply {
                            meta_bytes: signed.raw().to_vec(),
                            signature: *signed.signature(),
                        };
                        self.send_to(id, &[reply]);
                    }
                    // Expected control flow: we no longer hold that revision.
                    Err(IndexError::NoSuchMeta) => {
                        tracing::trace!(peer = id, "meta request for unknown revision");
                    }
                    Err(e) => self.on_index_error(e),
                }
            }
            Message::MetaReply {
                meta_bytes,
                signature,
            } => self.on_meta_reply(id, meta_bytes, signature),
            Message::BlockRequest {
                ct_hash,
                offset,
                size,
            } => {
                let Some(peer) = self.peers.get(id).and_then(|slot| slot.as_ref()) else {
                    return;
                };
                if let Some(reply) = self.uploader.serve(
                    &mut self.index,
                    &mut self.storage,
                    peer,
                    ct_hash,
                    offset,
                    size,
                ) {
                    self.send_to(id, &[reply]);
                }
            }
            Message::BlockReply { ct_hash, data, .. } => self.on_block_reply(ct_hash, data),
            // We reply to block requests synchronously, so there is never
            // a queued obligation to drop.
            Message::Cancel { .. } => {}
        }
    }

    fn on_have_meta(&mut self, id: PeerId, path_id: PathId, revision: i64) {
        match self.index.put_allowed(&path_id, revision) {
            Ok(true) => {
                if self.downloader.want_meta(path_id, revision) {
                    self.send_to(id, &[Message::MetaRequest { path_id, revision }]);
                }
            }
            Ok(false) => {}
            Err(e) => self.on_index_error(e),
        }
    }

    fn on_meta_reply(&mut self, id: PeerId, meta_bytes: Vec<u8>, signature: [u8; 64]) {
        let signed = match SignedMeta::from_parts(Bytes::from(meta_bytes), signature, &self.secret)
        {
            Ok(signed) => signed,
            Err(e) => {
                tracing::warn!(peer = id, error = %e, "rejected meta reply");
                return;
            }
        };
        self.downloader.meta_done(signed.path_id(), signed.revision());

        match self.index.put_meta(&signed, false) {
            Ok(PutOutcome::Inserted) => {
                tracing::debug!(
                    folder = hex::encode(&self.folder_id[..8]),
                    revision = signed.revision(),
                    "meta accepted from peer"
                );
                self.register_wants(&signed);
                self.broadcast(
                    &Message::HaveMeta {
                        path_id: signed.path_id(),
                        revision: signed.revision(),
                    },
                    Some(id),
                );
                self.try_assemble(&signed);
                self.refresh_interest();
                self.dispatch_requests();
            }
            Ok(PutOutcome::Identical) => {}
            // Raced with a newer revision — expected, not an error.
            Err(IndexError::RevisionRegress { .. }) => {}
            Err(e) => self.on_index_error(e),
        }
    }

    fn on_block_reply(&mut self, ct_hash: CtHash, data: Vec<u8>) {
        match self.storage.put_chunk(&ct_hash, &data) {
            Ok(()) => self.on_chunk_stored(ct_hash),
            Err(StorageError::ChunkMismatch) => {
                tracing::warn!(
                    ct_hash = hex::encode(&ct_hash[..8]),
                    "block reply bytes do not match, re-requesting"
                );
                self.downloader.release(&ct_hash);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to store chunk");
                self.downloader.release(&ct_hash);
            }
        }
    }

    fn on_chunk_stored(&mut self, ct_hash: CtHash) {
        self.downloader.chunk_done(&ct_hash);
        self.broadcast(&Message::HaveChunk { ct_hash }, None);

        let holders = match self.index.containing_chunk(&ct_hash) {
            Ok(holders) => holders,
            Err(e) => {
                self.on_index_error(e);
                return;
            }
        };
        for signed in holders {
            self.try_assemble(&signed);
        }
        self.refresh_interest();
        self.dispatch_requests();
    }

    // ── Download machinery ────────────────────────────────────────────────────

    fn register_wants(&mut self, signed: &SignedMeta) {
        let meta = signed.meta();
        if meta.kind != MetaKind::File {
            return;
        }
        let bitfield = self.storage.make_bitfield(&self.index, meta);
        for (ordinal, (chunk, present)) in meta.chunks.iter().zip(bitfield).enumerate() {
            if !present {
                self.downloader.want_chunk(chunk.ct_hash, meta.path_id, ordinal);
            }
        }
    }

    fn dispatch_requests(&mut self) {
        let picked = self.downloader.pick_requests(Instant::now(), &self.peers);
        for (id, ct_hash) in picked {
            let size = match self.index.chunk_info(&ct_hash) {
                Ok(Some((size, _))) => skein_core::crypto::ciphertext_len(size as u64) as u32,
                Ok(None) => {
                    // The meta referencing it was superseded meanwhile.
                    self.downloader.chunk_done(&ct_hash);
                    continue;
                }
                Err(e) => {
                    self.on_index_error(e);
                    return;
                }
            };
            self.send_to(
                id,
                &[Message::BlockRequest {
                    ct_hash,
                    offset: 0,
                    size,
                }],
            );
        }
    }

    fn refresh_interest(&mut self) {
        for id in 0..self.peers.len() {
            let Some(peer) = self.peers[id].as_mut() else {
                continue;
            };
            let interested = self.downloader.interesting(&peer.have);
            if let Some(message) = peer.set_interested(interested) {
                self.send_to(id, &[message]);
            }
        }
    }

    fn try_assemble(&mut self, signed: &SignedMeta) {
        let Some(assembler) = &self.assembler else {
            return;
        };
        match assembler.assemble(&mut self.index, &mut self.storage, signed) {
            Ok(_) => {
                self.retry_assembly.remove(&signed.path_id());
            }
            Err(e) => {
                // Per-file failure: log, retry on the next trigger.
                tracing::warn!(
                    folder = hex::encode(&self.folder_id[..8]),
                    error = %e,
                    "assembly failed, will retry"
                );
                self.retry_assembly.insert(signed.path_id());
            }
        }
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    pub fn on_tick(&mut self) {
        self.ticks += 1;

        for slot in self.peers.iter_mut().flatten() {
            slot.bandwidth.heartbeat();
        }

        // Request timeouts: cancel on the wire, decay the slow peer.
        let expired = self.downloader.expire(Instant::now());
        for (id, ct_hash) in expired {
            if let Some(peer) = self.peers.get_mut(id).and_then(|slot| slot.as_mut()) {
                peer.rank *= 0.8;
            }
            let size = match self.index.chunk_info(&ct_hash) {
                Ok(Some((size, _))) => skein_core::crypto::ciphertext_len(size as u64) as u32,
                _ => 0,
            };
            self.send_to(
                id,
                &[Message::Cancel {
                    ct_hash,
                    offset: 0,
                    size,
                }],
            );
            tracing::debug!(peer = id, ct_hash = hex::encode(&ct_hash[..8]), "request timed out");
        }
        self.dispatch_requests();

        // Dead sessions.
        let timeout = Duration::from_secs(SESSION_TIMEOUT_SECS);
        let dead: Vec<PeerId> = self
            .peers
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|peer| (id, peer)))
            .filter(|(_, peer)| peer.last_recv.elapsed() > timeout)
            .map(|(id, _)| id)
            .collect();
        for id in dead {
            tracing::info!(peer = id, "session timed out");
            self.detach_peer(id);
        }

        if self.ticks % RECHOKE_TICKS == 0 {
            let transitions = self.uploader.rechoke(&mut self.peers);
            for (id, message) in transitions {
                self.send_to(id, &[message]);
            }
        }

        // Assembly retries for records that hit I/O errors.
        if !self.retry_assembly.is_empty() {
            let retry: Vec<PathId> = self.retry_assembly.iter().copied().collect();
            for path_id in retry {
                match self.index.get_meta(&path_id) {
                    Ok(signed) => self.try_assemble(&signed),
                    Err(_) => {
                        self.retry_assembly.remove(&path_id);
                    }
                }
            }
        }

        let interval = self.params.index_interval_secs;
        if interval > 0 && self.ticks % interval == 0 {
            self.run_scan();
        }

        if self.ticks % GC_TICKS == 0 {
            if let Err(e) = self.index.gc_orphan_chunks() {
                self.on_index_error(e);
            }
        }
    }

    fn run_scan(&mut self) {
        let Some(indexer) = &self.indexer else {
            return;
        };
        self.is_indexing = true;
        let produced = match indexer.scan(&mut self.index) {
            Ok(produced) => produced,
            Err(IndexerError::Interrupted) => {
                tracing::info!("scan interrupted");
                self.is_indexing = false;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "scan failed");
                self.is_indexing = false;
                return;
            }
        };
        self.is_indexing = false;

        for signed in produced {
            self.broadcast(
                &Message::HaveMeta {
                    path_id: signed.path_id(),
                    revision: signed.revision(),
                },
                None,
            );
            // Locally indexed FILE chunks are served from open storage;
            // announce them so peers can pull immediately.
            let announce: Vec<Message> = signed
                .meta()
                .chunks
                .iter()
                .map(|chunk| Message::HaveChunk {
                    ct_hash: chunk.ct_hash,
                })
                .collect();
            for message in announce {
                self.broadcast(&message, None);
            }
        }
    }

    fn on_index_error(&mut self, error: IndexError) {
        match error {
            IndexError::Corrupted(e) => {
                // A corrupt database taints the whole folder.
                tracing::error!(
                    folder = hex::encode(&self.folder_id[..8]),
                    error = %e,
                    "database corrupted, folder halted"
                );
                self.active.store(false, Ordering::Relaxed);
                self.peers.clear();
            }
            other => {
                tracing::warn!(error = %other, "index operation failed");
            }
        }
    }

    fn status(&self) -> FolderStatus {
        let counts = self.index.status().unwrap_or_default();
        FolderStatus {
            path: self.params.path.clone(),
            secret: self.params.secret.clone(),
            is_indexing: self.is_indexing,
            files: counts.files,
            directories: counts.directories,
            symlinks: counts.symlinks,
            deleted: counts.deleted,
            peers: self
                .peers
                .iter()
                .flatten()
                .map(|peer| {
                    let totals = peer.bandwidth.totals();
                    let rates = peer.bandwidth.rates();
                    PeerStatus {
                        endpoint: peer.info.endpoint.to_string(),
                        client_name: peer.info.client_name.clone(),
                        user_agent: peer.info.user_agent.clone(),
                        up_bytes: totals.up_bytes,
                        down_bytes: totals.down_bytes,
                        up_bandwidth: rates.up as u64,
                        down_bandwidth: rates.down as u64,
                    }
                })
                .collect(),
        }
    }
}

/// Check `hash.txt` against the configured secret; on mismatch the stored
/// state belongs to a different folder and is wiped.
fn ensure_identity_marker(
    system_path: &Path,
    folder_id: &FolderId,
    index: &mut Index,
) -> Result<()> {
    let marker = system_path.join("hash.txt");
    let expected = hex::encode(folder_id);
    match fs::read_to_string(&marker) {
        Ok(existing) if existing.trim() == expected => Ok(()),
        Ok(_) => {
            tracing::warn!(
                marker = %marker.display(),
                "folder secret changed, wiping stale index"
            );
            index.wipe()?;
            fs::write(&marker, &expected)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::write(&marker, &expected)?;
            Ok(())
        }
        Err(e) => Err(e).context("reading hash.txt"),
    }
}
