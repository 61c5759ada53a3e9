//! Multi-peer integration harness.
//!
//! Folder actors are driven synchronously: every node runs in-process and
//! peers are bridged with in-memory links, so message interleavings and
//! tick timing are deterministic. `Net::settle` alternates "deliver all
//! queued frames" with "tick every node" until the network quiesces —
//! the in-test analog of waiting for real peers to go idle.

mod convergence;
mod relay;

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use skein_core::config::{ArchiveStrategy, FolderParams, GlobalConfig};
use skein_core::path::PathId;
use skein_core::proto::FrameDecoder;
use skein_core::secret::{Capability, Secret};
use skein_engine::folder::{FolderActor, FolderEvent, FolderStatus};
use skein_engine::peer::{PeerId, PeerInfo};

pub struct TestNode {
    pub dir: tempfile::TempDir,
    pub actor: FolderActor,
}

impl TestNode {
    pub fn new(root_secret: &Secret, level: Capability) -> TestNode {
        let secret = root_secret.derive(level).expect("derivable tier");
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();

        let params = FolderParams {
            secret: secret.to_string(),
            path: dir.path().join("data"),
            system_path: dir.path().join("system"),
            index_interval_secs: 0,
            normalize_unicode: false,
            archive_strategy: ArchiveStrategy::Trash,
            ..FolderParams::default()
        };
        let (actor, _handle) = FolderActor::new(params, &GlobalConfig::default()).unwrap();
        TestNode { dir, actor }
    }

    pub fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn write(&self, rel: &str, bytes: &[u8]) {
        let path = self.data().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.data().join(rel)).ok()
    }

    pub fn scan(&mut self) {
        self.actor.handle_event(FolderEvent::IndexScan);
    }

    pub fn status(&mut self) -> FolderStatus {
        let (reply, mut rx) = oneshot::channel();
        self.actor.handle_event(FolderEvent::Status { reply });
        rx.try_recv().expect("status answered synchronously")
    }

    /// The `path_id → revision` map — the convergence criterion.
    pub fn revisions(&self) -> BTreeMap<PathId, i64> {
        self.actor
            .index()
            .all_metas()
            .unwrap()
            .into_iter()
            .map(|signed| (signed.path_id(), signed.revision()))
            .collect()
    }

    pub fn all_assembled(&self) -> bool {
        self.actor
            .index()
            .all_metas()
            .unwrap()
            .iter()
            .all(|signed| self.actor.index().is_assembled(&signed.path_id()).unwrap())
    }

    pub fn archive_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("system/archive"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn attach(&mut self, digest: [u8; 32], outbound: mpsc::UnboundedSender<Bytes>) -> PeerId {
        let (reply, mut rx) = oneshot::channel();
        self.actor.handle_event(FolderEvent::PeerConnected {
            info: PeerInfo {
                digest,
                endpoint: "127.0.0.1:0".parse().unwrap(),
                client_name: "test-node".into(),
                user_agent: "skein/test".into(),
            },
            outbound,
            reply,
        });
        rx.try_recv().expect("attach answered synchronously")
    }
}

/// One direction of a link: frames leaving one node and the peer slot
/// they arrive on at the destination.
struct Flow {
    to: usize,
    rx: mpsc::UnboundedReceiver<Bytes>,
    decoder: FrameDecoder,
    /// The sender's slot id inside the destination's peer table.
    sender_id: PeerId,
}

pub struct Net {
    pub nodes: Vec<TestNode>,
    flows: Vec<Flow>,
}

impl Net {
    pub fn new(nodes: Vec<TestNode>) -> Net {
        Net {
            nodes,
            flows: Vec::new(),
        }
    }

    /// Bridge two nodes with an in-memory bidirectional link.
    pub fn connect(&mut self, a: usize, b: usize) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let b_on_a = self.nodes[a].attach(digest_for(b), tx_a);
        let a_on_b = self.nodes[b].attach(digest_for(a), tx_b);

        // Frames a queues for b drain from rx_a into b's mailbox.
        self.flows.push(Flow {
            to: b,
            rx: rx_a,
            decoder: FrameDecoder::new(),
            sender_id: a_on_b,
        });
        self.flows.push(Flow {
            to: a,
            rx: rx_b,
            decoder: FrameDecoder::new(),
            sender_id: b_on_a,
        });
    }

    /// Deliver every queued frame once. Returns whether anything moved.
    pub fn pump_once(&mut self) -> bool {
        let Net { nodes, flows } = self;
        let mut moved = false;
        for flow in flows.iter_mut() {
            while let Ok(frame) = flow.rx.try_recv() {
                flow.decoder.extend(&frame);
            }
            while let Some((message, frame_len)) = flow.decoder.next().unwrap() {
                nodes[flow.to].actor.handle_event(FolderEvent::PeerMessage {
                    peer: flow.sender_id,
                    message,
                    frame_len,
                });
                moved = true;
            }
        }
        moved
    }

    /// Run the network to quiescence: drain, tick, repeat. Forty ticks
    /// cover several rechoke rounds and every retry path the engine has.
    pub fn settle(&mut self) {
        for _ in 0..40 {
            while self.pump_once() {}
            for node in &mut self.nodes {
                node.actor.on_tick();
            }
        }
        while self.pump_once() {}
    }

    pub fn converged(&self) -> bool {
        let reference = self.nodes[0].revisions();
        self.nodes.iter().all(|node| node.revisions() == reference)
    }
}

fn digest_for(index: usize) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest[0] = index as u8 + 1;
    digest
}

/// Deterministic pseudo-random content, distinct per seed.
pub fn blob(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
