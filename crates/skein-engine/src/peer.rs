//! Per-peer protocol state, owned by the folder actor.
//!
//! The transport (socket, encryption, framing) lives in the daemon; the
//! engine sees a peer as an identity, an outbound byte queue and the
//! mirrored protocol flags. The downloader refers to peers only by their
//! slot index, so dropping a peer never needs coordination.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use skein_core::crypto::CtHash;
use skein_core::proto::Message;
use skein_core::transport::NodeDigest;

use crate::bandwidth::BandwidthCounter;

/// Slot index into the folder's peer table.
pub type PeerId = usize;

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub digest: NodeDigest,
    pub endpoint: SocketAddr,
    pub client_name: String,
    pub user_agent: String,
}

pub struct Peer {
    pub info: PeerInfo,
    outbound: mpsc::UnboundedSender<Bytes>,

    /// We refuse to serve them blocks.
    pub am_choking: bool,
    /// They hold chunks we lack.
    pub am_interested: bool,
    /// Mirror of their choke toward us.
    pub peer_choking: bool,
    /// Mirror of their interest in us.
    pub peer_interested: bool,

    /// Chunks the peer has announced.
    pub have: HashSet<CtHash>,

    pub bandwidth: BandwidthCounter,
    pub last_recv: Instant,
    /// Scheduling rank, decayed when the peer times out on us.
    pub rank: f64,
}

impl Peer {
    pub fn new(info: PeerInfo, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            info,
            outbound,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            have: HashSet::new(),
            bandwidth: BandwidthCounter::new(),
            last_recv: Instant::now(),
            rank: 1.0,
        }
    }

    /// Encode and queue a message. Returns false when the connection's
    /// writer is gone — the caller should drop the peer.
    pub fn send(&mut self, message: &Message) -> bool {
        let frame = message.encode();
        self.bandwidth.add_up(frame.len(), message.payload_len());
        self.outbound.send(Bytes::from(frame)).is_ok()
    }

    pub fn note_received(&mut self, frame_len: usize, payload_len: usize) {
        self.bandwidth.add_down(frame_len, payload_len);
        self.last_recv = Instant::now();
    }

    /// Flip our interest flag; returns the message to send, if any.
    pub fn set_interested(&mut self, interested: bool) -> Option<Message> {
        if self.am_interested == interested {
            return None;
        }
        self.am_interested = interested;
        Some(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        })
    }

    /// Flip our choke toward the peer; returns the message to send, if any.
    pub fn set_choking(&mut self, choking: bool) -> Option<Message> {
        if self.am_choking == choking {
            return None;
        }
        self.am_choking = choking;
        Some(if choking {
            Message::Choke
        } else {
            Message::Unchoke
        })
    }
}
