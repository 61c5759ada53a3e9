//! The uploader — serves block requests and runs the choking policy.
//!
//! A block is served iff we are not choking the peer and the peer declared
//! interest. Requests for chunks we don't hold are logged and dropped —
//! no negative reply exists in the protocol.
//!
//! Choking: the top-K peers by what they've been sending us stay unchoked
//! (reciprocation), plus one randomly chosen interested peer as the
//! optimistic slot so fresh peers can bootstrap.

use rand::seq::SliceRandom;

use skein_core::crypto::CtHash;
use skein_core::proto::Message;

use crate::index::Index;
use crate::peer::{Peer, PeerId};
use crate::storage::{ChunkStorage, StorageError};

pub struct Uploader {
    /// Reciprocation slots, not counting the optimistic one.
    slots: usize,
}

impl Uploader {
    pub fn new(slots: usize) -> Self {
        Self { slots: slots.max(1) }
    }

    /// Answer one BlockRequest, if policy and storage allow.
    pub fn serve(
        &self,
        index: &mut Index,
        storage: &mut ChunkStorage,
        peer: &Peer,
        ct_hash: CtHash,
        offset: u32,
        size: u32,
    ) -> Option<Message> {
        if peer.am_choking || !peer.peer_interested {
            tracing::trace!(
                peer = hex::encode(&peer.info.digest[..8]),
                "block request while choked or uninterested"
            );
            return None;
        }
        let ciphertext = match storage.get_ciphertext(index, &ct_hash) {
            Ok(bytes) => bytes,
            Err(StorageError::NoSuchChunk) => {
                tracing::debug!(
                    ct_hash = hex::encode(&ct_hash[..8]),
                    "requested chunk not stored"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "block read failed");
                return None;
            }
        };

        let start = offset as usize;
        let end = start.checked_add(size as usize)?.min(ciphertext.len());
        if start >= end {
            return None;
        }
        Some(Message::BlockReply {
            ct_hash,
            offset,
            data: ciphertext[start..end].to_vec(),
        })
    }

    /// Re-evaluate choking across all peers. Returns the state transitions
    /// to put on the wire.
    pub fn rechoke(&self, peers: &mut [Option<Peer>]) -> Vec<(PeerId, Message)> {
        let mut interested: Vec<(PeerId, f64)> = peers
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|peer| (id, peer)))
            .filter(|(_, peer)| peer.peer_interested)
            .map(|(id, peer)| (id, peer.bandwidth.rates().down))
            .collect();
        interested.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut unchoked: Vec<PeerId> = interested
            .iter()
            .take(self.slots)
            .map(|(id, _)| *id)
            .collect();

        // One optimistic slot among the rest.
        let remainder: Vec<PeerId> = interested
            .iter()
            .skip(self.slots)
            .map(|(id, _)| *id)
            .collect();
        if let Some(lucky) = remainder.choose(&mut rand::thread_rng()) {
            unchoked.push(*lucky);
        }

        let mut transitions = Vec::new();
        for (id, slot) in peers.iter_mut().enumerate() {
            let Some(peer) = slot.as_mut() else { continue };
            let should_choke = !unchoked.contains(&id);
            if let Some(message) = peer.set_choking(should_choke) {
                transitions.push((id, message));
            }
        }
        transitions
    }
}
