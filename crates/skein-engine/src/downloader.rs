//! The downloader — decides which chunk to ask which peer for.
//!
//! Selection policy:
//!   1. Rarest first across the peers attached to the folder, ties broken
//!      by chunk ordinal within the Meta closest to completion.
//!   2. A per-peer in-flight cap bounds memory.
//!   3. Unanswered requests time out, go back into the pool and decay the
//!      slow peer's rank (the folder applies the decay).
//!
//! The downloader owns no peers — it sees the folder's slot table and
//! refers to entries by index, so a disconnect never dangles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use skein_core::crypto::CtHash;
use skein_core::path::PathId;

use crate::peer::{Peer, PeerId};

#[derive(Debug, Clone, Copy)]
struct ChunkNeed {
    path_id: PathId,
    ordinal: usize,
}

#[derive(Debug, Clone, Copy)]
struct Inflight {
    peer: PeerId,
    since: Instant,
}

pub struct Downloader {
    meta_queue: VecDeque<(PathId, i64)>,
    queued_metas: HashSet<(PathId, i64)>,
    chunks: HashMap<CtHash, ChunkNeed>,
    /// Unsatisfied chunk count per meta — the completion tie-breaker.
    meta_remaining: HashMap<PathId, usize>,
    inflight: HashMap<CtHash, Inflight>,
    inflight_per_peer: HashMap<PeerId, usize>,
    cap: usize,
    timeout: Duration,
}

impl Downloader {
    pub fn new(cap: usize, timeout: Duration) -> Self {
        Self {
            meta_queue: VecDeque::new(),
            queued_metas: HashSet::new(),
            chunks: HashMap::new(),
            meta_remaining: HashMap::new(),
            inflight: HashMap::new(),
            inflight_per_peer: HashMap::new(),
            cap,
            timeout,
        }
    }

    /// Queue a meta for download. Returns false if already queued.
    pub fn want_meta(&mut self, path_id: PathId, revision: i64) -> bool {
        if !self.queued_metas.insert((path_id, revision)) {
            return false;
        }
        self.meta_queue.push_back((path_id, revision));
        true
    }

    pub fn pop_meta_request(&mut self) -> Option<(PathId, i64)> {
        let entry = self.meta_queue.pop_front()?;
        self.queued_metas.remove(&entry);
        Some(entry)
    }

    /// The record arrived (or was rejected); allow future re-announcements
    /// to queue it again.
    pub fn meta_done(&mut self, path_id: PathId, revision: i64) {
        if self.queued_metas.remove(&(path_id, revision)) {
            self.meta_queue
                .retain(|entry| *entry != (path_id, revision));
        }
    }

    pub fn want_chunk(&mut self, ct_hash: CtHash, path_id: PathId, ordinal: usize) {
        if self.chunks.contains_key(&ct_hash) {
            return;
        }
        self.chunks.insert(ct_hash, ChunkNeed { path_id, ordinal });
        *self.meta_remaining.entry(path_id).or_insert(0) += 1;
    }

    /// The chunk arrived (or stopped mattering).
    pub fn chunk_done(&mut self, ct_hash: &CtHash) {
        self.clear_inflight(ct_hash);
        if let Some(need) = self.chunks.remove(ct_hash) {
            if let Some(remaining) = self.meta_remaining.get_mut(&need.path_id) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.meta_remaining.remove(&need.path_id);
                }
            }
        }
    }

    /// A request failed (mismatched bytes, dropped peer obligation):
    /// return the chunk to the pool without forgetting the need.
    pub fn release(&mut self, ct_hash: &CtHash) {
        self.clear_inflight(ct_hash);
    }

    fn clear_inflight(&mut self, ct_hash: &CtHash) {
        if let Some(inflight) = self.inflight.remove(ct_hash) {
            if let Some(count) = self.inflight_per_peer.get_mut(&inflight.peer) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn has_work(&self) -> bool {
        !self.chunks.is_empty() || !self.meta_queue.is_empty()
    }

    /// Does this peer's have-set cover anything we still lack?
    pub fn interesting(&self, have: &HashSet<CtHash>) -> bool {
        self.chunks.keys().any(|ct| have.contains(ct))
    }

    /// Assign needed chunks to eligible peers, rarest first.
    pub fn pick_requests(
        &mut self,
        now: Instant,
        peers: &[Option<Peer>],
    ) -> Vec<(PeerId, CtHash)> {
        let rarity = |ct: &CtHash| {
            peers
                .iter()
                .flatten()
                .filter(|peer| peer.have.contains(ct))
                .count()
        };

        let mut candidates: Vec<(CtHash, usize, usize, usize)> = self
            .chunks
            .iter()
            .filter(|(ct, _)| !self.inflight.contains_key(*ct))
            .map(|(ct, need)| {
                let remaining = self.meta_remaining.get(&need.path_id).copied().unwrap_or(0);
                (*ct, rarity(ct), remaining, need.ordinal)
            })
            .collect();
        candidates.sort_by_key(|&(_, rarity, remaining, ordinal)| (rarity, remaining, ordinal));

        let mut assigned = Vec::new();
        for (ct_hash, rarity, _, _) in candidates {
            if rarity == 0 {
                continue; // nobody has it yet
            }
            let best = peers
                .iter()
                .enumerate()
                .filter_map(|(id, slot)| slot.as_ref().map(|peer| (id, peer)))
                .filter(|(id, peer)| {
                    peer.have.contains(&ct_hash)
                        && !peer.peer_choking
                        && self.inflight_count(*id) < self.cap
                })
                .max_by(|(a_id, a), (b_id, b)| {
                    // Prefer higher rank, then the emptier pipeline.
                    a.rank.partial_cmp(&b.rank).unwrap_or(std::cmp::Ordering::Equal).then(
                        self.inflight_count(*b_id).cmp(&self.inflight_count(*a_id)),
                    )
                })
                .map(|(id, _)| id);

            if let Some(peer) = best {
                self.inflight.insert(ct_hash, Inflight { peer, since: now });
                *self.inflight_per_peer.entry(peer).or_insert(0) += 1;
                assigned.push((peer, ct_hash));
            }
        }
        assigned
    }

    fn inflight_count(&self, peer: PeerId) -> usize {
        self.inflight_per_peer.get(&peer).copied().unwrap_or(0)
    }

    /// Collect requests that outlived the timeout. They return to the pool;
    /// the caller cancels them on the wire and decays the peer's rank.
    pub fn expire(&mut self, now: Instant) -> Vec<(PeerId, CtHash)> {
        let timeout = self.timeout;
        let expired: Vec<(CtHash, PeerId)> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| now.duration_since(inflight.since) >= timeout)
            .map(|(ct, inflight)| (*ct, inflight.peer))
            .collect();
        let mut out = Vec::new();
        for (ct_hash, peer) in expired {
            self.clear_inflight(&ct_hash);
            out.push((peer, ct_hash));
        }
        out
    }

    /// Forget a disconnected peer: its in-flight requests go back to the pool.
    pub fn drop_peer(&mut self, peer: PeerId) {
        let orphaned: Vec<CtHash> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.peer == peer)
            .map(|(ct, _)| *ct)
            .collect();
        for ct_hash in orphaned {
            self.clear_inflight(&ct_hash);
        }
        self.inflight_per_peer.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerInfo;
    use tokio::sync::mpsc;

    fn peer_with(have: &[CtHash]) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx); // keep the writer "alive" for the test
        let mut peer = Peer::new(
            PeerInfo {
                digest: [0; 32],
                endpoint: "127.0.0.1:1".parse().unwrap(),
                client_name: String::new(),
                user_agent: String::new(),
            },
            tx,
        );
        peer.peer_choking = false;
        peer.have = have.iter().copied().collect();
        peer
    }

    fn ct(n: u8) -> CtHash {
        [n; 28]
    }

    #[test]
    fn rarest_chunk_is_requested_first() {
        // A has {c1,c2,c3}, B has {c1}, C has {c1,c2}: rarity orders c3, c2, c1.
        let peers = vec![
            Some(peer_with(&[ct(1), ct(2), ct(3)])),
            Some(peer_with(&[ct(1)])),
            Some(peer_with(&[ct(1), ct(2)])),
        ];
        let mut downloader = Downloader::new(16, Duration::from_secs(10));
        downloader.want_chunk(ct(1), [9; 32], 0);
        downloader.want_chunk(ct(2), [9; 32], 1);
        downloader.want_chunk(ct(3), [9; 32], 2);

        let order: Vec<CtHash> = downloader
            .pick_requests(Instant::now(), &peers)
            .into_iter()
            .map(|(_, ct)| ct)
            .collect();
        assert_eq!(order, vec![ct(3), ct(2), ct(1)]);
    }

    #[test]
    fn ties_prefer_the_meta_closest_to_completion() {
        let peers = vec![Some(peer_with(&[ct(1), ct(2), ct(3)]))];
        let mut downloader = Downloader::new(16, Duration::from_secs(10));
        // Meta A still needs two chunks, meta B needs one.
        downloader.want_chunk(ct(1), [1; 32], 0);
        downloader.want_chunk(ct(2), [1; 32], 1);
        downloader.want_chunk(ct(3), [2; 32], 0);

        let order: Vec<CtHash> = downloader
            .pick_requests(Instant::now(), &peers)
            .into_iter()
            .map(|(_, ct)| ct)
            .collect();
        assert_eq!(order[0], ct(3), "the nearly-complete meta goes first");
    }

    #[test]
    fn per_peer_cap_limits_assignments() {
        let peers = vec![Some(peer_with(&[ct(1), ct(2), ct(3)]))];
        let mut downloader = Downloader::new(2, Duration::from_secs(10));
        for n in 1..=3 {
            downloader.want_chunk(ct(n), [1; 32], n as usize);
        }
        let assigned = downloader.pick_requests(Instant::now(), &peers);
        assert_eq!(assigned.len(), 2);
        // Completing one frees a slot.
        downloader.chunk_done(&assigned[0].1);
        assert_eq!(downloader.pick_requests(Instant::now(), &peers).len(), 1);
    }

    #[test]
    fn choked_peers_are_not_asked() {
        let mut choked = peer_with(&[ct(1)]);
        choked.peer_choking = true;
        let peers = vec![Some(choked)];
        let mut downloader = Downloader::new(16, Duration::from_secs(10));
        downloader.want_chunk(ct(1), [1; 32], 0);
        assert!(downloader.pick_requests(Instant::now(), &peers).is_empty());
    }

    #[test]
    fn timeouts_requeue_elsewhere() {
        let peers = vec![
            Some(peer_with(&[ct(1)])),
            Some(peer_with(&[ct(1)])),
        ];
        let mut downloader = Downloader::new(16, Duration::from_millis(0));
        downloader.want_chunk(ct(1), [1; 32], 0);

        let first = downloader.pick_requests(Instant::now(), &peers);
        assert_eq!(first.len(), 1);
        let slow_peer = first[0].0;

        // Timeout of zero: instantly expired.
        let expired = downloader.expire(Instant::now());
        assert_eq!(expired, vec![(slow_peer, ct(1))]);

        // The chunk is requestable again (possibly from the other peer).
        let second = downloader.pick_requests(Instant::now(), &peers);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn drop_peer_returns_its_inflight_to_the_pool() {
        let peers = vec![Some(peer_with(&[ct(1)])), Some(peer_with(&[ct(1)]))];
        let mut downloader = Downloader::new(16, Duration::from_secs(10));
        downloader.want_chunk(ct(1), [1; 32], 0);

        let assigned = downloader.pick_requests(Instant::now(), &peers);
        let holder = assigned[0].0;
        downloader.drop_peer(holder);

        let reassigned = downloader.pick_requests(Instant::now(), &peers);
        assert_eq!(reassigned.len(), 1);
    }

    #[test]
    fn interest_follows_needed_chunks() {
        let mut downloader = Downloader::new(16, Duration::from_secs(10));
        let have: HashSet<CtHash> = [ct(5)].into_iter().collect();
        assert!(!downloader.interesting(&have));

        downloader.want_chunk(ct(5), [1; 32], 0);
        assert!(downloader.interesting(&have));

        downloader.chunk_done(&ct(5));
        assert!(!downloader.interesting(&have));
    }

    #[test]
    fn meta_queue_dedupes() {
        let mut downloader = Downloader::new(16, Duration::from_secs(10));
        assert!(downloader.want_meta([1; 32], 5));
        assert!(!downloader.want_meta([1; 32], 5));
        assert!(downloader.want_meta([1; 32], 6));
        assert_eq!(downloader.pop_meta_request(), Some(([1; 32], 5)));
        assert_eq!(downloader.pop_meta_request(), Some(([1; 32], 6)));
        assert_eq!(downloader.pop_meta_request(), None);
    }
}
