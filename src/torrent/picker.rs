use std::collections::HashMap;

use wire::{message::Message, piece::Piece};

use crate::torrent::{
    availability::Availability, peers::PeerState, timeout::RequestTimeouts,
};

/// Decides which blocks to request from which peers.
///
/// Peers are served fastest first so the best uploaders always have a full
/// pipeline. For each peer the picker walks pieces in urgency order,
/// in-progress before untouched and rare before common, and tops the
/// peer's pipeline up to its depth. Blocks are marked requested as they
/// are handed out, so no block is ever offered to two peers in one round.
#[derive(Debug)]
pub struct PiecePicker {
    pipeline_depth: usize,
}

impl PiecePicker {
    pub fn new(pipeline_depth: usize) -> Self {
        PiecePicker { pipeline_depth }
    }

    /// Returns the Request messages to send, grouped per peer. Ties in
    /// rate and urgency always resolve the same way (address, then piece
    /// index), keeping rounds reproducible.
    pub fn pick(
        &self,
        peers: &HashMap<String, PeerState>,
        pieces: &mut HashMap<u32, Piece>,
        availability: &Availability,
        timeouts: &RequestTimeouts,
    ) -> Vec<(String, Vec<Message>)> {
        let mut ranked: Vec<(&String, f64)> = peers
            .iter()
            .filter(|(_, peer)| peer.wire.can_download())
            .map(|(addr, peer)| (addr, peer.download.rate()))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut picks = Vec::new();

        for (addr, _) in ranked {
            let peer = match peers.get(addr) {
                Some(peer) => peer,
                None => continue,
            };
            let mut budget = self
                .pipeline_depth
                .saturating_sub(timeouts.pending_count(addr));
            if budget == 0 {
                continue;
            }

            // Rebuilt per peer: earlier peers in this round may have
            // claimed the free blocks a piece had.
            let mut candidates: Vec<(u32, u32)> = pieces
                .iter()
                .filter(|(index, piece)| {
                    peer.bitfield.has_piece(**index as usize) && piece.has_free_blocks()
                })
                .map(|(index, piece)| (*index, piece.priority(availability.count(*index))))
                .collect();
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let mut requests = Vec::new();
            for (index, _) in candidates {
                if budget == 0 {
                    break;
                }
                let Some(piece) = pieces.get_mut(&index) else {
                    continue;
                };
                let taken = piece.take_blocks(budget);
                budget -= taken.len();
                requests.extend(taken);
            }

            if !requests.is_empty() {
                picks.push((addr.clone(), requests));
            }
        }

        picks
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use wire::piece::BLOCK_SIZE;

    use super::*;

    const PIECE_LEN: u32 = BLOCK_SIZE * 10;

    fn full_peer(addr: &str, total_pieces: u32, rate_bytes: u64) -> PeerState {
        let start = Instant::now();
        let mut peer = PeerState::new(addr.to_string(), [0u8; 20], total_pieces, start);
        peer.wire.am_interested = true;
        peer.wire.peer_choking = false;
        for index in 0..total_pieces {
            peer.bitfield.set_piece(index as usize);
        }
        peer.download.record(rate_bytes);
        peer.download.sample(start + Duration::from_secs(1));
        peer
    }

    fn pieces_of(count: u32) -> HashMap<u32, Piece> {
        (0..count)
            .map(|index| (index, Piece::new(index, PIECE_LEN, [0u8; 20])))
            .collect()
    }

    #[test]
    fn three_full_peers_each_fill_their_pipeline_on_a_distinct_piece() {
        let picker = PiecePicker::new(10);
        let mut pieces = pieces_of(3);
        let availability = Availability::new(3);
        let timeouts = RequestTimeouts::new();

        let peers: HashMap<String, PeerState> = ["a:1", "b:1", "c:1"]
            .iter()
            .map(|addr| (addr.to_string(), full_peer(addr, 3, 100)))
            .collect();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        assert_eq!(picks.len(), 3);
        let mut taken_pieces = Vec::new();
        for (_, requests) in &picks {
            assert_eq!(requests.len(), 10);

            // All ten requests of a peer target the same piece, at
            // ascending non-overlapping offsets.
            let mut indices: Vec<u32> = Vec::new();
            let mut begins: Vec<u32> = Vec::new();
            for request in requests {
                if let Message::Request { index, begin, length } = request {
                    indices.push(*index);
                    begins.push(*begin);
                    assert_eq!(*length, BLOCK_SIZE);
                }
            }
            assert_eq!(indices.len(), 10);
            assert!(indices.windows(2).all(|w| w[0] == w[1]));
            assert!(begins.windows(2).all(|w| w[0] < w[1]));
            taken_pieces.push(indices[0]);
        }
        taken_pieces.sort_unstable();
        assert_eq!(taken_pieces, vec![0, 1, 2]);
    }

    #[test]
    fn outstanding_requests_shrink_the_budget() {
        let picker = PiecePicker::new(10);
        let mut pieces = pieces_of(1);
        let availability = Availability::new(1);
        let mut timeouts = RequestTimeouts::new();

        let now = Instant::now();
        for i in 0..7 {
            timeouts.add_block("a:1", 0, i * BLOCK_SIZE, now);
        }

        let peers: HashMap<String, PeerState> =
            [("a:1".to_string(), full_peer("a:1", 1, 100))].into();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].1.len(), 3);
    }

    #[test]
    fn fastest_peer_is_served_first() {
        let picker = PiecePicker::new(10);
        let mut pieces = pieces_of(1);
        let availability = Availability::new(1);
        let timeouts = RequestTimeouts::new();

        let peers: HashMap<String, PeerState> = [
            ("slow:1".to_string(), full_peer("slow:1", 1, 10)),
            ("fast:1".to_string(), full_peer("fast:1", 1, 10_000)),
        ]
        .into();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        // One piece with ten blocks: the fast peer drains it, the slow
        // one has nothing left to take.
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].0, "fast:1");
        assert_eq!(picks[0].1.len(), 10);
    }

    #[test]
    fn rarer_pieces_are_requested_first() {
        let picker = PiecePicker::new(10);
        let mut pieces = pieces_of(2);
        let mut availability = Availability::new(2);
        for _ in 0..5 {
            availability.inc(0);
        }
        availability.inc(1);

        let timeouts = RequestTimeouts::new();
        let peers: HashMap<String, PeerState> =
            [("a:1".to_string(), full_peer("a:1", 2, 100))].into();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        for request in &picks[0].1 {
            if let Message::Request { index, .. } = request {
                assert_eq!(*index, 1);
            }
        }
    }

    #[test]
    fn in_progress_pieces_outrank_rarer_untouched_ones() {
        let picker = PiecePicker::new(5);
        let mut pieces = pieces_of(2);
        let mut availability = Availability::new(2);
        for _ in 0..8 {
            availability.inc(0);
        }
        availability.inc(1);

        // Piece 0 is common but already started.
        if let Some(piece) = pieces.get_mut(&0) {
            piece.take_blocks(3);
        }

        let timeouts = RequestTimeouts::new();
        let peers: HashMap<String, PeerState> =
            [("a:1".to_string(), full_peer("a:1", 2, 100))].into();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        assert_eq!(picks[0].1.len(), 5);
        for request in &picks[0].1 {
            if let Message::Request { index, .. } = request {
                assert_eq!(*index, 0);
            }
        }
    }

    #[test]
    fn choked_or_indifferent_peers_get_nothing() {
        let picker = PiecePicker::new(10);
        let mut pieces = pieces_of(1);
        let availability = Availability::new(1);
        let timeouts = RequestTimeouts::new();

        let mut choked = full_peer("choked:1", 1, 100);
        choked.wire.peer_choking = true;
        let mut indifferent = full_peer("meh:1", 1, 100);
        indifferent.wire.am_interested = false;

        let peers: HashMap<String, PeerState> = [
            ("choked:1".to_string(), choked),
            ("meh:1".to_string(), indifferent),
        ]
        .into();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        assert!(picks.is_empty());
    }

    #[test]
    fn peers_only_get_pieces_they_have() {
        let picker = PiecePicker::new(10);
        let mut pieces = pieces_of(2);
        let availability = Availability::new(2);
        let timeouts = RequestTimeouts::new();

        let start = Instant::now();
        let mut peer = PeerState::new("a:1".to_string(), [0u8; 20], 2, start);
        peer.wire.am_interested = true;
        peer.wire.peer_choking = false;
        peer.bitfield.set_piece(1);

        let peers: HashMap<String, PeerState> = [("a:1".to_string(), peer)].into();

        let picks = picker.pick(&peers, &mut pieces, &availability, &timeouts);

        assert_eq!(picks.len(), 1);
        for request in &picks[0].1 {
            if let Message::Request { index, .. } = request {
                assert_eq!(*index, 1);
            }
        }
    }
}
