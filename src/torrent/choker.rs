use std::collections::HashMap;

use rand::{rngs::StdRng, Rng};

use crate::torrent::peers::PeerState;

/// Peers that were never unchoked get this many raffle tickets in the
/// optimistic draw, so fresh connections are probed quickly.
const NEW_PEER_WEIGHT: usize = 3;

/// The unchoke decisions of one choke round, as deltas against the
/// current per-peer state. The caller applies them, sends the Choke and
/// Unchoke messages, and moves the optimistic flag.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeRound {
    pub unchoke: Vec<String>,
    pub choke: Vec<String>,
    pub previous_optimistic: Option<String>,
    pub optimistic: Option<String>,
}

/// Periodically re-ranks peers and decides who may request from us.
///
/// Regular slots go to the fastest peers, counting only interested ones
/// against the budget; faster uninterested peers ride along unchoked for
/// free. On top of that one optimistic slot is raffled among currently
/// choked peers so slow or unproven peers still get a chance to trade.
#[derive(Debug)]
pub struct Choker {
    slots: usize,
    rng: StdRng,
    optimistic: Option<String>,
}

impl Choker {
    pub fn new(slots: usize, rng: StdRng) -> Self {
        Choker {
            slots,
            rng,
            optimistic: None,
        }
    }

    pub fn optimistic(&self) -> Option<&String> {
        self.optimistic.as_ref()
    }

    /// Drops a departed peer's claim on the optimistic slot.
    pub fn peer_removed(&mut self, addr: &str) {
        if self.optimistic.as_deref() == Some(addr) {
            self.optimistic = None;
        }
    }

    /// Runs one choke round. When `change_optimistic` is set, the
    /// optimistic slot is re-raffled first; the outgoing holder then
    /// competes for a regular slot like anyone else. While seeding, rank
    /// by what we send peers instead of what they send us.
    pub fn rerank(
        &mut self,
        peers: &HashMap<String, PeerState>,
        is_seed: bool,
        change_optimistic: bool,
    ) -> ChokeRound {
        let mut round = ChokeRound::default();

        if change_optimistic {
            if let Some(winner) = self.draw_optimistic(peers) {
                round.previous_optimistic = self.optimistic.replace(winner);
                if round.previous_optimistic == self.optimistic {
                    round.previous_optimistic = None;
                }
            }
        }

        // Rank everyone except the optimistic holder, who is unchoked
        // outside the rate competition.
        let mut ranked: Vec<(&String, f64, bool)> = peers
            .iter()
            .filter(|(addr, _)| Some(*addr) != self.optimistic.as_ref())
            .map(|(addr, peer)| {
                let rate = if is_seed {
                    peer.upload.rate()
                } else {
                    peer.download.rate()
                };
                (addr, rate, peer.wire.peer_interested)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(b.0))
        });

        let mut budget = self.slots;
        if let Some(addr) = &self.optimistic {
            let holder_interested = peers.get(addr).is_some_and(|p| p.wire.peer_interested);
            if holder_interested {
                budget = budget.saturating_sub(1);
            }
        }

        // Cutoff sits at the last interested peer inside the budget; when
        // the budget outlasts the interested peers, everyone stays
        // unchoked.
        let mut cutoff = None;
        if budget > 0 {
            let mut interested_seen = 0;
            for (i, entry) in ranked.iter().enumerate() {
                if entry.2 {
                    interested_seen += 1;
                    if interested_seen == budget {
                        cutoff = Some(i);
                        break;
                    }
                }
            }
            if cutoff.is_none() && !ranked.is_empty() {
                cutoff = Some(ranked.len() - 1);
            }
        }

        for (i, (addr, _, _)) in ranked.iter().enumerate() {
            let Some(peer) = peers.get(*addr) else {
                continue;
            };
            let keep = cutoff.is_some_and(|c| i <= c);
            if keep && peer.wire.am_choking {
                round.unchoke.push((*addr).clone());
            } else if !keep && !peer.wire.am_choking {
                round.choke.push((*addr).clone());
            }
        }

        if let Some(addr) = &self.optimistic {
            let holder_choked = peers.get(addr).map_or(false, |p| p.wire.am_choking);
            if holder_choked {
                round.unchoke.push(addr.clone());
            }
        }

        round.optimistic = self.optimistic.clone();
        round
    }

    /// Weighted draw among the peers we are currently choking. Returns
    /// None when nobody is eligible, leaving the current holder in place.
    fn draw_optimistic(&mut self, peers: &HashMap<String, PeerState>) -> Option<String> {
        let mut choked: Vec<(&String, bool)> = peers
            .iter()
            .filter(|(_, peer)| peer.wire.am_choking)
            .map(|(addr, peer)| (addr, peer.wire.is_new))
            .collect();
        choked.sort_by(|a, b| a.0.cmp(b.0));

        let mut tickets = Vec::new();
        for (addr, is_new) in choked {
            let weight = if is_new { NEW_PEER_WEIGHT } else { 1 };
            for _ in 0..weight {
                tickets.push(addr);
            }
        }
        if tickets.is_empty() {
            return None;
        }

        let winner = tickets[self.rng.gen_range(0..tickets.len())];
        Some(winner.clone())
    }
}
