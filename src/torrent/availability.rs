use wire::bitfield::Bitfield;

/// How many connected peers hold each piece. Advisory: counts feed piece
/// priorities, and a stale count costs nothing but a slightly worse pick.
/// Only the coordinator task mutates it, so updates apply in order.
#[derive(Debug, Clone)]
pub struct Availability {
    counts: Vec<u32>,
}

impl Availability {
    pub fn new(total_pieces: usize) -> Self {
        Availability {
            counts: vec![0; total_pieces],
        }
    }

    pub fn inc(&mut self, index: u32) {
        if let Some(count) = self.counts.get_mut(index as usize) {
            *count = count.saturating_add(1);
        }
    }

    pub fn dec(&mut self, index: u32) {
        if let Some(count) = self.counts.get_mut(index as usize) {
            *count = count.saturating_sub(1);
        }
    }

    /// Applies a whole bitfield at once, one increment per set bit.
    pub fn inc_all(&mut self, bitfield: &Bitfield) {
        for index in 0..self.counts.len() {
            if bitfield.has_piece(index) {
                self.inc(index as u32);
            }
        }
    }

    /// Reverse of [`Availability::inc_all`], used when a peer departs.
    pub fn dec_all(&mut self, bitfield: &Bitfield) {
        for index in 0..self.counts.len() {
            if bitfield.has_piece(index) {
                self.dec(index as u32);
            }
        }
    }

    pub fn count(&self, index: u32) -> u32 {
        self.counts.get(index as usize).copied().unwrap_or(0)
    }

    pub fn piece_count(&self) -> usize {
        self.counts.len()
    }
}
