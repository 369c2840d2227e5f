use crate::error::WireError;
use crate::message::Message;

/// Transfer block size. Every block of a piece is this long except possibly
/// the last one.
pub const BLOCK_SIZE: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Requested,
    Have,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    NotStarted,
    BlocksNeeded,
    FullyRequested,
    Complete,
}

/// Download state of a single piece: which 16 KiB blocks are still free,
/// requested from some peer, or already received. Block data never lives
/// here; blocks go to disk as they arrive.
#[derive(Debug, Clone)]
pub struct Piece {
    index: u32,
    length: u32,
    hash: [u8; 20],
    blocks: Vec<BlockState>,
    free: usize,
    have: usize,
}

impl Piece {
    pub fn new(index: u32, length: u32, hash: [u8; 20]) -> Self {
        let count = length.div_ceil(BLOCK_SIZE) as usize;
        Piece {
            index,
            length,
            hash,
            blocks: vec![BlockState::Free; count],
            free: count,
            have: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_free_blocks(&self) -> bool {
        self.free > 0
    }

    /// Derived from the per-state counters, so O(1).
    pub fn state(&self) -> PieceState {
        let total = self.blocks.len();
        if self.have == total {
            PieceState::Complete
        } else if self.free == total {
            PieceState::NotStarted
        } else if self.free == 0 {
            PieceState::FullyRequested
        } else {
            PieceState::BlocksNeeded
        }
    }

    /// Urgency rank for the picker: complete pieces are 0, any piece with
    /// requested or received blocks outranks untouched ones, and within each
    /// band rarer pieces rank higher. Monotonic in state and availability,
    /// O(1) to recompute.
    pub fn priority(&self, availability: u32) -> u32 {
        const RARITY_CAP: u32 = 255;
        match self.state() {
            PieceState::Complete => 0,
            PieceState::NotStarted => 1 + (RARITY_CAP - availability.min(RARITY_CAP)),
            _ => 1 + RARITY_CAP + 1 + (RARITY_CAP - availability.min(RARITY_CAP)),
        }
    }

    /// Claims up to `max` free blocks in ascending offset order, marking
    /// them requested, and returns the request messages to send.
    pub fn take_blocks(&mut self, max: usize) -> Vec<Message> {
        let mut requests = Vec::new();
        if max == 0 {
            return requests;
        }
        let index = self.index;
        let length = self.length;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if requests.len() == max {
                break;
            }
            if *block == BlockState::Free {
                *block = BlockState::Requested;
                let begin = i as u32 * BLOCK_SIZE;
                requests.push(Message::Request {
                    index,
                    begin,
                    length: (length - begin).min(BLOCK_SIZE),
                });
            }
        }
        self.free -= requests.len();
        requests
    }

    /// Reverts a requested block to free (request timed out, was cancelled,
    /// or its peer choked us). Blocks in any other state are untouched.
    pub fn return_block(&mut self, begin: u32) -> bool {
        match self.block_index(begin) {
            Some(i) if self.blocks[i] == BlockState::Requested => {
                self.blocks[i] = BlockState::Free;
                self.free += 1;
                true
            }
            _ => false,
        }
    }

    /// Records that the block at `begin` arrived. `Ok(true)` when newly
    /// marked, `Ok(false)` for a duplicate delivery. Late blocks whose
    /// request was already returned are accepted.
    pub fn mark_have(&mut self, begin: u32) -> Result<bool, WireError> {
        let i = self
            .block_index(begin)
            .ok_or(WireError::BlockOutOfBounds {
                piece: self.index,
                begin,
            })?;
        match self.blocks[i] {
            BlockState::Have => Ok(false),
            BlockState::Free => {
                self.blocks[i] = BlockState::Have;
                self.free -= 1;
                self.have += 1;
                Ok(true)
            }
            BlockState::Requested => {
                self.blocks[i] = BlockState::Have;
                self.have += 1;
                Ok(true)
            }
        }
    }

    /// Returns a block to free regardless of its state; used when a disk
    /// write for an already-received block fails and it must be fetched
    /// again.
    pub fn clear_block(&mut self, begin: u32) {
        if let Some(i) = self.block_index(begin) {
            match self.blocks[i] {
                BlockState::Free => {}
                BlockState::Requested => {
                    self.blocks[i] = BlockState::Free;
                    self.free += 1;
                }
                BlockState::Have => {
                    self.blocks[i] = BlockState::Free;
                    self.free += 1;
                    self.have -= 1;
                }
            }
        }
    }

    /// Drops all progress; used after the assembled piece fails hash
    /// verification.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            *block = BlockState::Free;
        }
        self.free = self.blocks.len();
        self.have = 0;
    }

    /// Expected length of the block starting at `begin`, or `None` when
    /// `begin` is not a block boundary of this piece. Inbound block frames
    /// are validated against this.
    pub fn block_len_at(&self, begin: u32) -> Option<u32> {
        self.block_index(begin)
            .map(|_| (self.length - begin).min(BLOCK_SIZE))
    }

    fn block_index(&self, begin: u32) -> Option<usize> {
        if begin % BLOCK_SIZE != 0 {
            return None;
        }
        let i = (begin / BLOCK_SIZE) as usize;
        (i < self.blocks.len()).then_some(i)
    }
}
