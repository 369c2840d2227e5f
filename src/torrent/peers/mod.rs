use std::time::Instant;

use wire::bitfield::Bitfield;

use crate::torrent::rate::TransferRate;

pub mod connection;
pub mod handshake;
pub mod tcp;

/// Choke and interest flags for both directions of a peer connection,
/// plus the scheduling flags the choker reads.
#[derive(Debug, Clone, Copy)]
pub struct WireState {
    /// The remote peer is choking us.
    pub peer_choking: bool,
    /// We are choking the remote peer.
    pub am_choking: bool,
    /// The remote peer wants our pieces.
    pub peer_interested: bool,
    /// We want the remote peer's pieces.
    pub am_interested: bool,
    /// This peer holds the optimistic unchoke slot.
    pub optimistic: bool,
    /// Never unchoked by us yet; weighted up in the optimistic draw.
    pub is_new: bool,
}

impl Default for WireState {
    fn default() -> Self {
        WireState {
            peer_choking: true,
            am_choking: true,
            peer_interested: false,
            am_interested: false,
            optimistic: false,
            is_new: true,
        }
    }
}

impl WireState {
    /// Requests may only be sent while we are interested and not choked.
    pub fn can_download(&self) -> bool {
        self.am_interested && !self.peer_choking
    }
}

/// Everything the coordinator tracks about one connected peer. The
/// connection's channels live in a separate map so this stays plain data
/// for the picker and choker.
#[derive(Debug)]
pub struct PeerState {
    pub addr: String,
    pub peer_id: [u8; 20],
    pub wire: WireState,
    pub bitfield: Bitfield,
    pub download: TransferRate,
    pub upload: TransferRate,
    /// Requests the remote peer made that we have not answered yet,
    /// as (piece index, begin, length).
    remote_requests: Vec<(u32, u32, u32)>,
}

impl PeerState {
    pub fn new(addr: String, peer_id: [u8; 20], total_pieces: u32, now: Instant) -> Self {
        PeerState {
            addr,
            peer_id,
            wire: WireState::default(),
            bitfield: Bitfield::new(total_pieces as usize),
            download: TransferRate::new(now),
            upload: TransferRate::new(now),
            remote_requests: Vec::new(),
        }
    }

    pub fn push_remote_request(&mut self, piece_index: u32, begin: u32, length: u32) {
        self.remote_requests.push((piece_index, begin, length));
    }

    /// Drops a remote request on Cancel. Returns whether it was still queued.
    pub fn cancel_remote_request(&mut self, piece_index: u32, begin: u32, length: u32) -> bool {
        let before = self.remote_requests.len();
        self.remote_requests
            .retain(|r| *r != (piece_index, begin, length));
        self.remote_requests.len() != before
    }

    /// Claims a remote request once its block is read from disk. Returns the
    /// requested length, or None if the peer cancelled in the meantime.
    pub fn claim_remote_request(&mut self, piece_index: u32, begin: u32) -> Option<u32> {
        let pos = self
            .remote_requests
            .iter()
            .position(|r| r.0 == piece_index && r.1 == begin)?;
        let (_, _, length) = self.remote_requests.remove(pos);
        Some(length)
    }

    pub fn remote_request_count(&self) -> usize {
        self.remote_requests.len()
    }

    /// Drops every queued remote request. Done when we choke the peer; a
    /// choked peer must re-request after the next unchoke.
    pub fn clear_remote_requests(&mut self) {
        self.remote_requests.clear();
    }
}
