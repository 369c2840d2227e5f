use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Default patience for the oldest outstanding request of a peer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One block request sent to a peer and not yet answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub piece_index: u32,
    pub begin: u32,
}

#[derive(Debug)]
struct PeerRequests {
    /// Oldest request at the front; expiry pops from the back.
    pending: VecDeque<PendingRequest>,
    deadline: Instant,
}

/// Tracks every in-flight block request per peer under a single rolling
/// deadline. When a peer's deadline lapses, only its newest request is
/// declared dead per tick; a slow-but-alive peer sheds load gradually
/// instead of having its whole pipeline cancelled at once.
///
/// Every removal except an explicit completion hands the request back to
/// the caller, which returns the block to the free pool. All operations
/// take `now` so tests can drive time by hand.
#[derive(Debug)]
pub struct RequestTimeouts {
    peers: HashMap<String, PeerRequests>,
    timeout: Duration,
}

impl RequestTimeouts {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        RequestTimeouts {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Records a dispatched request; arms the peer's deadline if it had no
    /// outstanding requests.
    pub fn add_block(&mut self, addr: &str, piece_index: u32, begin: u32, now: Instant) {
        let entry = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerRequests {
                pending: VecDeque::new(),
                deadline: now + self.timeout,
            });
        entry.pending.push_back(PendingRequest { piece_index, begin });
    }

    /// Completion path: the block arrived. Removes the request and, if the
    /// peer still has requests in flight, grants them a fresh deadline.
    pub fn remove_block(&mut self, addr: &str, piece_index: u32, begin: u32, now: Instant) -> bool {
        let Some(entry) = self.peers.get_mut(addr) else {
            return false;
        };
        let before = entry.pending.len();
        entry
            .pending
            .retain(|r| !(r.piece_index == piece_index && r.begin == begin));
        let removed = entry.pending.len() != before;
        if entry.pending.is_empty() {
            self.peers.remove(addr);
        } else if removed {
            entry.deadline = now + self.timeout;
        }
        removed
    }

    /// Expires at most one request (the newest) per overdue peer and re-arms
    /// that peer's deadline. Returns the expired requests for release.
    pub fn tick(&mut self, now: Instant) -> Vec<(String, PendingRequest)> {
        let mut expired = Vec::new();
        self.peers.retain(|addr, entry| {
            if now < entry.deadline {
                return true;
            }
            if let Some(request) = entry.pending.pop_back() {
                expired.push((addr.clone(), request));
            }
            entry.deadline = now + self.timeout;
            !entry.pending.is_empty()
        });
        expired
    }

    /// Drains every outstanding request of a departing peer.
    pub fn release_peer(&mut self, addr: &str) -> Vec<PendingRequest> {
        self.peers
            .remove(addr)
            .map(|entry| entry.pending.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drains everything; session shutdown.
    pub fn release_all(&mut self) -> Vec<(String, PendingRequest)> {
        let mut released = Vec::new();
        for (addr, entry) in self.peers.drain() {
            for request in entry.pending {
                released.push((addr.clone(), request));
            }
        }
        released
    }

    pub fn pending_count(&self, addr: &str) -> usize {
        self.peers.get(addr).map_or(0, |entry| entry.pending.len())
    }
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self::new()
    }
}
