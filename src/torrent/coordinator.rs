use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use wire::bitfield::Bitfield;
use wire::message::Message;
use wire::piece::{Piece, PieceState};

use crate::config::Config;
use crate::torrent::availability::Availability;
use crate::torrent::choker::Choker;
use crate::torrent::disk::DiskCommand;
use crate::torrent::events::Event;
use crate::torrent::peer::Peer;
use crate::torrent::peers::connection::{self, PeerLink};
use crate::torrent::peers::{handshake, tcp, PeerState};
use crate::torrent::picker::PiecePicker;
use crate::torrent::rate::TransferCounters;
use crate::torrent::timeout::RequestTimeouts;
use crate::torrent::torrent::Torrent;

const PICK_INTERVAL: Duration = Duration::from_secs(1);

/// Largest block length a remote peer may request from us.
const MAX_REQUEST_LENGTH: u32 = 131_072;

/// Single-task owner of all swarm state for one torrent. Peer I/O tasks,
/// the disk actor and the announce loop only talk to it through events,
/// so no piece, peer or timeout state needs locking.
pub struct Coordinator {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    total_pieces: u32,
    pieces: HashMap<u32, Piece>,
    local_bitfield: Bitfield,
    peers: HashMap<String, PeerState>,
    links: HashMap<String, PeerLink>,
    availability: Availability,
    timeouts: RequestTimeouts,
    picker: PiecePicker,
    choker: Choker,
    choke_round: u64,
    candidates: VecDeque<Peer>,
    seen_addrs: HashSet<String>,
    connecting: HashSet<String>,
    counters: Arc<TransferCounters>,
    disk_tx: mpsc::Sender<DiskCommand>,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    config: Config,
    complete_announced: bool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        torrent: &Torrent,
        config: Config,
        peer_id: [u8; 20],
        counters: Arc<TransferCounters>,
        disk_tx: mpsc::Sender<DiskCommand>,
        event_tx: mpsc::Sender<Event>,
        event_rx: mpsc::Receiver<Event>,
        rng: StdRng,
    ) -> Self {
        let total_pieces = torrent.pieces.len() as u32;
        Coordinator {
            info_hash: torrent.info_hash,
            peer_id,
            total_pieces,
            pieces: torrent.pieces.clone(),
            local_bitfield: Bitfield::new(total_pieces as usize),
            peers: HashMap::new(),
            links: HashMap::new(),
            availability: Availability::new(total_pieces as usize),
            timeouts: RequestTimeouts::with_timeout(Duration::from_secs(
                config.session.request_timeout_secs,
            )),
            picker: PiecePicker::new(config.session.pipeline_depth),
            choker: Choker::new(config.session.upload_slots, rng),
            choke_round: 0,
            candidates: VecDeque::new(),
            seen_addrs: HashSet::new(),
            connecting: HashSet::new(),
            counters,
            disk_tx,
            event_tx,
            event_rx,
            config,
            complete_announced: false,
        }
    }

    /// Runs the session until the event channel closes. Request picking and
    /// timeout expiry happen on a short timer, choking on its own longer
    /// one; everything else is event-driven.
    pub fn run(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(pieces = self.total_pieces, "Session started");

            let mut pick_timer = time::interval(PICK_INTERVAL);
            pick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut choke_timer =
                time::interval(Duration::from_secs(self.config.session.choke_interval_secs));
            choke_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = self.event_rx.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        self.handle_event(event).await;
                    }
                    _ = pick_timer.tick() => {
                        let now = Instant::now();
                        self.sample_rates(now);
                        self.expire_requests(now);
                        self.dispatch_requests(now).await;
                    }
                    _ = choke_timer.tick() => {
                        self.run_choke_round().await;
                    }
                }
            }

            debug!("Event channel closed, stopping session");
            self.shutdown().await;
        })
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::PeersDiscovered { peers } => self.handle_peers_discovered(peers),
            Event::PeerJoined {
                addr,
                peer_id,
                link,
            } => self.handle_peer_joined(addr, peer_id, link).await,
            Event::ConnectFailed { addr } => {
                self.connecting.remove(&addr);
                self.fill_connection_slots();
            }
            Event::PeerMessage { addr, message } => self.handle_peer_message(addr, message).await,
            Event::PeerClosed { addr } => self.remove_peer(&addr),
            Event::BlockRead {
                addr,
                piece_index,
                begin,
                data,
            } => self.handle_block_read(addr, piece_index, begin, data).await,
            Event::BlockReadFailed {
                addr,
                piece_index,
                begin,
            } => {
                warn!(
                    peer_addr = %addr,
                    piece_index, begin, "Dropping remote request after failed read"
                );
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.claim_remote_request(piece_index, begin);
                }
            }
            Event::BlockWriteFailed { piece_index, begin } => {
                if let Some(piece) = self.pieces.get_mut(&piece_index) {
                    piece.clear_block(begin);
                }
            }
            Event::PieceVerified { piece_index, valid } => {
                self.handle_piece_verified(piece_index, valid).await
            }
        }
    }

    async fn handle_peer_message(&mut self, addr: String, message: Message) {
        if !self.peers.contains_key(&addr) {
            trace!(peer_addr = %addr, "Message from departed peer");
            return;
        }
        match message {
            Message::KeepAlive => trace!(peer_addr = %addr, "Keep-alive"),
            Message::Choke => self.handle_choke(&addr),
            Message::Unchoke => self.handle_unchoke(&addr).await,
            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.wire.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.wire.peer_interested = false;
                }
            }
            Message::Have(piece_index) => self.handle_have(&addr, piece_index).await,
            Message::Bitfield(bytes) => self.handle_bitfield(&addr, bytes).await,
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(&addr, index, begin, length).await,
            Message::Piece {
                index,
                begin,
                block,
            } => self.handle_block_in(&addr, index, begin, block).await,
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if peer.cancel_remote_request(index, begin, length) {
                        trace!(peer_addr = %addr, index, begin, "Remote request cancelled");
                    }
                }
            }
        }
    }

    fn handle_peers_discovered(&mut self, peers: Vec<Peer>) {
        let mut fresh = 0usize;
        for peer in peers {
            let addr = peer.address();
            if self.seen_addrs.insert(addr) {
                self.candidates.push_back(peer);
                fresh += 1;
            }
        }
        if fresh > 0 {
            debug!(fresh, queued = self.candidates.len(), "Peers discovered");
        }
        self.fill_connection_slots();
    }

    async fn handle_peer_joined(&mut self, addr: String, peer_id: [u8; 20], link: PeerLink) {
        self.connecting.remove(&addr);
        if self.peers.contains_key(&addr) {
            debug!(peer_addr = %addr, "Duplicate connection, keeping the first");
            link.close();
            return;
        }
        info!(peer_addr = %addr, "Peer joined");
        let state = PeerState::new(addr.clone(), peer_id, self.total_pieces, Instant::now());
        self.peers.insert(addr.clone(), state);
        if self.local_bitfield.count() > 0 {
            let message = Message::Bitfield(self.local_bitfield.as_bytes().to_vec());
            if let Err(error) = link.send(message).await {
                debug!(peer_addr = %addr, error = %error, "Failed to send bitfield");
            }
        }
        self.links.insert(addr, link);
    }

    fn handle_choke(&mut self, addr: &str) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.wire.peer_choking = true;
        }
        let released = self.timeouts.release_peer(addr);
        if !released.is_empty() {
            debug!(
                peer_addr = %addr,
                released = released.len(),
                "Choked with requests in flight"
            );
        }
        for request in released {
            if let Some(piece) = self.pieces.get_mut(&request.piece_index) {
                piece.return_block(request.begin);
            }
        }
    }

    async fn handle_unchoke(&mut self, addr: &str) {
        debug!(peer_addr = %addr, "Unchoked by peer");
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.wire.peer_choking = false;
        }
        self.dispatch_requests(Instant::now()).await;
    }

    async fn handle_have(&mut self, addr: &str, piece_index: u32) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if !peer.bitfield.has_piece(piece_index as usize) {
            peer.bitfield.set_piece(piece_index as usize);
            self.availability.inc(piece_index);
        }
        self.update_interest(addr).await;
    }

    async fn handle_bitfield(&mut self, addr: &str, bytes: Vec<u8>) {
        let total = self.total_pieces as usize;
        if bytes.len() != Bitfield::expected_len(total) || Bitfield::spare_bits_set(&bytes, total) {
            warn!(
                peer_addr = %addr,
                len = bytes.len(),
                "Dropping peer after malformed bitfield"
            );
            self.close_link(addr);
            return;
        }
        let field = Bitfield::from_bytes(&bytes, total);
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        // A repeated bitfield replaces the previous counts.
        self.availability.dec_all(&peer.bitfield);
        self.availability.inc_all(&field);
        debug!(peer_addr = %addr, pieces = field.count(), "Bitfield received");
        peer.bitfield = field;
        self.update_interest(addr).await;
    }

    async fn handle_request(&mut self, addr: &str, index: u32, begin: u32, length: u32) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        if peer.wire.am_choking {
            debug!(peer_addr = %addr, index, "Ignoring request from choked peer");
            return;
        }
        if !self.local_bitfield.has_piece(index as usize) {
            warn!(peer_addr = %addr, index, "Request for a piece we do not have");
            return;
        }
        let Some(piece) = self.pieces.get(&index) else {
            return;
        };
        if length == 0
            || length > MAX_REQUEST_LENGTH
            || begin as u64 + length as u64 > piece.length() as u64
        {
            warn!(
                peer_addr = %addr,
                index, begin, length, "Ignoring out-of-range request"
            );
            return;
        }
        peer.push_remote_request(index, begin, length);
        let command = DiskCommand::ReadBlock {
            addr: addr.to_string(),
            piece_index: index,
            begin,
            length,
        };
        if let Err(error) = self.disk_tx.send(command).await {
            debug!(error = %error, "Disk channel closed");
        }
    }

    async fn handle_block_in(&mut self, addr: &str, index: u32, begin: u32, block: Vec<u8>) {
        let Some(piece) = self.pieces.get_mut(&index) else {
            warn!(peer_addr = %addr, index, "Dropping peer after block for unknown piece");
            self.close_link(addr);
            return;
        };
        let expected = piece.block_len_at(begin);
        let Some(block_len) = expected.filter(|len| *len as usize == block.len()) else {
            warn!(
                peer_addr = %addr,
                index,
                begin,
                len = block.len(),
                "Dropping peer after malformed block"
            );
            self.close_link(addr);
            return;
        };
        let was_pending = self.timeouts.remove_block(addr, index, begin, Instant::now());
        if !was_pending {
            trace!(peer_addr = %addr, index, begin, "Block we did not request");
        }
        match piece.mark_have(begin) {
            Ok(true) => {}
            Ok(false) => {
                debug!(peer_addr = %addr, index, begin, "Duplicate block");
                return;
            }
            // block_len_at already screened the offset
            Err(_) => return,
        }
        let complete = piece.state() == PieceState::Complete;
        let piece_length = piece.length();
        let piece_hash = *piece.hash();
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.download.record(block_len as u64);
        }
        self.counters.add_downloaded(block_len as u64);
        trace!(peer_addr = %addr, index, begin, "Block received");
        let write = DiskCommand::WriteBlock {
            piece_index: index,
            begin,
            data: block,
        };
        if let Err(error) = self.disk_tx.send(write).await {
            debug!(error = %error, "Disk channel closed");
            return;
        }
        if complete {
            debug!(index, "All blocks received, verifying");
            let verify = DiskCommand::VerifyPiece {
                piece_index: index,
                length: piece_length,
                expected: piece_hash,
            };
            if let Err(error) = self.disk_tx.send(verify).await {
                debug!(error = %error, "Disk channel closed");
            }
        }
    }

    async fn handle_block_read(&mut self, addr: String, piece_index: u32, begin: u32, data: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let Some(length) = peer.claim_remote_request(piece_index, begin) else {
            trace!(peer_addr = %addr, piece_index, begin, "Read finished after cancel");
            return;
        };
        peer.upload.record(length as u64);
        self.counters.add_uploaded(length as u64);
        let Some(link) = self.links.get(&addr) else {
            return;
        };
        let message = Message::Piece {
            index: piece_index,
            begin,
            block: data,
        };
        if let Err(error) = link.send(message).await {
            debug!(peer_addr = %addr, error = %error, "Failed to send block");
        } else {
            trace!(peer_addr = %addr, piece_index, begin, "Block served");
        }
    }

    async fn handle_piece_verified(&mut self, piece_index: u32, valid: bool) {
        if !valid {
            warn!(piece_index, "Piece failed hash check, resetting");
            if let Some(piece) = self.pieces.get_mut(&piece_index) {
                piece.reset();
            }
            return;
        }
        if self.local_bitfield.has_piece(piece_index as usize) {
            return;
        }
        self.local_bitfield.set_piece(piece_index as usize);
        if let Some(piece) = self.pieces.get(&piece_index) {
            self.counters.sub_left(piece.length() as u64);
        }
        info!(
            piece_index,
            have = self.local_bitfield.count(),
            total = self.total_pieces,
            "Piece verified"
        );

        for (addr, link) in &self.links {
            if let Err(error) = link.send(Message::Have(piece_index)).await {
                debug!(peer_addr = %addr, error = %error, "Failed to announce piece");
            }
        }
        let addrs: Vec<String> = self.peers.keys().cloned().collect();
        for addr in addrs {
            self.update_interest(&addr).await;
        }

        if self.local_bitfield.has_all_pieces() && !self.complete_announced {
            self.complete_announced = true;
            info!("Download complete, seeding");
            if let Err(error) = self.disk_tx.send(DiskCommand::Flush).await {
                debug!(error = %error, "Disk channel closed");
            }
        }
    }

    /// Sends Interested or NotInterested when our standing toward the peer
    /// changed, which happens when either side's piece set moves.
    async fn update_interest(&mut self, addr: &str) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };
        let wanted = (0..self.total_pieces as usize)
            .any(|index| peer.bitfield.has_piece(index) && !self.local_bitfield.has_piece(index));
        if wanted == peer.wire.am_interested {
            return;
        }
        peer.wire.am_interested = wanted;
        debug!(peer_addr = %addr, interested = wanted, "Interest changed");
        let message = if wanted {
            Message::Interested
        } else {
            Message::NotInterested
        };
        self.send_to_peer(addr, message).await;
    }

    fn sample_rates(&mut self, now: Instant) {
        for peer in self.peers.values_mut() {
            peer.download.sample(now);
            peer.upload.sample(now);
        }
    }

    fn expire_requests(&mut self, now: Instant) {
        for (addr, request) in self.timeouts.tick(now) {
            warn!(
                peer_addr = %addr,
                piece_index = request.piece_index,
                begin = request.begin,
                "Request timed out"
            );
            if let Some(piece) = self.pieces.get_mut(&request.piece_index) {
                piece.return_block(request.begin);
            }
        }
    }

    async fn dispatch_requests(&mut self, now: Instant) {
        let assignments = self.picker.pick(
            &self.peers,
            &mut self.pieces,
            &self.availability,
            &self.timeouts,
        );
        for (addr, requests) in assignments {
            trace!(peer_addr = %addr, count = requests.len(), "Dispatching requests");
            for message in requests {
                // Armed before sending, so a dead link's blocks are
                // reclaimed by expiry or the close bookkeeping.
                if let Message::Request { index, begin, .. } = &message {
                    self.timeouts.add_block(&addr, *index, *begin, now);
                }
                if let Some(link) = self.links.get(&addr) {
                    if let Err(error) = link.send(message).await {
                        debug!(peer_addr = %addr, error = %error, "Failed to queue request");
                    }
                }
            }
        }
    }

    async fn run_choke_round(&mut self) {
        self.choke_round += 1;
        let rounds = self.config.session.optimistic_rounds.max(1);
        let change_optimistic = (self.choke_round - 1) % rounds == 0;
        let is_seed = self.local_bitfield.has_all_pieces();
        let round = self.choker.rerank(&self.peers, is_seed, change_optimistic);

        if let Some(addr) = &round.previous_optimistic {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.wire.optimistic = false;
            }
        }
        if let Some(addr) = &round.optimistic {
            if let Some(peer) = self.peers.get_mut(addr) {
                if !peer.wire.optimistic {
                    debug!(peer_addr = %addr, "New optimistic unchoke");
                }
                peer.wire.optimistic = true;
            }
        }
        for addr in &round.unchoke {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.wire.am_choking = false;
                peer.wire.is_new = false;
            }
            debug!(peer_addr = %addr, "Unchoking");
            self.send_to_peer(addr, Message::Unchoke).await;
        }
        for addr in &round.choke {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.wire.am_choking = true;
                peer.clear_remote_requests();
            }
            debug!(peer_addr = %addr, "Choking");
            self.send_to_peer(addr, Message::Choke).await;
        }
    }

    fn remove_peer(&mut self, addr: &str) {
        self.connecting.remove(addr);
        if let Some(link) = self.links.remove(addr) {
            link.close();
        }
        let Some(peer) = self.peers.remove(addr) else {
            self.fill_connection_slots();
            return;
        };
        info!(peer_addr = %addr, "Peer closed");
        self.availability.dec_all(&peer.bitfield);
        for request in self.timeouts.release_peer(addr) {
            if let Some(piece) = self.pieces.get_mut(&request.piece_index) {
                piece.return_block(request.begin);
            }
        }
        self.choker.peer_removed(addr);
        self.fill_connection_slots();
    }

    fn fill_connection_slots(&mut self) {
        while self.peers.len() + self.connecting.len() < self.config.network.max_peer_connections {
            let Some(peer) = self.candidates.pop_front() else {
                break;
            };
            let addr = peer.address();
            if self.peers.contains_key(&addr) || !self.connecting.insert(addr.clone()) {
                continue;
            }
            self.spawn_connector(addr);
        }
    }

    fn spawn_connector(&self, addr: String) {
        let event_tx = self.event_tx.clone();
        let info_hash = self.info_hash;
        let our_id = self.peer_id;
        let timeout_ms = self.config.network.connect_timeout_ms;
        let retries = self.config.network.connection_retries;
        tokio::spawn(async move {
            let mut stream = match tcp::connect(&addr, timeout_ms, retries).await {
                Ok(stream) => stream,
                Err(error) => {
                    debug!(peer_addr = %addr, error = %error, "Connect failed");
                    let _ = event_tx.send(Event::ConnectFailed { addr }).await;
                    return;
                }
            };
            let remote = match handshake::exchange(&mut stream, info_hash, our_id).await {
                Ok(handshake) => handshake,
                Err(error) => {
                    debug!(peer_addr = %addr, error = %error, "Handshake failed");
                    let _ = event_tx.send(Event::ConnectFailed { addr }).await;
                    return;
                }
            };
            debug!(peer_addr = %addr, "Handshake complete");
            let (link, _, _) = connection::spawn(stream, addr.clone(), event_tx.clone());
            let _ = event_tx
                .send(Event::PeerJoined {
                    addr,
                    peer_id: remote.peer_id,
                    link,
                })
                .await;
        });
    }

    fn close_link(&self, addr: &str) {
        if let Some(link) = self.links.get(addr) {
            link.close();
        }
    }

    async fn send_to_peer(&self, addr: &str, message: Message) {
        if let Some(link) = self.links.get(addr) {
            if let Err(error) = link.send(message).await {
                debug!(peer_addr = %addr, error = %error, "Peer link closed");
            }
        }
    }

    async fn shutdown(&mut self) {
        for link in self.links.values() {
            link.close();
        }
        let _ = self.disk_tx.send(DiskCommand::Shutdown).await;
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use rand::SeedableRng;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use crate::torrent::peer::Ip;

    use super::*;

    fn test_torrent(piece_count: u32, piece_length: u32) -> Torrent {
        let mut pieces = HashMap::new();
        for index in 0..piece_count {
            pieces.insert(index, Piece::new(index, piece_length, [index as u8; 20]));
        }
        let total_length = piece_length as u64 * piece_count as u64;
        Torrent {
            info_hash: [7u8; 20],
            name: "fixture".to_string(),
            piece_length: piece_length as u64,
            total_length,
            pieces,
            files: vec![(PathBuf::from("fixture.bin"), total_length)],
            announce_urls: Vec::new(),
        }
    }

    fn test_coordinator(
        piece_count: u32,
        piece_length: u32,
    ) -> (Coordinator, mpsc::Receiver<DiskCommand>) {
        let torrent = test_torrent(piece_count, piece_length);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (disk_tx, disk_rx) = mpsc::channel(64);
        let counters = Arc::new(TransferCounters::new(torrent.total_length));
        let coordinator = Coordinator::new(
            &torrent,
            Config::default(),
            *b"-XX0000-000000000000",
            counters,
            disk_tx,
            event_tx,
            event_rx,
            StdRng::seed_from_u64(7),
        );
        (coordinator, disk_rx)
    }

    /// Wires a real connection pair into the coordinator and returns the
    /// remote end of the stream.
    async fn join_peer(coordinator: &mut Coordinator, addr: &str) -> DuplexStream {
        let (local, remote) = duplex(256 * 1024);
        let (link, _, _) = connection::spawn(local, addr.to_string(), coordinator.event_tx.clone());
        coordinator
            .handle_event(Event::PeerJoined {
                addr: addr.to_string(),
                peer_id: [9u8; 20],
                link,
            })
            .await;
        remote
    }

    async fn read_frame(stream: &mut DuplexStream) -> Message {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = vec![0u8; 4 + len];
        frame[..4].copy_from_slice(&len_buf);
        stream.read_exact(&mut frame[4..]).await.unwrap();
        let (message, consumed) = Message::parse(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        message
    }

    fn full_bitfield_bytes(total_pieces: u32) -> Vec<u8> {
        let mut field = Bitfield::new(total_pieces as usize);
        for index in 0..total_pieces as usize {
            field.set_piece(index);
        }
        field.as_bytes().to_vec()
    }

    async fn message_from(coordinator: &mut Coordinator, addr: &str, message: Message) {
        coordinator
            .handle_event(Event::PeerMessage {
                addr: addr.to_string(),
                message,
            })
            .await;
    }

    #[tokio::test]
    async fn bitfield_with_spare_bits_drops_the_peer() {
        let (mut coordinator, _disk_rx) = test_coordinator(3, 16_384);
        let _remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;

        // Three pieces fit one byte; bit 5 falls outside the torrent.
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(vec![0b1110_0100]),
        )
        .await;

        let event = coordinator.event_rx.recv().await.unwrap();
        assert_matches!(event, Event::PeerClosed { ref addr } if addr == "10.0.0.1:6881");
        coordinator.handle_event(event).await;

        assert!(coordinator.peers.is_empty());
        assert_eq!(coordinator.availability.count(0), 0);
    }

    #[tokio::test]
    async fn valid_bitfield_counts_availability_and_raises_interest() {
        let (mut coordinator, _disk_rx) = test_coordinator(3, 16_384);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;

        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(full_bitfield_bytes(3)),
        )
        .await;

        for index in 0..3 {
            assert_eq!(coordinator.availability.count(index), 1);
        }
        let peer = coordinator.peers.get("10.0.0.1:6881").unwrap();
        assert!(peer.wire.am_interested);
        assert_matches!(read_frame(&mut remote).await, Message::Interested);
    }

    #[tokio::test]
    async fn unchoke_dispatches_requests_and_choke_returns_them() {
        let (mut coordinator, _disk_rx) = test_coordinator(1, 32_768);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(full_bitfield_bytes(1)),
        )
        .await;
        assert_matches!(read_frame(&mut remote).await, Message::Interested);

        message_from(&mut coordinator, "10.0.0.1:6881", Message::Unchoke).await;

        assert_matches!(
            read_frame(&mut remote).await,
            Message::Request {
                index: 0,
                begin: 0,
                length: 16_384
            }
        );
        assert_matches!(
            read_frame(&mut remote).await,
            Message::Request {
                index: 0,
                begin: 16_384,
                length: 16_384
            }
        );
        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 2);
        assert_eq!(
            coordinator.pieces.get(&0).unwrap().state(),
            PieceState::FullyRequested
        );

        message_from(&mut coordinator, "10.0.0.1:6881", Message::Choke).await;

        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 0);
        assert_eq!(
            coordinator.pieces.get(&0).unwrap().state(),
            PieceState::NotStarted
        );
    }

    #[tokio::test]
    async fn expiry_returns_only_the_newest_request() {
        let (mut coordinator, _disk_rx) = test_coordinator(1, 32_768);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(full_bitfield_bytes(1)),
        )
        .await;
        assert_matches!(read_frame(&mut remote).await, Message::Interested);
        message_from(&mut coordinator, "10.0.0.1:6881", Message::Unchoke).await;
        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 2);

        coordinator.expire_requests(Instant::now() + Duration::from_secs(61));

        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 1);
        assert_eq!(
            coordinator.pieces.get(&0).unwrap().state(),
            PieceState::BlocksNeeded
        );
    }

    #[tokio::test]
    async fn block_arrival_flows_through_write_verify_and_have() {
        let (mut coordinator, mut disk_rx) = test_coordinator(1, 16_384);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(full_bitfield_bytes(1)),
        )
        .await;
        assert_matches!(read_frame(&mut remote).await, Message::Interested);
        message_from(&mut coordinator, "10.0.0.1:6881", Message::Unchoke).await;
        assert_matches!(read_frame(&mut remote).await, Message::Request { .. });

        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![0xAB; 16_384],
            },
        )
        .await;

        assert_eq!(coordinator.counters.downloaded(), 16_384);
        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 0);
        assert_matches!(
            disk_rx.recv().await.unwrap(),
            DiskCommand::WriteBlock {
                piece_index: 0,
                begin: 0,
                ref data
            } if data.len() == 16_384
        );
        assert_matches!(
            disk_rx.recv().await.unwrap(),
            DiskCommand::VerifyPiece {
                piece_index: 0,
                length: 16_384,
                expected
            } if expected == [0u8; 20]
        );

        coordinator
            .handle_event(Event::PieceVerified {
                piece_index: 0,
                valid: true,
            })
            .await;

        assert!(coordinator.local_bitfield.has_piece(0));
        assert_eq!(coordinator.counters.left(), 0);
        assert_matches!(read_frame(&mut remote).await, Message::Have(0));
        assert_matches!(read_frame(&mut remote).await, Message::NotInterested);
        assert_matches!(disk_rx.recv().await.unwrap(), DiskCommand::Flush);
    }

    #[tokio::test]
    async fn failed_verification_resets_the_piece() {
        let (mut coordinator, _disk_rx) = test_coordinator(1, 16_384);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(full_bitfield_bytes(1)),
        )
        .await;
        assert_matches!(read_frame(&mut remote).await, Message::Interested);
        message_from(&mut coordinator, "10.0.0.1:6881", Message::Unchoke).await;
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![0xAB; 16_384],
            },
        )
        .await;
        assert_eq!(
            coordinator.pieces.get(&0).unwrap().state(),
            PieceState::Complete
        );

        coordinator
            .handle_event(Event::PieceVerified {
                piece_index: 0,
                valid: false,
            })
            .await;

        assert_eq!(
            coordinator.pieces.get(&0).unwrap().state(),
            PieceState::NotStarted
        );
        assert!(!coordinator.local_bitfield.has_piece(0));
    }

    #[tokio::test]
    async fn peer_close_releases_requests_and_availability() {
        let (mut coordinator, _disk_rx) = test_coordinator(2, 16_384);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Bitfield(full_bitfield_bytes(2)),
        )
        .await;
        assert_matches!(read_frame(&mut remote).await, Message::Interested);
        message_from(&mut coordinator, "10.0.0.1:6881", Message::Unchoke).await;
        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 2);

        coordinator
            .handle_event(Event::PeerClosed {
                addr: "10.0.0.1:6881".to_string(),
            })
            .await;

        assert!(coordinator.peers.is_empty());
        assert!(coordinator.links.is_empty());
        assert_eq!(coordinator.availability.count(0), 0);
        assert_eq!(coordinator.availability.count(1), 0);
        assert_eq!(coordinator.timeouts.pending_count("10.0.0.1:6881"), 0);
        for index in 0..2 {
            assert_eq!(
                coordinator.pieces.get(&index).unwrap().state(),
                PieceState::NotStarted
            );
        }
    }

    #[tokio::test]
    async fn remote_requests_are_served_unless_cancelled_or_choked() {
        let (mut coordinator, mut disk_rx) = test_coordinator(1, 16_384);
        let mut remote = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        coordinator.local_bitfield.set_piece(0);

        // Still choked: the request is ignored outright.
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Request {
                index: 0,
                begin: 0,
                length: 16_384,
            },
        )
        .await;
        assert!(disk_rx.try_recv().is_err());

        let peer = coordinator.peers.get_mut("10.0.0.1:6881").unwrap();
        peer.wire.am_choking = false;

        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Request {
                index: 0,
                begin: 0,
                length: 16_384,
            },
        )
        .await;
        assert_matches!(
            disk_rx.recv().await.unwrap(),
            DiskCommand::ReadBlock {
                piece_index: 0,
                begin: 0,
                length: 16_384,
                ..
            }
        );

        // Cancel beats the disk read back; the stale read is dropped.
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Cancel {
                index: 0,
                begin: 0,
                length: 16_384,
            },
        )
        .await;
        coordinator
            .handle_event(Event::BlockRead {
                addr: "10.0.0.1:6881".to_string(),
                piece_index: 0,
                begin: 0,
                data: vec![1u8; 16_384],
            })
            .await;
        assert_eq!(coordinator.counters.uploaded(), 0);
        let silent =
            tokio::time::timeout(Duration::from_millis(50), read_frame(&mut remote)).await;
        assert!(silent.is_err());

        // Un-cancelled request flows back out as a piece message.
        message_from(
            &mut coordinator,
            "10.0.0.1:6881",
            Message::Request {
                index: 0,
                begin: 0,
                length: 16_384,
            },
        )
        .await;
        assert_matches!(disk_rx.recv().await.unwrap(), DiskCommand::ReadBlock { .. });
        coordinator
            .handle_event(Event::BlockRead {
                addr: "10.0.0.1:6881".to_string(),
                piece_index: 0,
                begin: 0,
                data: vec![1u8; 16_384],
            })
            .await;
        assert_eq!(coordinator.counters.uploaded(), 16_384);
        assert_matches!(
            read_frame(&mut remote).await,
            Message::Piece {
                index: 0,
                begin: 0,
                ref block
            } if block.len() == 16_384
        );
    }

    #[tokio::test]
    async fn choke_round_unchokes_interested_peers() {
        let (mut coordinator, _disk_rx) = test_coordinator(1, 16_384);
        let mut first = join_peer(&mut coordinator, "10.0.0.1:6881").await;
        let mut second = join_peer(&mut coordinator, "10.0.0.2:6881").await;
        message_from(&mut coordinator, "10.0.0.1:6881", Message::Interested).await;
        message_from(&mut coordinator, "10.0.0.2:6881", Message::Interested).await;

        coordinator.run_choke_round().await;

        assert_matches!(read_frame(&mut first).await, Message::Unchoke);
        assert_matches!(read_frame(&mut second).await, Message::Unchoke);
        for peer in coordinator.peers.values() {
            assert!(!peer.wire.am_choking);
            assert!(!peer.wire.is_new);
        }
        assert!(coordinator.choker.optimistic().is_some());
    }

    #[tokio::test]
    async fn failed_connection_frees_its_admission_slot() {
        let (mut coordinator, _disk_rx) = test_coordinator(1, 16_384);
        let unreachable = Peer {
            peer_id: None,
            ip: Ip::V4(Ipv4Addr::LOCALHOST),
            port: 1,
        };

        coordinator
            .handle_event(Event::PeersDiscovered {
                peers: vec![unreachable.clone()],
            })
            .await;
        assert_eq!(coordinator.connecting.len(), 1);

        let event = coordinator.event_rx.recv().await.unwrap();
        assert_matches!(event, Event::ConnectFailed { ref addr } if addr == "127.0.0.1:1");
        coordinator.handle_event(event).await;
        assert!(coordinator.connecting.is_empty());

        // Re-announced addresses are not dialed again.
        coordinator
            .handle_event(Event::PeersDiscovered {
                peers: vec![unreachable],
            })
            .await;
        assert!(coordinator.connecting.is_empty());
        assert!(coordinator.candidates.is_empty());
    }
}
