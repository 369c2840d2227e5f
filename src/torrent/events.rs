use wire::message::Message;

use crate::torrent::peer::Peer;
use crate::torrent::peers::connection::PeerLink;

/// Everything the coordinator reacts to. Connection tasks, the disk actor
/// and the tracker loop all funnel into one queue so torrent state is only
/// ever touched from the coordinator task.
#[derive(Debug)]
pub enum Event {
    /// Tracker announce produced fresh peer candidates.
    PeersDiscovered { peers: Vec<Peer> },
    /// Outbound connect and handshake succeeded; the link carries the
    /// connection's outbound queue and shutdown handle.
    PeerJoined {
        addr: String,
        peer_id: [u8; 20],
        link: PeerLink,
    },
    /// Outbound connect or handshake failed; frees an admission slot.
    ConnectFailed { addr: String },
    /// A fully parsed frame from a connected peer.
    PeerMessage { addr: String, message: Message },
    /// The connection is gone, whatever the reason. Emitted exactly once
    /// per peer, by the reader task.
    PeerClosed { addr: String },
    /// Disk served a block a remote peer asked for.
    BlockRead {
        addr: String,
        piece_index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    BlockReadFailed {
        addr: String,
        piece_index: u32,
        begin: u32,
    },
    BlockWriteFailed {
        piece_index: u32,
        begin: u32,
    },
    /// Disk hashed a downloaded piece against the metainfo.
    PieceVerified { piece_index: u32, valid: bool },
}
