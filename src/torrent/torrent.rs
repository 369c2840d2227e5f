use std::{collections::HashMap, path::PathBuf};

use rand::{distributions::Alphanumeric, Rng};
use wire::piece::Piece;

use super::metainfo::{Metainfo, MetainfoError};

/// Everything the session keeps from a .torrent file, decoded and validated
/// once at startup.
#[derive(Debug)]
pub struct Torrent {
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub pieces: HashMap<u32, Piece>,
    /// Paths relative to the download directory, with byte lengths, in
    /// torrent order. Blocks map onto their concatenation.
    pub files: Vec<(PathBuf, u64)>,
    pub announce_urls: Vec<String>,
}

impl Torrent {
    pub fn from_bytes(data: &[u8]) -> Result<Torrent, MetainfoError> {
        let info_hash = Metainfo::compute_info_hash(data)?;
        let metainfo = Metainfo::deserialize(data)?;
        let total_length = metainfo.total_length()?;
        let pieces = metainfo.parse_pieces()?;
        let files = metainfo.file_layout()?;

        Ok(Torrent {
            info_hash,
            name: metainfo.info.name.clone(),
            piece_length: metainfo.info.piece_length,
            total_length,
            pieces,
            files,
            announce_urls: metainfo.announce_urls(),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

/// Azureus-style peer id: client tag followed by a random alphanumeric tail.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = *b"-SW0010-000000000000";
    let tail: Vec<u8> = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .collect();
    id[8..].copy_from_slice(&tail);
    id
}
