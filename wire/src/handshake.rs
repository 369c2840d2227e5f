use crate::error::WireError;

/// Protocol identifier exchanged in the handshake.
pub const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// Fixed size of a handshake frame: 1 length byte, the 19-byte protocol
/// string, 8 reserved bytes, the 20-byte info hash and the 20-byte peer id.
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed-size frame both sides send before any length-prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HANDSHAKE_LEN);
        buffer.push(PSTR.len() as u8);
        buffer.extend_from_slice(PSTR);
        buffer.extend_from_slice(&self.reserved);
        buffer.extend_from_slice(&self.info_hash);
        buffer.extend_from_slice(&self.peer_id);
        buffer
    }

    /// Parses a handshake frame. Returns `Ok(None)` until 68 bytes are
    /// buffered; a wrong protocol string is unrecoverable.
    pub fn parse(buffer: &[u8]) -> Result<Option<Handshake>, WireError> {
        if buffer.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        if buffer[0] as usize != PSTR.len() || &buffer[1..20] != PSTR {
            return Err(WireError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buffer[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buffer[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buffer[48..68]);

        Ok(Some(Handshake {
            reserved,
            info_hash,
            peer_id,
        }))
    }
}
