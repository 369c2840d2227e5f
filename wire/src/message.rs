use crate::error::WireError;

/// Upper bound on a declared frame length. The largest legal frame is a
/// block message (9 bytes of header plus 16 KiB of data); anything near the
/// cap is a corrupt or hostile length prefix.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// A peer-wire protocol message.
///
/// Every frame on the wire is a 4-byte big-endian length prefix followed by
/// a 1-byte message id and the message payload. A zero-length frame carries
/// no id and is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Wire message id; `None` for keep-alive, which has no id byte.
    pub fn message_id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Total bytes this message occupies on the wire, length prefix included.
    pub fn wire_len(&self) -> usize {
        4 + self.body_len() as usize
    }

    fn body_len(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bytes) => 1 + bytes.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
        }
    }

    /// Encodes the message into its exact wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut buffer = Vec::with_capacity(4 + body_len as usize);
        buffer.extend_from_slice(&body_len.to_be_bytes());
        if let Some(id) = self.message_id() {
            buffer.push(id);
        }
        match self {
            Message::Have(index) => buffer.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bytes) => buffer.extend_from_slice(bytes),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                buffer.extend_from_slice(&index.to_be_bytes());
                buffer.extend_from_slice(&begin.to_be_bytes());
                buffer.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                buffer.extend_from_slice(&index.to_be_bytes());
                buffer.extend_from_slice(&begin.to_be_bytes());
                buffer.extend_from_slice(block);
            }
            _ => {}
        }
        buffer
    }

    /// Parses the first complete frame from `buffer`.
    ///
    /// Returns `Ok(None)` when the buffer holds less than a full frame (the
    /// caller keeps the bytes and reads more), otherwise the message and the
    /// number of bytes consumed. Unknown ids and frames whose declared
    /// length does not match their layout are errors; the connection that
    /// produced them cannot be resynchronized.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
        if buffer.len() < 4 {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        if declared > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(declared));
        }
        let frame_len = 4 + declared as usize;
        if buffer.len() < frame_len {
            return Ok(None);
        }
        if declared == 0 {
            return Ok(Some((Message::KeepAlive, 4)));
        }

        let id = buffer[4];
        let body = &buffer[5..frame_len];
        let message = match id {
            0 | 1 | 2 | 3 => {
                if !body.is_empty() {
                    return Err(WireError::InvalidLength { id, length: declared });
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if body.len() != 4 {
                    return Err(WireError::InvalidLength { id, length: declared });
                }
                Message::Have(read_u32(body, 0))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 | 8 => {
                if body.len() != 12 {
                    return Err(WireError::InvalidLength { id, length: declared });
                }
                let index = read_u32(body, 0);
                let begin = read_u32(body, 4);
                let length = read_u32(body, 8);
                if id == 6 {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            7 => {
                if body.len() < 8 {
                    return Err(WireError::InvalidLength { id, length: declared });
                }
                Message::Piece {
                    index: read_u32(body, 0),
                    begin: read_u32(body, 4),
                    block: body[8..].to_vec(),
                }
            }
            other => return Err(WireError::UnknownMessageId(other)),
        };
        Ok(Some((message, frame_len)))
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
