use std::{error::Error, fmt};

#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Frame carried a message id outside the core peer-wire set (0..=8).
    UnknownMessageId(u8),
    /// Declared frame length does not fit the fixed layout of the message id.
    InvalidLength { id: u8, length: u32 },
    /// Declared frame length exceeds the sanity cap.
    FrameTooLarge(u32),
    /// Handshake frame did not carry the expected protocol string.
    InvalidHandshake,
    /// Block offset does not name a block of the piece.
    BlockOutOfBounds { piece: u32, begin: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownMessageId(id) => write!(f, "Unknown message id {}", id),
            WireError::InvalidLength { id, length } => {
                write!(f, "Invalid frame length {} for message id {}", length, id)
            }
            WireError::FrameTooLarge(length) => {
                write!(f, "Declared frame length {} exceeds the allowed maximum", length)
            }
            WireError::InvalidHandshake => write!(f, "Malformed handshake frame"),
            WireError::BlockOutOfBounds { piece, begin } => {
                write!(f, "Block offset {} out of bounds for piece {}", begin, piece)
            }
        }
    }
}

impl Error for WireError {}
