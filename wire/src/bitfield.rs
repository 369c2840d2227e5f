/// Packed piece-possession map, one bit per piece, most significant bit
/// first within each byte (piece 0 is bit 7 of byte 0, as on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    total_pieces: usize,
    set_count: usize,
}

impl Bitfield {
    /// An empty bitfield sized for `total_pieces`.
    pub fn new(total_pieces: usize) -> Self {
        Bitfield {
            bytes: vec![0u8; Self::expected_len(total_pieces)],
            total_pieces,
            set_count: 0,
        }
    }

    /// Builds a bitfield from received bytes. Bits beyond `total_pieces` are
    /// ignored here; callers reject peers that set them (see
    /// [`Bitfield::spare_bits_set`]).
    pub fn from_bytes(bytes: &[u8], total_pieces: usize) -> Self {
        let mut field = Bitfield {
            bytes: bytes.to_vec(),
            total_pieces,
            set_count: 0,
        };
        field.bytes.resize(Self::expected_len(total_pieces), 0);
        field.set_count = (0..total_pieces).filter(|&i| field.has_piece(i)).count();
        field
    }

    /// Number of bytes a well-formed bitfield frame carries for
    /// `total_pieces` pieces.
    pub fn expected_len(total_pieces: usize) -> usize {
        total_pieces.div_ceil(8)
    }

    /// True if any bit at or past `total_pieces` is set in `bytes`. A remote
    /// bitfield with spare bits set is a protocol violation.
    pub fn spare_bits_set(bytes: &[u8], total_pieces: usize) -> bool {
        for (byte_index, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                let piece = byte_index * 8 + bit;
                if piece >= total_pieces && byte & (1 << (7 - bit)) != 0 {
                    return true;
                }
            }
        }
        false
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.total_pieces {
            return false;
        }
        self.bytes[index / 8] & (1 << (7 - (index % 8))) != 0
    }

    /// Sets a piece bit; out-of-range indices are ignored.
    pub fn set_piece(&mut self, index: usize) {
        if index >= self.total_pieces {
            return;
        }
        let mask = 1 << (7 - (index % 8));
        let byte = &mut self.bytes[index / 8];
        if *byte & mask == 0 {
            *byte |= mask;
            self.set_count += 1;
        }
    }

    /// O(1): completeness is tracked with a set-bit counter rather than
    /// rescanned, so spare bits in the final byte never count.
    pub fn has_all_pieces(&self) -> bool {
        self.set_count == self.total_pieces
    }

    /// Number of pieces currently set.
    pub fn count(&self) -> usize {
        self.set_count
    }

    pub fn total_pieces(&self) -> usize {
        self.total_pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
