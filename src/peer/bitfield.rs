use bytes::Bytes;

use super::error::PeerError;

/// A bitfield representing which pieces a peer has.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte; the unused low
/// bits of the last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
    ones: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
            ones: 0,
        }
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
            ones: piece_count,
        };
        if let Some(mask) = bf.spare_mask() {
            if let Some(last) = bf.bits.last_mut() {
                *last &= !mask;
            }
        }
        bf
    }

    /// Parses a BITFIELD payload.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes and every
    /// padding bit must be zero.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        if bytes.len() != piece_count.div_ceil(8) {
            return Err(PeerError::Protocol(format!(
                "bitfield is {} bytes, expected {}",
                bytes.len(),
                piece_count.div_ceil(8)
            )));
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
            ones: bytes.iter().map(|b| b.count_ones() as usize).sum(),
        };

        if let (Some(mask), Some(last)) = (bf.spare_mask(), bf.bits.last()) {
            if last & mask != 0 {
                return Err(PeerError::Protocol("bitfield has padding bits set".into()));
            }
        }

        Ok(bf)
    }

    /// Builds a bitfield from a slice of flags.
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut bf = Self::new(flags.len());
        for (index, &flag) in flags.iter().enumerate() {
            if flag {
                bf.set(index);
            }
        }
        bf
    }

    fn spare_mask(&self) -> Option<u8> {
        let spare = self.bits.len() * 8 - self.piece_count;
        (spare > 0).then(|| (1u8 << spare) - 1)
    }

    /// Returns true if the piece at the given index is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit for `index`. Returns true if it was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        self.ones += 1;
        true
    }

    /// Clears the bit for `index`. Returns true if it was previously set.
    pub fn clear(&mut self, index: usize) -> bool {
        if !self.has(index) {
            return false;
        }
        self.bits[index / 8] &= !(1 << (7 - index % 8));
        self.ones -= 1;
        true
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.ones
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.ones == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.ones == 0
    }

    /// Returns the total number of pieces.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts the bitfield to owned bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates over the indices of available pieces.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }

    /// Iterates over the indices of missing pieces.
    pub fn iter_missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| !self.has(i))
    }
}
