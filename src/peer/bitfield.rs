use bytes::Bytes;

use super::error::PeerError;

/// A packed bit-vector of piece availability, MSB-first.
///
/// Bit 7 of byte 0 is piece 0. The encoded form is exactly
/// `ceil(piece_count / 8)` bytes with spare bits zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Builds a bitfield by probing each piece index.
    pub fn from_fn<F>(piece_count: usize, mut has: F) -> Self
    where
        F: FnMut(usize) -> bool,
    {
        let mut bf = Self::new(piece_count);
        for i in 0..piece_count {
            if has(i) {
                bf.set(i);
            }
        }
        bf
    }

    /// Parses a received bitfield, requiring the exact encoded size.
    /// Spare bits in the last byte are cleared.
    pub fn from_wire(bytes: Bytes, piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::BitfieldSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut bits = bytes.to_vec();
        let spare = expected * 8 - piece_count;
        if spare > 0 {
            bits[expected - 1] &= 0xFFu8 << spare;
        }
        Ok(Self { bits, piece_count })
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Number of pieces marked present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates the indices of set bits.
    pub fn present(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }
}
