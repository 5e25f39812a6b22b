use std::hash::{Hash, Hasher};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::coverage::Range;

/// A fixed-offset, fixed-length byte region inside a piece.
///
/// Identity is the `(piece_index, begin, length)` triple; the data
/// buffer accumulates through [`Block::add_chunk`] and is excluded from
/// equality. A block is complete once the buffer reaches its declared
/// length.
#[derive(Debug, Clone)]
pub struct Block {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
    data: BytesMut,
    requested: bool,
    requested_at: Option<Instant>,
}

impl Block {
    /// Creates an empty block awaiting data.
    pub fn new(piece_index: u32, begin: u32, length: u32) -> Self {
        Self {
            piece_index,
            begin,
            length,
            data: BytesMut::with_capacity(length as usize),
            requested: false,
            requested_at: None,
        }
    }

    /// Creates an already-complete block from received or disk data.
    pub fn with_data(piece_index: u32, begin: u32, data: Bytes) -> Self {
        Self {
            piece_index,
            begin,
            length: data.len() as u32,
            data: BytesMut::from(&data[..]),
            requested: false,
            requested_at: None,
        }
    }

    /// Appends received bytes. The buffer only ever grows.
    pub fn add_chunk(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn take_data(self) -> Bytes {
        self.data.freeze()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.length as usize
    }

    /// The byte range this block occupies within its piece.
    pub fn piece_range(&self) -> Range {
        Range::with_len(self.begin as u64, self.length as u64)
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn requested_at(&self) -> Option<Instant> {
        self.requested_at
    }

    /// Stamps the block as requested on the wire.
    pub fn mark_requested(&mut self) {
        self.requested = true;
        self.requested_at = Some(Instant::now());
    }

    /// Clears the request stamp, e.g. when the request timed out.
    pub fn clear_requested(&mut self) {
        self.requested = false;
        self.requested_at = None;
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.piece_index == other.piece_index
            && self.begin == other.begin
            && self.length == other.length
    }
}

impl Eq for Block {}

impl Hash for Block {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.piece_index.hash(state);
        self.begin.hash(state);
        self.length.hash(state);
    }
}
