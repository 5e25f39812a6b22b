use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::block::Block;
use super::error::StorageError;
use super::package::FileTable;
use crate::coverage::{Covering, Range};

/// One SHA-1-verified unit of the package.
///
/// Two coverings are kept over the piece's byte range: `have` (bytes on
/// disk) and `claimed` (bytes some peer has been asked for, a superset
/// of `have`). Validity is three-state: unknown until computed, then
/// cached until the next write invalidates it.
pub struct Piece {
    index: u32,
    expected_sha1: [u8; 20],
    /// Absolute start offset within the package's byte stream.
    offset: u64,
    length: u64,
    files: Arc<FileTable>,
    state: Mutex<PieceState>,
}

struct PieceState {
    have: Covering,
    claimed: Covering,
    valid: Option<bool>,
}

impl Piece {
    pub fn new(
        index: u32,
        expected_sha1: [u8; 20],
        offset: u64,
        length: u64,
        files: Arc<FileTable>,
    ) -> Self {
        let domain = Range::new(0, length);
        Self {
            index,
            expected_sha1,
            offset,
            length,
            files,
            state: Mutex::new(PieceState {
                have: Covering::new(domain),
                claimed: Covering::new(domain),
                valid: None,
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// True once every byte is on disk.
    pub fn is_complete(&self) -> bool {
        self.state.lock().have.is_complete()
    }

    /// True if anything has been claimed or received.
    pub fn is_started(&self) -> bool {
        let state = self.state.lock();
        !state.claimed.is_empty() || !state.have.is_empty()
    }

    /// Bytes not yet on disk.
    pub fn missing_len(&self) -> u64 {
        self.length - self.state.lock().have.covered_len()
    }

    /// Bytes not yet claimed by any request.
    pub fn unclaimed_len(&self) -> u64 {
        self.length - self.state.lock().claimed.covered_len()
    }

    /// Marks a piece that pre-existing file data already covers.
    pub fn assume_complete(&self) {
        let domain = Range::new(0, self.length);
        let mut state = self.state.lock();
        if let (Ok(have), Ok(claimed)) = (state.have.fill(domain), state.claimed.fill(domain)) {
            state.have = have;
            state.claimed = claimed;
            state.valid = Some(true);
        }
    }

    /// Walks the unclaimed gaps in ascending order, split into blocks of
    /// at most `max_len` bytes. Stops early when `f` returns false.
    pub fn for_each_unclaimed_block<F>(&self, max_len: u32, f: F) -> Result<(), StorageError>
    where
        F: FnMut(Block) -> bool,
    {
        let gaps = {
            let state = self.state.lock();
            state.claimed.gaps(state.claimed.domain())?
        };
        self.emit_chunked(gaps, max_len, f);
        Ok(())
    }

    /// Walks the gaps of `have` (bytes not on disk), claimed or not.
    pub fn for_each_empty_block<F>(&self, max_len: u32, f: F) -> Result<(), StorageError>
    where
        F: FnMut(Block) -> bool,
    {
        let gaps = {
            let state = self.state.lock();
            state.have.gaps(state.have.domain())?
        };
        self.emit_chunked(gaps, max_len, f);
        Ok(())
    }

    fn emit_chunked<F>(&self, gaps: Vec<Range>, max_len: u32, mut f: F)
    where
        F: FnMut(Block) -> bool,
    {
        for gap in gaps {
            let mut begin = gap.first();
            while begin < gap.last() {
                let len = (gap.last() - begin).min(max_len as u64) as u32;
                if !f(Block::new(self.index, begin as u32, len)) {
                    return;
                }
                begin += len as u64;
            }
        }
    }

    /// Records that a peer has been asked for this block. Idempotent.
    pub fn claim_block(&self, block: &Block) -> Result<(), StorageError> {
        self.check_block(block)?;
        let mut state = self.state.lock();
        state.claimed = state.claimed.fill(block.piece_range())?;
        Ok(())
    }

    /// Returns a claimed block to the pool. Idempotent.
    ///
    /// Bytes of the block that are already on disk stay claimed, so
    /// `have` remains a subset of `claimed`.
    pub fn unclaim_block(&self, block: &Block) -> Result<(), StorageError> {
        self.check_block(block)?;
        let range = block.piece_range();
        let mut state = self.state.lock();
        let mut claimed = state.claimed.poke(range)?;
        for held in state.have.ranges() {
            if let Some(overlap) = held.intersection(&range) {
                claimed = claimed.fill(overlap)?;
            }
        }
        state.claimed = claimed;
        Ok(())
    }

    /// Persists a completed block and folds it into `have`.
    ///
    /// Returns true if this write completed the piece. Any add resets the
    /// cached validity to unknown.
    pub async fn add_block(&self, block: &Block) -> Result<bool, StorageError> {
        self.check_block(block)?;
        self.files
            .write_at(self.offset + block.begin as u64, block.data())
            .await?;

        let mut state = self.state.lock();
        let range = block.piece_range();
        state.have = state.have.fill(range)?;
        // Received bytes are implicitly claimed: have stays a subset.
        state.claimed = state.claimed.fill(range)?;
        state.valid = None;
        Ok(state.have.is_complete())
    }

    /// Checks the persisted bytes against the expected SHA-1.
    ///
    /// Requires the piece to be complete. The verdict is cached until the
    /// next `add_block` or `discard`.
    pub async fn is_valid(&self) -> Result<bool, StorageError> {
        {
            let state = self.state.lock();
            if let Some(valid) = state.valid {
                return Ok(valid);
            }
            if !state.have.is_complete() {
                return Err(StorageError::PieceIncomplete(self.index));
            }
        }

        let mut buf = vec![0u8; self.length as usize];
        self.files.read_at(self.offset, &mut buf).await?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest: [u8; 20] = hasher.finalize().into();
        let valid = digest == self.expected_sha1;

        self.state.lock().valid = Some(valid);
        Ok(valid)
    }

    /// Forgets everything received and claimed. Disk bytes are left in
    /// place; they will be overwritten on re-download.
    pub fn discard(&self) {
        let domain = Range::new(0, self.length);
        let mut state = self.state.lock();
        state.have = Covering::new(domain);
        state.claimed = Covering::new(domain);
        state.valid = Some(false);
    }

    /// Reads a block back from disk. Requires the piece to be complete.
    pub async fn read_block(&self, begin: u32, length: u32) -> Result<Block, StorageError> {
        let probe = Block::new(self.index, begin, length);
        self.check_block(&probe)?;
        if !self.is_complete() {
            return Err(StorageError::PieceIncomplete(self.index));
        }

        let mut buf = vec![0u8; length as usize];
        self.files.read_at(self.offset + begin as u64, &mut buf).await?;
        Ok(Block::with_data(self.index, begin, Bytes::from(buf)))
    }

    fn check_block(&self, block: &Block) -> Result<(), StorageError> {
        let fits = block.piece_index == self.index
            && block.length > 0
            && (block.begin as u64 + block.length as u64) <= self.length;
        if fits {
            Ok(())
        } else {
            Err(StorageError::InvalidBlock {
                piece: block.piece_index,
                begin: block.begin,
                length: block.length,
            })
        }
    }
}
