use crate::coverage::CoverageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A block or range fell outside its piece.
    #[error("range error: {0}")]
    Coverage(#[from] CoverageError),

    /// Block coordinates do not fit the addressed piece.
    #[error("invalid block: piece {piece}, begin {begin}, length {length}")]
    InvalidBlock { piece: u32, begin: u32, length: u32 },

    /// Tried to read a block from a piece that is not complete.
    #[error("piece {0} is not complete")]
    PieceIncomplete(u32),

    /// A file path escaped the destination directory.
    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
