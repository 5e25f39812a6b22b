use crate::bencode::BencodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// The info dict must carry exactly one of `length` and `files`.
    #[error("info dict has both length and files")]
    AmbiguousFileMode,

    /// Total content size exceeds what the piece hashes can cover.
    #[error("content size {total} exceeds piece coverage {covered}")]
    PieceCoverage { total: u64, covered: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
