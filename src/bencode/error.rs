use thiserror::Error;

/// Errors raised while encoding or decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed: empty, `-0`, leading zeros, or overflow.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Encountered a byte that cannot start a value (or a non-string key).
    #[error("unexpected character: {0}")]
    UnexpectedChar(char),

    /// Extra data after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,

    /// I/O error during encoding.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
