use thiserror::Error;

/// Errors that drop a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake prefix or tail was malformed.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// An outgoing peer answered with a different info hash.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// An incoming peer asked for a torrent we are not serving.
    #[error("unknown info hash")]
    UnknownInfoHash,

    /// The remote end presented our own peer id.
    #[error("connected to self")]
    SelfConnection,

    /// Payload length disagrees with the message id, or the message is
    /// otherwise malformed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// Declared frame length exceeds the allocation guard.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Received bitfield does not encode exactly our piece count.
    #[error("bitfield of {actual} bytes, expected {expected}")]
    BitfieldSizeMismatch { expected: usize, actual: usize },

    /// The socket read returned zero bytes.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}
