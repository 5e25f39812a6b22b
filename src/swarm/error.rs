use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error("peer error: {0}")]
    Peer(#[from] crate::peer::PeerError),

    /// Peer table full and no connection is displaceable.
    #[error("peer table full")]
    AtCapacity,
}
