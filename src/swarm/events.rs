use std::net::SocketAddr;

/// Notifications a swarm emits to its host.
///
/// Delivered over an unbounded channel handed out at construction; every
/// emitter names its event here rather than through any dynamic
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A peer connection was attached and started.
    PeerConnected { conn_id: u64, addr: SocketAddr },
    /// A peer connection terminated and was removed.
    PeerDisconnected { conn_id: u64, addr: SocketAddr },
    /// A piece completed and validated; `have` was broadcast.
    HavePiece { piece: u32 },
    /// A completed piece failed its hash check and was discarded.
    DiscardedPiece { piece: u32 },
    /// Every piece is complete and valid.
    Completed,
    /// An announce succeeded against this tracker.
    TrackerConnected { url: String },
    /// The active tracker failed; retry is scheduled with backoff.
    TrackerLost { url: String },
}
