//! Protocol constants and tuning parameters.
//!
//! Timeouts, intervals, window sizes, and policy knobs used across the
//! engine. Values follow the classic client defaults for a single-package
//! swarm controller.

use std::ops::RangeInclusive;
use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &str = "-TK0001-";

/// BitTorrent protocol string exchanged in the handshake.
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Reserved bytes in the handshake. No extensions are advertised.
pub const RESERVED_BYTES: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 0];

// ============================================================================
// Ports
// ============================================================================

/// Ports probed in order when no listen port is pinned.
pub const LISTEN_PORT_RANGE: RangeInclusive<u16> = 6881..=6889;

// ============================================================================
// Wire limits
// ============================================================================

/// Preferred block size for requests (16KB).
pub const BLOCK_SIZE: u32 = 16384;

/// Largest frame we accept from a peer. Guards against allocation bombs.
pub const MAX_FRAME_LEN: usize = 512 * 1024;

/// Blocks are split into chunks of this size when written to the socket.
pub const SEND_CHUNK_SIZE: usize = 8192;

// ============================================================================
// Request pipelining
// ============================================================================

/// Refill the want queue when it drops below this many blocks.
pub const MIN_REQUESTS: usize = 2;

/// Maximum block requests in flight per peer.
pub const MAX_REQUESTS: usize = 5;

/// A requested block not answered within this window is returned to the pool.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Heartbeat and rate accounting
// ============================================================================

/// Controller heartbeat period. All time-based policy runs on this clock.
pub const HEARTBEAT: Duration = Duration::from_secs(5);

/// Sliding window for rate estimation and bandwidth apportionment.
pub const RATE_WINDOW: Duration = Duration::from_secs(20);

// ============================================================================
// Piece ordering
// ============================================================================

/// Recalculate the piece order after this many popularity changes.
pub const POP_RECALC_THRESHOLD: usize = 20;

/// Recalculate the piece order at least this often while changes are pending.
pub const POP_RECALC_LIMIT: Duration = Duration::from_secs(30);

/// Opening mode ends once this many pieces have completed.
pub const FUSEKI_PIECE_LIMIT: usize = 2;

/// End-game begins when at most this many pieces remain.
pub const ENDGAME_PIECE_LIMIT: usize = 5;

/// Below this aggregate download rate (bytes/s) the swarm counts as snubbed.
pub const ANTISNUB_RATE_FLOOR: u64 = 1024;

// ============================================================================
// Choke policy
// ============================================================================

/// Peers kept unchoked on merit.
pub const NUM_FRIENDS: usize = 4;

/// Baseline optimistic unchoke slots.
pub const NUM_OPTUNCHOKES: isize = 1;

/// Probability of awarding an optimistic unchoke to each candidate.
pub const NEW_OPTUNCHOKE_PROB: f64 = 0.5;

/// Interval between friend (merit unchoke) recalculations.
pub const CALC_FRIENDS_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between optimistic unchoke rounds.
pub const CALC_OPTUNCHOKES_INTERVAL: Duration = Duration::from_secs(30);

/// An unchoked, interested peer that sends nothing for this long is a snub.
pub const ANTISNUB_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Peer lifecycle
// ============================================================================

/// Hard cap on concurrent peer connections.
pub const MAX_PEERS: usize = 15;

/// Dial attempts per heartbeat.
pub const PEER_ADDS_PER_HEARTBEAT: usize = 3;

/// Outgoing dials are delayed by a uniform 0..this to spread attempts.
pub const DIAL_JITTER_MAX: Duration = Duration::from_secs(10);

/// A peer we have not sent anything to for this long is shut down.
pub const SILENT_DEATH_INTERVAL: Duration = Duration::from_secs(240);

/// A displaceable peer: nothing received for this long.
pub const BOREDOM_DEATH_INTERVAL: Duration = Duration::from_secs(120);

/// Idle connections get a keepalive after this long without a send.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// With a download limit set, stop adding peers above this fraction of it.
pub const PEER_ADD_RATE_HEADROOM: f64 = 0.75;

// ============================================================================
// Tracker
// ============================================================================

/// First retry delay after a tracker failure.
pub const TRACKER_RETRY_INITIAL: Duration = Duration::from_secs(5);

/// Retry delay ceiling; the delay doubles per consecutive failure.
pub const TRACKER_RETRY_CAP: Duration = Duration::from_secs(3600);

/// Default number of peers requested from the tracker.
pub const TRACKER_NUMWANT: usize = 50;

/// Step by which `numwant` grows when the peer list is exhausted.
pub const TRACKER_NUMWANT_STEP: usize = 50;

/// HTTP timeout for a single announce.
pub const TRACKER_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Shutdown
// ============================================================================

/// Bound on waiting for the heartbeat task to observe shutdown.
pub const SHUTDOWN_JOIN_WAIT: Duration = Duration::from_millis(200);

/// Sleep after a listener accept error before retrying.
pub const ACCEPT_RETRY_SLEEP: Duration = Duration::from_millis(500);
