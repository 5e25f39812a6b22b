//! torpak - a BitTorrent package-transfer engine
//!
//! This library implements the core of a BitTorrent peer: a disk-backed
//! piece store with SHA-1 validation, the peer wire protocol, tracker
//! coordination, and a per-package swarm controller.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode encoding/decoding
//! - [`metainfo`] - Torrent metainfo parsing and validation
//! - [`coverage`] - Range arithmetic over partially-filled byte domains
//! - [`storage`] - Packages, pieces, and blocks on disk
//! - [`peer`] - Peer wire protocol and per-peer state machine
//! - [`tracker`] - HTTP tracker announces
//! - [`swarm`] - Cross-peer policy: piece ordering, choking, end-game
//! - [`server`] - Listener, handshake, and the runtime value

pub mod bencode;
pub mod constants;
pub mod coverage;
pub mod metainfo;
pub mod peer;
pub mod server;
pub mod storage;
pub mod swarm;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use coverage::{CoverageError, Covering, Range};
pub use metainfo::{Info, InfoHash, Metainfo, MetainfoError};
pub use peer::{Bitfield, Message, PeerConnection, PeerError, PeerId, RateMeter};
pub use server::Runtime;
pub use storage::{Block, Package, Piece, StorageError};
pub use swarm::{Swarm, SwarmConfig, SwarmError, SwarmEvent, SwarmStats};
pub use tracker::{AnnounceResponse, TrackerClient, TrackerError, TrackerEvent, TrackerSession};
