//! Peer wire protocol.
//!
//! Message framing and codec, the per-peer duplex state machine, and the
//! handshake. Each connection runs an input task and an output task
//! joined by a message queue; policy decisions come from the swarm
//! controller through the [`BlockScheduler`] trait.

mod bitfield;
mod connection;
mod error;
mod message;
mod peer_id;
mod rate;

pub use bitfield::Bitfield;
pub use connection::{BlockScheduler, Claim, PeerConnection, PeerEvent};
pub use error::PeerError;
pub use message::{
    handshake_prefix, handshake_tail, Message, MessageId, HANDSHAKE_PREFIX_LEN, HANDSHAKE_TAIL_LEN,
};
pub use peer_id::PeerId;
pub use rate::RateMeter;

#[cfg(test)]
mod tests;
