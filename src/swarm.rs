//! The swarm controller: cross-peer policy for one package.
//!
//! A [`Swarm`] owns the peer set and runs a periodic heartbeat that
//! drives piece ordering, choke policy, peer acquisition, tracker
//! lifecycle, keepalives, and bandwidth apportionment. Hosts observe it
//! through the [`SwarmEvent`] channel.

mod controller;
mod error;
mod events;
mod order;

pub use controller::{Swarm, SwarmConfig, SwarmStats};
pub use error::SwarmError;
pub use events::SwarmEvent;
pub use order::PieceOrder;

#[cfg(test)]
mod tests;
