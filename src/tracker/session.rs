use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::response::{AnnounceResponse, TrackerPeer};
use crate::constants::{TRACKER_NUMWANT, TRACKER_NUMWANT_STEP};

/// Book-keeping for the one tracker the controller is talking to.
///
/// Tracks the last returned peer list, which entries have been dialed,
/// the refresh deadline, and the `numwant` escalation used once every
/// returned peer has been tried.
#[derive(Debug)]
pub struct TrackerSession {
    url: String,
    numwant: usize,
    interval: Duration,
    peers: Vec<TrackerPeer>,
    tried: HashSet<SocketAddr>,
    last_announce: Option<Instant>,
}

impl TrackerSession {
    pub fn new(url: String) -> Self {
        Self {
            url,
            numwant: TRACKER_NUMWANT,
            interval: Duration::ZERO,
            peers: Vec::new(),
            tried: HashSet::new(),
            last_announce: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn numwant(&self) -> usize {
        self.numwant
    }

    pub fn peers(&self) -> &[TrackerPeer] {
        &self.peers
    }

    /// Folds in an announce response: new peer list, new interval.
    pub fn record_response(&mut self, response: AnnounceResponse) {
        self.interval = Duration::from_secs(response.interval);
        self.peers = response.peers;
        self.last_announce = Some(Instant::now());
    }

    /// True when the tracker-reported interval has elapsed (or no
    /// announce has happened yet).
    pub fn refresh_due(&self) -> bool {
        match self.last_announce {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Peers from the last response that have not been dialed.
    pub fn untried(&self) -> Vec<TrackerPeer> {
        self.peers
            .iter()
            .filter(|p| !self.tried.contains(&p.addr))
            .cloned()
            .collect()
    }

    /// Marks an address dialed, successfully or not.
    pub fn mark_tried(&mut self, addr: SocketAddr) {
        self.tried.insert(addr);
    }

    /// True once every returned peer has been tried and a larger
    /// `numwant` could plausibly return more.
    pub fn exhausted(&self) -> bool {
        self.numwant <= self.peers.len()
            && self
                .peers
                .iter()
                .all(|p| self.tried.contains(&p.addr))
    }

    /// Raises `numwant` and forces the next heartbeat to re-announce.
    pub fn widen(&mut self) {
        self.numwant += TRACKER_NUMWANT_STEP;
        self.last_announce = None;
    }
}
