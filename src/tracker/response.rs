use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A peer as returned by a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerPeer {
    pub addr: SocketAddr,
    /// Present only in non-compact responses that carry a `peer id`.
    pub peer_id: Option<[u8; 20]>,
}

impl TrackerPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }

    /// Parses one 6-byte compact record: IPv4 address then port, both
    /// big-endian.
    pub fn from_compact(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Some(Self {
            addr: SocketAddr::new(IpAddr::V4(ip), port),
            peer_id: None,
        })
    }
}

/// Parses a compact peers byte string into addresses, ignoring a ragged
/// tail.
pub fn parse_compact_peers(data: &[u8]) -> Vec<TrackerPeer> {
    data.chunks_exact(6)
        .filter_map(TrackerPeer::from_compact)
        .collect()
}

/// The announce `event` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Periodic refresh; the parameter is omitted.
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// A parsed announce response.
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Seconds until the next refresh, floored at zero.
    pub interval: u64,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<TrackerPeer>,
}
