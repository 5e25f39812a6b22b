use std::net::IpAddr;

use reqwest::Client;
use tracing::debug;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, TrackerEvent, TrackerPeer};
use crate::bencode::{decode, Value};
use crate::constants::TRACKER_HTTP_TIMEOUT;
use crate::metainfo::InfoHash;

/// Parameters for one announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub numwant: usize,
    pub ip: Option<IpAddr>,
    pub event: TrackerEvent,
}

/// An HTTP tracker client.
///
/// Announces are plain GETs with the binary parameters percent-encoded.
/// Compact responses are requested first; if the body fails to parse,
/// one retry without `compact` is made.
pub struct TrackerClient {
    client: Client,
    url: String,
}

impl TrackerClient {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        let client = Client::builder()
            .timeout(TRACKER_HTTP_TIMEOUT)
            .build()
            .map_err(TrackerError::Http)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self.announce_once(request, true).await {
            Err(TrackerError::Bencode(_)) | Err(TrackerError::InvalidResponse(_)) => {
                debug!(url = %self.url, "compact announce unparseable, retrying plain");
                self.announce_once(request, false).await
            }
            other => other,
        }
    }

    async fn announce_once(
        &self,
        request: &AnnounceRequest,
        compact: bool,
    ) -> Result<AnnounceResponse, TrackerError> {
        let url = self.build_url(request, compact);
        let body = self.client.get(&url).send().await?.bytes().await?;
        parse_announce(&body)
    }

    fn build_url(&self, request: &AnnounceRequest, compact: bool) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&numwant={}&compact={}",
            self.url,
            percent_encode(request.info_hash.as_bytes()),
            percent_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.numwant,
            if compact { 1 } else { 0 },
        );
        if let Some(ip) = request.ip {
            url.push_str(&format!("&ip={ip}"));
        }
        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str(&format!("&event={event}"));
        }
        url
    }
}

fn parse_announce(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    if value.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }

    if let Some(reason) = value.get(b"failure reason").and_then(|v| v.as_str()) {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = value
        .get(b"interval")
        .and_then(|v| v.as_integer())
        .map(|n| n.max(0) as u64)
        .unwrap_or(0);

    let complete = value
        .get(b"complete")
        .and_then(|v| v.as_integer())
        .map(|n| n.max(0) as u64);
    let incomplete = value
        .get(b"incomplete")
        .and_then(|v| v.as_integer())
        .map(|n| n.max(0) as u64);

    let peers = match value.get(b"peers") {
        Some(Value::Bytes(data)) => parse_compact_peers(data),
        Some(Value::List(list)) => parse_peer_dicts(list),
        Some(_) => {
            return Err(TrackerError::InvalidResponse("peers neither list nor bytes".into()));
        }
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        complete,
        incomplete,
        peers,
    })
}

fn parse_peer_dicts(list: &[Value]) -> Vec<TrackerPeer> {
    list.iter()
        .filter_map(|entry| {
            let ip: IpAddr = entry.get(b"ip")?.as_str()?.parse().ok()?;
            let port = entry.get(b"port")?.as_integer()?;
            let port = u16::try_from(port).ok()?;
            let peer_id = entry
                .get(b"peer id")
                .and_then(|v| v.as_bytes())
                .and_then(|b| b.as_ref().try_into().ok());
            Some(TrackerPeer {
                addr: std::net::SocketAddr::new(ip, port),
                peer_id,
            })
        })
        .collect()
}

fn percent_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}
