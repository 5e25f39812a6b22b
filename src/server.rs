//! TCP listener, handshake, and the per-process runtime.
//!
//! A [`Runtime`] owns the listener, the local peer id, and the table
//! mapping info hashes to swarms; it is an explicit value passed by
//! reference, never process-global state. Incoming connections are
//! handshaken here and dispatched to the swarm serving their hash.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{ACCEPT_RETRY_SLEEP, LISTEN_PORT_RANGE, PROTOCOL_STRING};
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::{handshake_prefix, handshake_tail, PeerError, PeerId};
use crate::storage::Package;
use crate::swarm::{Swarm, SwarmConfig, SwarmError, SwarmEvent};

/// Owns the listener, peer id, and info-hash dispatch table.
pub struct Runtime {
    peer_id: PeerId,
    listen_port: u16,
    swarms: DashMap<InfoHash, Arc<Swarm>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Binds the listener and starts accepting.
    ///
    /// With no pinned port, the first free port in the well-known range
    /// is taken.
    pub async fn start(port: Option<u16>) -> Result<Arc<Self>, SwarmError> {
        let (listener, listen_port) = bind_listener(port).await.map_err(PeerError::from)?;
        info!(port = listen_port, "listening");

        let runtime = Arc::new(Self {
            peer_id: PeerId::generate(),
            listen_port,
            swarms: DashMap::new(),
            accept_task: Mutex::new(None),
        });

        let accept = {
            let runtime = runtime.clone();
            tokio::spawn(runtime.accept_loop(listener))
        };
        *runtime.accept_task.lock() = Some(accept);
        Ok(runtime)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Binds a torrent to a destination path and starts a swarm for it.
    ///
    /// `assume_valid` controls whether pieces fully covered by
    /// pre-existing file bytes are trusted without hashing.
    pub async fn add_package(
        &self,
        metainfo: &Metainfo,
        dest: &Path,
        assume_valid: bool,
        mut config: SwarmConfig,
    ) -> Result<(Arc<Swarm>, mpsc::UnboundedReceiver<SwarmEvent>), SwarmError> {
        let package = Arc::new(Package::bind(&metainfo.info, dest, assume_valid).await?);
        config.listen_port = self.listen_port;
        let (swarm, events) = Swarm::create(metainfo, package, self.peer_id, config);
        self.swarms.insert(metainfo.info_hash, swarm.clone());
        swarm.start();
        Ok((swarm, events))
    }

    pub fn swarm(&self, info_hash: &InfoHash) -> Option<Arc<Swarm>> {
        self.swarms.get(info_hash).map(|entry| entry.clone())
    }

    /// Stops and removes the swarm serving the given hash.
    pub async fn remove_package(&self, info_hash: &InfoHash) {
        if let Some((_, swarm)) = self.swarms.remove(info_hash) {
            swarm.shutdown().await;
        }
    }

    /// Stops the listener and every swarm.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let hashes: Vec<InfoHash> = self.swarms.iter().map(|entry| *entry.key()).collect();
        for hash in hashes {
            self.remove_package(&hash).await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = runtime.accept_peer(stream, addr).await {
                            debug!(peer = %addr, "incoming handshake failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_SLEEP).await;
                }
            }
        }
    }

    /// Incoming handshake: send only the 28-byte prefix, read the peer's
    /// prefix and info hash, and commit our hash and id only once the
    /// hash maps to a swarm we serve.
    async fn accept_peer(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), SwarmError> {
        stream
            .write_all(&handshake_prefix())
            .await
            .map_err(PeerError::from)?;

        read_handshake_prefix(&mut stream).await?;
        let their_hash = InfoHash::new(read_array::<20>(&mut stream).await?);
        let swarm = self
            .swarm(&their_hash)
            .ok_or(PeerError::UnknownInfoHash)?;

        stream
            .write_all(&handshake_tail(their_hash.as_bytes(), self.peer_id.as_bytes()))
            .await
            .map_err(PeerError::from)?;

        let their_id = read_array::<20>(&mut stream).await?;
        if &their_id == self.peer_id.as_bytes() {
            return Err(PeerError::SelfConnection.into());
        }

        swarm.attach_peer(stream, addr, PeerId(their_id), true)?;
        Ok(())
    }
}

/// Outgoing handshake with the info hash precommitted.
pub(crate) async fn connect_peer(
    addr: SocketAddr,
    info_hash: InfoHash,
    our_id: PeerId,
) -> Result<(TcpStream, PeerId), PeerError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&handshake_prefix()).await?;
    stream
        .write_all(&handshake_tail(info_hash.as_bytes(), our_id.as_bytes()))
        .await?;

    read_handshake_prefix(&mut stream).await?;
    let their_hash = read_array::<20>(&mut stream).await?;
    if &their_hash != info_hash.as_bytes() {
        return Err(PeerError::InfoHashMismatch);
    }
    let their_id = read_array::<20>(&mut stream).await?;
    if &their_id == our_id.as_bytes() {
        return Err(PeerError::SelfConnection);
    }
    Ok((stream, PeerId(their_id)))
}

async fn read_handshake_prefix(stream: &mut TcpStream) -> Result<(), PeerError> {
    let len = read_array::<1>(stream).await?[0];
    if len as usize != PROTOCOL_STRING.len() {
        return Err(PeerError::InvalidHandshake);
    }
    let proto = read_array::<19>(stream).await?;
    if &proto[..] != PROTOCOL_STRING {
        return Err(PeerError::InvalidHandshake);
    }
    let _reserved = read_array::<8>(stream).await?;
    Ok(())
}

async fn read_array<const N: usize>(stream: &mut TcpStream) -> Result<[u8; N], PeerError> {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) async fn bind_listener(port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    let listener = match port {
        Some(port) => TcpListener::bind(("0.0.0.0", port)).await?,
        None => {
            let mut last_err = None;
            let mut bound = None;
            for candidate in LISTEN_PORT_RANGE {
                match TcpListener::bind(("0.0.0.0", candidate)).await {
                    Ok(listener) => {
                        bound = Some(listener);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match bound {
                Some(listener) => listener,
                None => {
                    return Err(last_err
                        .unwrap_or_else(|| std::io::Error::other("no free listen port")))
                }
            }
        }
    };
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}
