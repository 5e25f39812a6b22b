use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng as _;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::SwarmError;
use super::events::SwarmEvent;
use super::order::PieceOrder;
use crate::constants::{
    ANTISNUB_INTERVAL, ANTISNUB_RATE_FLOOR, BLOCK_SIZE, BOREDOM_DEATH_INTERVAL,
    CALC_FRIENDS_INTERVAL, CALC_OPTUNCHOKES_INTERVAL, DIAL_JITTER_MAX, ENDGAME_PIECE_LIMIT,
    FUSEKI_PIECE_LIMIT, HEARTBEAT, KEEPALIVE_INTERVAL, MAX_PEERS, NEW_OPTUNCHOKE_PROB,
    NUM_FRIENDS, NUM_OPTUNCHOKES, PEER_ADDS_PER_HEARTBEAT, PEER_ADD_RATE_HEADROOM, RATE_WINDOW,
    SHUTDOWN_JOIN_WAIT, SILENT_DEATH_INTERVAL, TRACKER_NUMWANT, TRACKER_RETRY_CAP,
    TRACKER_RETRY_INITIAL,
};
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::{BlockScheduler, Claim, PeerConnection, PeerEvent, PeerId};
use crate::storage::{Block, Package};
use crate::tracker::{
    AnnounceRequest, AnnounceResponse, TrackerClient, TrackerError, TrackerEvent, TrackerPeer,
    TrackerSession,
};

/// Host-tunable swarm parameters.
#[derive(Debug, Clone, Default)]
pub struct SwarmConfig {
    /// Download rate limit in bytes per second; `None` is unlimited.
    pub download_limit: Option<u64>,
    /// Upload rate limit in bytes per second; `None` is unlimited.
    pub upload_limit: Option<u64>,
    /// Port announced to the tracker.
    pub listen_port: u16,
    /// Externally visible address, announced to the tracker and used to
    /// avoid dialing ourselves.
    pub public_ip: Option<IpAddr>,
}

/// A point-in-time view of swarm progress.
#[derive(Debug, Clone)]
pub struct SwarmStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub num_peers: usize,
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub endgame: bool,
    pub fuseki: bool,
    pub antisnub: bool,
}

enum TrackerSlot {
    /// No tracker; retry scheduled with exponential backoff.
    Idle { next_attempt: Instant, delay: Duration },
    Active(TrackerSession),
}

struct ControlState {
    order: PieceOrder,
    fuseki: bool,
    antisnub: bool,
    endgame: bool,
    tracker: TrackerSlot,
    /// Announce URLs: tiers shuffled within themselves, concatenated.
    urls: Vec<String>,
    cursor: usize,
    announce_in_flight: bool,
    completed_sent: bool,
    last_friends: Instant,
    last_optunchokes: Instant,
    optimistic: HashSet<u64>,
    heartbeat: Option<JoinHandle<()>>,
    events_task: Option<JoinHandle<()>>,
}

/// The cross-peer policy engine for one package.
///
/// Owns the peer connection set exclusively; peers reach back only
/// through [`BlockScheduler`]. All time-based policy runs on a 5-second
/// heartbeat task; received-block and disconnect handling runs on a
/// separate event pump so the heartbeat never blocks on disk.
///
/// Lock order: the peer-set lock is never acquired while holding the
/// control-state lock.
pub struct Swarm {
    info_hash: InfoHash,
    peer_id: PeerId,
    package: Arc<Package>,
    config: SwarmConfig,
    state: Mutex<ControlState>,
    peers: Mutex<HashMap<u64, Arc<PeerConnection>>>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_tx: mpsc::UnboundedSender<SwarmEvent>,
    running: AtomicBool,
    next_conn_id: AtomicU64,
    retired_downloaded: AtomicU64,
    retired_uploaded: AtomicU64,
}

impl Swarm {
    /// Builds a swarm over a bound package and starts its event pump.
    /// The heartbeat starts separately via [`Swarm::start`].
    pub fn create(
        metainfo: &Metainfo,
        package: Arc<Package>,
        peer_id: PeerId,
        config: SwarmConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SwarmEvent>) {
        let mut urls = Vec::new();
        {
            let mut rng = rand::rng();
            for mut tier in metainfo.tracker_tiers() {
                tier.shuffle(&mut rng);
                urls.extend(tier);
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let piece_count = package.piece_count();

        let swarm = Arc::new(Self {
            info_hash: metainfo.info_hash,
            peer_id,
            package,
            config,
            state: Mutex::new(ControlState {
                order: PieceOrder::new(piece_count),
                fuseki: true,
                antisnub: false,
                endgame: false,
                tracker: TrackerSlot::Idle {
                    next_attempt: Instant::now(),
                    delay: TRACKER_RETRY_INITIAL,
                },
                urls,
                cursor: 0,
                announce_in_flight: false,
                completed_sent: false,
                last_friends: Instant::now(),
                last_optunchokes: Instant::now(),
                optimistic: HashSet::new(),
                heartbeat: None,
                events_task: None,
            }),
            peers: Mutex::new(HashMap::new()),
            peer_events_tx,
            events_tx,
            running: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            retired_downloaded: AtomicU64::new(0),
            retired_uploaded: AtomicU64::new(0),
        });

        let pump = {
            let swarm = swarm.clone();
            tokio::spawn(swarm.run_events(peer_events_rx))
        };
        swarm.state.lock().events_task = Some(pump);

        (swarm, events_rx)
    }

    /// Spawns the heartbeat task.
    pub fn start(self: &Arc<Self>) {
        let swarm = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !swarm.running.load(Ordering::Acquire) {
                    break;
                }
                swarm.tick().await;
            }
        });
        self.state.lock().heartbeat = Some(handle);
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn stats(&self) -> SwarmStats {
        let downloaded = self.downloaded_total();
        let uploaded = self.uploaded_total();
        let download_rate = self.download_rate();
        let upload_rate = self.upload_rate();
        let num_peers = self.peers.lock().len();
        let (endgame, fuseki, antisnub) = {
            let state = self.state.lock();
            (state.endgame, state.fuseki, state.antisnub)
        };
        SwarmStats {
            downloaded,
            uploaded,
            download_rate,
            upload_rate,
            num_peers,
            completed_pieces: self.package.completed_count(),
            total_pieces: self.package.piece_count(),
            endgame,
            fuseki,
            antisnub,
        }
    }

    /// Total bytes downloaded, departed peers included.
    pub fn downloaded_total(&self) -> u64 {
        let live: u64 = self
            .peers
            .lock()
            .values()
            .map(|c| c.downloaded_total())
            .sum();
        self.retired_downloaded.load(Ordering::Relaxed) + live
    }

    /// Total bytes uploaded, departed peers included.
    pub fn uploaded_total(&self) -> u64 {
        let live: u64 = self.peers.lock().values().map(|c| c.uploaded_total()).sum();
        self.retired_uploaded.load(Ordering::Relaxed) + live
    }

    /// Aggregate download rate across connected peers, bytes/s.
    pub fn download_rate(&self) -> u64 {
        self.peers.lock().values().map(|c| c.download_rate()).sum()
    }

    /// Aggregate upload rate across connected peers, bytes/s.
    pub fn upload_rate(&self) -> u64 {
        self.peers.lock().values().map(|c| c.upload_rate()).sum()
    }

    /// Attaches a handshaken connection to the peer set and starts it.
    ///
    /// The peer-set lock is held across insert-and-start so the reaper
    /// cannot observe a not-yet-started connection. A full table
    /// displaces the oldest dead or bored peer for incoming connections,
    /// else the new connection is rejected.
    pub(crate) fn attach_peer(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: PeerId,
        incoming: bool,
    ) -> Result<u64, SwarmError> {
        let mut peers = self.peers.lock();

        if peers.len() >= MAX_PEERS {
            let victim = if incoming {
                Self::displaceable(&peers)
            } else {
                None
            };
            match victim {
                Some(id) => {
                    if let Some(old) = peers.remove(&id) {
                        debug!(peer = %old.addr(), "displacing peer for incoming connection");
                        old.shutdown();
                        self.retire_peer(&old);
                    }
                }
                None => return Err(SwarmError::AtCapacity),
            }
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = PeerConnection::start(
            id,
            stream,
            addr,
            peer_id,
            self.package.clone(),
            self.clone(),
            self.peer_events_tx.clone(),
        );
        peers.insert(id, conn);
        drop(peers);

        let _ = self
            .events_tx
            .send(SwarmEvent::PeerConnected { conn_id: id, addr });
        Ok(id)
    }

    /// Stops the swarm: best-effort `stopped` announce, bounded wait for
    /// the heartbeat, then shutdown of every peer.
    pub async fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let active = {
                let state = self.state.lock();
                match &state.tracker {
                    TrackerSlot::Active(session) => {
                        Some((session.url().to_string(), session.numwant()))
                    }
                    TrackerSlot::Idle { .. } => None,
                }
            };
            if let Some((url, numwant)) = active {
                let request = self.announce_request(numwant, TrackerEvent::Stopped);
                tokio::spawn(async move {
                    if let Ok(client) = TrackerClient::new(&url) {
                        let _ = client.announce(&request).await;
                    }
                });
            }

            let heartbeat = self.state.lock().heartbeat.take();
            if let Some(handle) = heartbeat {
                let _ = tokio::time::timeout(SHUTDOWN_JOIN_WAIT, handle).await;
            }

            for conn in self.peers.lock().values() {
                conn.shutdown();
            }
            if let Some(pump) = self.state.lock().events_task.take() {
                pump.abort();
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn tick(self: &Arc<Self>) {
        self.reap_peers();
        self.update_modes();
        self.update_snubs();
        self.recalc_order_if_due();
        self.calc_friends_if_due();
        self.calc_optunchokes_if_due();
        self.tracker_work();
        self.acquire_peers();
        self.send_keepalives();
        self.apportion_bandwidth().await;
    }

    /// Shuts down peers we have not sent anything to in a long time.
    fn reap_peers(&self) {
        let silent: Vec<Arc<PeerConnection>> = self
            .peers
            .lock()
            .values()
            .filter(|c| c.is_running() && c.last_send().elapsed() >= SILENT_DEATH_INTERVAL)
            .cloned()
            .collect();
        for conn in silent {
            debug!(peer = %conn.addr(), "reaping silent peer");
            conn.shutdown();
        }
    }

    fn update_modes(&self) {
        let incomplete = !self.package.is_complete();
        let completed = self.package.completed_count();
        let remaining = self.package.piece_count() - completed;
        let rate = self.download_rate();

        let mut state = self.state.lock();
        state.fuseki = incomplete && completed < FUSEKI_PIECE_LIMIT;
        state.antisnub = incomplete && rate < ANTISNUB_RATE_FLOOR;
        state.endgame = incomplete && remaining <= ENDGAME_PIECE_LIMIT;
    }

    /// A peer that has unchoked us while we are interested, yet has not
    /// delivered a block within the anti-snub window, is snubbing.
    fn update_snubs(&self) {
        for conn in self.peers.lock().values() {
            let reference = conn.last_block_in().unwrap_or(conn.started_at());
            let snub = conn.am_interested()
                && !conn.peer_choking()
                && reference.elapsed() >= ANTISNUB_INTERVAL;
            conn.set_snubbed(snub);
        }
    }

    fn recalc_order_if_due(&self) {
        let num_peers = self.peers.lock().len();
        let mut state = self.state.lock();
        if state.order.recalc_due(state.fuseki) {
            let fuseki = state.fuseki;
            state.order.recalc(&self.package, num_peers, fuseki);
        }
    }

    /// Ranks running, non-snubbing, interested peers by transfer rate
    /// and unchokes the best `NUM_FRIENDS`, plus current optimistic
    /// unchokes; everyone else is choked.
    fn calc_friends_if_due(&self) {
        let due = {
            let mut state = self.state.lock();
            if state.last_friends.elapsed() >= CALC_FRIENDS_INTERVAL {
                state.last_friends = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let seeding = self.package.is_complete();
        let peers: Vec<Arc<PeerConnection>> = self.peers.lock().values().cloned().collect();

        let mut candidates: Vec<&Arc<PeerConnection>> = peers
            .iter()
            .filter(|c| c.is_running() && !c.is_snubbed() && c.peer_interested())
            .collect();
        candidates.sort_by_key(|c| {
            std::cmp::Reverse(if seeding {
                c.upload_rate()
            } else {
                c.download_rate()
            })
        });
        let friends: HashSet<u64> = candidates
            .iter()
            .take(NUM_FRIENDS)
            .map(|c| c.conn_id())
            .collect();

        let optimistic = self.state.lock().optimistic.clone();
        for conn in &peers {
            let unchoke =
                friends.contains(&conn.conn_id()) || optimistic.contains(&conn.conn_id());
            conn.set_choking(!unchoke);
        }
    }

    /// Awards optimistic unchokes, youngest peers first, each with
    /// probability [`NEW_OPTUNCHOKE_PROB`]. Anti-snub mode charges one
    /// slot per unchoked-and-interested peer that has gone quiet.
    fn calc_optunchokes_if_due(&self) {
        let due = {
            let mut state = self.state.lock();
            if state.last_optunchokes.elapsed() >= CALC_OPTUNCHOKES_INTERVAL {
                state.last_optunchokes = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let antisnub = self.state.lock().antisnub;
        let peers: Vec<Arc<PeerConnection>> = self.peers.lock().values().cloned().collect();

        let mut slots: isize = NUM_OPTUNCHOKES;
        if antisnub {
            let quiet = peers
                .iter()
                .filter(|c| {
                    let reference = c.last_block_in().unwrap_or(c.started_at());
                    c.is_running()
                        && !c.am_choking()
                        && c.peer_interested()
                        && reference.elapsed() >= ANTISNUB_INTERVAL
                })
                .count() as isize;
            slots = (slots - quiet).max(-(NUM_FRIENDS as isize));
        }

        let mut youngest: Vec<&Arc<PeerConnection>> =
            peers.iter().filter(|c| c.is_running()).collect();
        youngest.sort_by_key(|c| std::cmp::Reverse(c.started_at()));

        let mut rng = rand::rng();
        let mut awarded = HashSet::new();
        for conn in youngest {
            if slots <= 0 {
                break;
            }
            if conn.peer_interested()
                && !conn.is_snubbed()
                && rng.random_bool(NEW_OPTUNCHOKE_PROB)
            {
                awarded.insert(conn.conn_id());
                conn.set_choking(false);
                slots -= 1;
            }
        }
        self.state.lock().optimistic = awarded;
    }

    /// Drives the tracker state machine: initial contact, interval
    /// refreshes, the one-shot `completed`, and `numwant` widening when
    /// the peer list is exhausted.
    fn tracker_work(self: &Arc<Self>) {
        struct Announce {
            url: String,
            numwant: usize,
            event: TrackerEvent,
        }

        let action = {
            let mut state = self.state.lock();
            if state.announce_in_flight || state.urls.is_empty() {
                None
            } else {
                let complete = self.package.is_complete();
                let completed_sent = state.completed_sent;
                let idle_ready = matches!(
                    &state.tracker,
                    TrackerSlot::Idle { next_attempt, .. } if Instant::now() >= *next_attempt
                );

                if idle_ready {
                    let url = state.urls[state.cursor % state.urls.len()].clone();
                    state.announce_in_flight = true;
                    Some(Announce {
                        url,
                        numwant: TRACKER_NUMWANT,
                        event: TrackerEvent::Started,
                    })
                } else if let TrackerSlot::Active(session) = &mut state.tracker {
                    if session.exhausted() {
                        session.widen();
                    }
                    let event = if complete && !completed_sent {
                        Some(TrackerEvent::Completed)
                    } else if session.refresh_due() {
                        Some(TrackerEvent::None)
                    } else {
                        None
                    };
                    event.map(|event| Announce {
                        url: session.url().to_string(),
                        numwant: session.numwant(),
                        event,
                    })
                } else {
                    None
                }
            }
        };

        let Some(Announce {
            url,
            numwant,
            event,
        }) = action
        else {
            return;
        };
        {
            self.state.lock().announce_in_flight = true;
        }
        let swarm = self.clone();
        tokio::spawn(async move {
            let request = swarm.announce_request(numwant, event);
            let result = match TrackerClient::new(&url) {
                Ok(client) => client.announce(&request).await,
                Err(e) => Err(e),
            };
            swarm.on_announce_result(url, event, result);
        });
    }

    fn announce_request(&self, numwant: usize, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: *self.peer_id.as_bytes(),
            port: self.config.listen_port,
            uploaded: self.uploaded_total(),
            downloaded: self.downloaded_total(),
            left: self.package.bytes_left(),
            numwant,
            ip: self.config.public_ip,
            event,
        }
    }

    fn on_announce_result(
        &self,
        url: String,
        event: TrackerEvent,
        result: Result<AnnounceResponse, TrackerError>,
    ) {
        let mut state = self.state.lock();
        state.announce_in_flight = false;

        match result {
            Ok(response) => {
                let was_active = matches!(state.tracker, TrackerSlot::Active(_));
                match &mut state.tracker {
                    TrackerSlot::Active(session) if session.url() == url => {
                        session.record_response(response);
                    }
                    _ => {
                        let mut session = TrackerSession::new(url.clone());
                        session.record_response(response);
                        state.tracker = TrackerSlot::Active(session);
                    }
                }
                if event == TrackerEvent::Completed {
                    state.completed_sent = true;
                }
                drop(state);
                if !was_active {
                    info!(url = %url, "tracker connected");
                    let _ = self.events_tx.send(SwarmEvent::TrackerConnected { url });
                }
            }
            Err(e) => {
                warn!(url = %url, "announce failed: {e}");
                let was_active = matches!(state.tracker, TrackerSlot::Active(_));
                let delay = match &state.tracker {
                    TrackerSlot::Idle { delay, .. } => *delay,
                    TrackerSlot::Active(_) => TRACKER_RETRY_INITIAL,
                };
                state.tracker = TrackerSlot::Idle {
                    next_attempt: Instant::now() + delay,
                    delay: next_retry_delay(delay),
                };
                state.cursor += 1;
                drop(state);
                if was_active {
                    let _ = self.events_tx.send(SwarmEvent::TrackerLost { url });
                }
            }
        }
    }

    fn acquire_peers(self: &Arc<Self>) {
        for _ in 0..PEER_ADDS_PER_HEARTBEAT {
            if !self.add_a_peer() {
                break;
            }
        }
    }

    /// Dials one untried tracker peer, if every gate passes.
    fn add_a_peer(self: &Arc<Self>) -> bool {
        if self.package.is_complete() {
            return false;
        }
        let (num_peers, friends) = {
            let peers = self.peers.lock();
            let friends = peers
                .values()
                .filter(|c| c.is_running() && !c.am_choking() && c.peer_interested())
                .count();
            (peers.len(), friends)
        };
        if num_peers >= MAX_PEERS || friends >= NUM_FRIENDS {
            return false;
        }
        if let Some(limit) = self.config.download_limit {
            if self.download_rate() as f64 >= limit as f64 * PEER_ADD_RATE_HEADROOM {
                return false;
            }
        }

        let candidate = {
            let mut state = self.state.lock();
            let TrackerSlot::Active(session) = &mut state.tracker else {
                return false;
            };
            let mut untried = session.untried();
            untried.shuffle(&mut rand::rng());
            let mut pick = None;
            for peer in untried {
                session.mark_tried(peer.addr);
                if self.is_self(&peer) {
                    continue;
                }
                pick = Some(peer);
                break;
            }
            pick
        };
        let Some(peer) = candidate else {
            return false;
        };

        let swarm = self.clone();
        tokio::spawn(async move {
            let jitter = rand::rng().random_range(0..DIAL_JITTER_MAX.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            match crate::server::connect_peer(peer.addr, swarm.info_hash, swarm.peer_id).await {
                Ok((stream, their_id)) => {
                    if let Err(e) = swarm.attach_peer(stream, peer.addr, their_id, false) {
                        debug!(peer = %peer.addr, "could not attach dialed peer: {e}");
                    }
                }
                Err(e) => debug!(peer = %peer.addr, "dial failed: {e}"),
            }
        });
        true
    }

    fn is_self(&self, peer: &TrackerPeer) -> bool {
        if peer.peer_id.as_ref() == Some(self.peer_id.as_bytes()) {
            return true;
        }
        match self.config.public_ip {
            Some(ip) => peer.addr.ip() == ip && peer.addr.port() == self.config.listen_port,
            None => false,
        }
    }

    fn send_keepalives(&self) {
        for conn in self.peers.lock().values() {
            if conn.is_running() && conn.last_send().elapsed() >= KEEPALIVE_INTERVAL {
                conn.queue_keepalive();
            }
        }
    }

    /// Splits the window's byte budget across peers in random order.
    ///
    /// Budget formula: `limit * (WINDOW + HEARTBEAT) - current * WINDOW`,
    /// clamped at zero. Without any limit, connections pace themselves
    /// from their input loops and the heartbeat stays out of dispatch.
    async fn apportion_bandwidth(&self) {
        if self.config.download_limit.is_none() && self.config.upload_limit.is_none() {
            return;
        }

        let budget = |limit: Option<u64>, current: u64| -> u64 {
            match limit {
                Some(limit) => {
                    let window = RATE_WINDOW.as_secs() as i128;
                    let heartbeat = HEARTBEAT.as_secs() as i128;
                    let value = limit as i128 * (window + heartbeat) - current as i128 * window;
                    value.max(0) as u64
                }
                None => u64::MAX,
            }
        };
        let mut dl_budget = budget(self.config.download_limit, self.download_rate());
        let mut ul_budget = budget(self.config.upload_limit, self.upload_rate());

        let mut peers: Vec<Arc<PeerConnection>> = self.peers.lock().values().cloned().collect();
        peers.shuffle(&mut rand::rng());

        for conn in peers {
            if dl_budget == 0 || ul_budget == 0 {
                break;
            }
            let (requested, sent) = conn.pump(dl_budget, ul_budget).await;
            dl_budget = dl_budget.saturating_sub(requested);
            ul_budget = ul_budget.saturating_sub(sent);
        }
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    async fn run_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::BlockReceived {
                    from,
                    block,
                    piece_completed,
                } => self.on_block_received(from, block, piece_completed).await,
                PeerEvent::Disconnected { from } => self.on_peer_disconnected(from),
            }
        }
    }

    async fn on_block_received(&self, from: u64, block: Block, piece_completed: bool) {
        if self.state.lock().endgame {
            // Every other peer racing for this block gets a cancel.
            let others: Vec<Arc<PeerConnection>> = self
                .peers
                .lock()
                .values()
                .filter(|c| c.conn_id() != from && c.is_running())
                .cloned()
                .collect();
            for conn in others {
                conn.cancel_block(&block);
            }
        }

        if !piece_completed {
            return;
        }
        let Some(piece) = self.package.piece(block.piece_index) else {
            return;
        };

        match piece.is_valid().await {
            Ok(true) => {
                for conn in self.peers.lock().values() {
                    if conn.is_running() {
                        conn.queue_have(block.piece_index);
                    }
                }
                let _ = self.events_tx.send(SwarmEvent::HavePiece {
                    piece: block.piece_index,
                });
                if self.package.is_complete() {
                    info!(name = %self.package.name(), "package complete");
                    let _ = self.events_tx.send(SwarmEvent::Completed);
                    match self.package.finish_read_only().await {
                        Ok(_) => {}
                        Err(e) => warn!("could not reopen read-only: {e}"),
                    }
                }
            }
            Ok(false) => {
                warn!(piece = block.piece_index, "hash mismatch, discarding piece");
                piece.discard();
                let _ = self.events_tx.send(SwarmEvent::DiscardedPiece {
                    piece: block.piece_index,
                });
            }
            Err(e) => warn!(piece = block.piece_index, "validation failed: {e}"),
        }
    }

    fn on_peer_disconnected(&self, from: u64) {
        let conn = self.peers.lock().remove(&from);
        if let Some(conn) = conn {
            self.retire_peer(&conn);
            let _ = self.events_tx.send(SwarmEvent::PeerDisconnected {
                conn_id: from,
                addr: conn.addr(),
            });
        }
    }

    /// Folds a departing peer's counters and popularity back out.
    fn retire_peer(&self, conn: &Arc<PeerConnection>) {
        self.retired_downloaded
            .fetch_add(conn.downloaded_total(), Ordering::Relaxed);
        self.retired_uploaded
            .fetch_add(conn.uploaded_total(), Ordering::Relaxed);
        let mut state = self.state.lock();
        if let Some(bits) = conn.peer_bitfield() {
            state.order.forget_peer(&bits);
        }
        state.optimistic.remove(&conn.conn_id());
    }

    /// Picks the peer to displace for an incoming connection: dead
    /// connections first, then bored ones, oldest first within each.
    fn displaceable(peers: &HashMap<u64, Arc<PeerConnection>>) -> Option<u64> {
        let dead = peers
            .values()
            .filter(|c| !c.is_running())
            .min_by_key(|c| c.started_at());
        if let Some(conn) = dead {
            return Some(conn.conn_id());
        }
        peers
            .values()
            .filter(|c| c.last_receive().elapsed() >= BOREDOM_DEATH_INTERVAL)
            .min_by_key(|c| c.started_at())
            .map(|c| c.conn_id())
    }
}

/// Doubles the tracker retry delay, capped.
pub(crate) fn next_retry_delay(delay: Duration) -> Duration {
    (delay * 2).min(TRACKER_RETRY_CAP)
}

impl BlockScheduler for Swarm {
    /// Walks pieces in policy order offering claimable blocks.
    ///
    /// End-game offers every missing block regardless of claims; the
    /// opening returns after the first accepted claim so early requests
    /// round-robin across peers.
    fn claim_blocks(&self, want: &mut dyn FnMut(&Block) -> Claim) {
        let (order, endgame, fuseki) = {
            let state = self.state.lock();
            (state.order.order().to_vec(), state.endgame, state.fuseki)
        };

        for index in order {
            let Some(piece) = self.package.piece(index) else {
                continue;
            };
            if piece.is_complete() {
                continue;
            }

            let mut stop = false;
            let mut accepted = false;
            let walk = |block: Block| -> bool {
                match want(&block) {
                    Claim::Take => {
                        if let Err(e) = piece.claim_block(&block) {
                            debug!(piece = index, "claim failed: {e}");
                        }
                        accepted = true;
                        !fuseki
                    }
                    Claim::Pass => true,
                    Claim::Stop => {
                        stop = true;
                        false
                    }
                }
            };

            let result = if endgame {
                piece.for_each_empty_block(BLOCK_SIZE, walk)
            } else {
                piece.for_each_unclaimed_block(BLOCK_SIZE, walk)
            };
            if let Err(e) = result {
                debug!(piece = index, "block walk failed: {e}");
            }

            if stop || (fuseki && accepted) {
                return;
            }
        }
    }

    fn forget_block(&self, block: &Block) {
        if let Some(piece) = self.package.piece(block.piece_index) {
            if let Err(e) = piece.unclaim_block(block) {
                debug!(piece = block.piece_index, "unclaim failed: {e}");
            }
        }
    }

    fn peer_has_piece(&self, _conn_id: u64, piece: u32) {
        self.state.lock().order.bump(piece);
    }

    fn self_paced(&self) -> bool {
        self.config.download_limit.is_none() && self.config.upload_limit.is_none()
    }
}
