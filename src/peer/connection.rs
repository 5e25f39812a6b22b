use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::Message;
use super::peer_id::PeerId;
use super::rate::RateMeter;
use crate::constants::{
    MAX_FRAME_LEN, MAX_REQUESTS, MIN_REQUESTS, RATE_WINDOW, REQUEST_TIMEOUT, SEND_CHUNK_SIZE,
};
use crate::storage::{Block, Package};

/// Answer to a block offered by [`BlockScheduler::claim_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Accept the block; the scheduler marks it claimed.
    Take,
    /// Skip this block, keep offering.
    Pass,
    /// Stop the iteration.
    Stop,
}

/// The narrow face of the swarm controller a peer connection sees.
///
/// Connections never own the controller; they reach it through this
/// trait for claim bookkeeping, popularity updates, and pacing.
pub trait BlockScheduler: Send + Sync {
    /// Offers claimable blocks in policy order until `want` answers
    /// [`Claim::Stop`] or the offer set is exhausted. Accepted blocks are
    /// marked claimed before the next offer.
    fn claim_blocks(&self, want: &mut dyn FnMut(&Block) -> Claim);

    /// Returns a claimed-but-undelivered block to the pool.
    fn forget_block(&self, block: &Block);

    /// A connected peer declared a piece, via bitfield or have.
    fn peer_has_piece(&self, conn_id: u64, piece: u32);

    /// True when no rate limit is configured, so connections dispatch
    /// themselves straight from the input loop.
    fn self_paced(&self) -> bool;
}

/// Out-of-band notifications from a connection to its controller.
#[derive(Debug)]
pub enum PeerEvent {
    /// A block was received and persisted. `piece_completed` reports
    /// whether the write filled its piece.
    BlockReceived {
        from: u64,
        block: Block,
        piece_completed: bool,
    },
    /// The connection terminated; its claims have been released.
    Disconnected { from: u64 },
}

struct PeerState {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    snubbed: bool,
    peer_bits: Option<Bitfield>,
    /// Blocks we asked (or will ask) this peer for.
    want_blocks: Vec<Block>,
    /// Blocks the peer asked us for, still to send.
    peer_want_blocks: VecDeque<Block>,
    last_send: Instant,
    last_receive: Instant,
    last_block_in: Option<Instant>,
    last_block_out: Option<Instant>,
}

impl PeerState {
    fn new(now: Instant) -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            snubbed: false,
            peer_bits: None,
            want_blocks: Vec::new(),
            peer_want_blocks: VecDeque::new(),
            last_send: now,
            last_receive: now,
            last_block_in: None,
            last_block_out: None,
        }
    }
}

/// A duplex connection to one peer.
///
/// An input task parses frames and applies them; an output task drains a
/// message queue onto the socket in chunks. The controller drives
/// time-based dispatch through [`PeerConnection::pump`]; with no rate
/// limits configured the input task pumps after every message instead.
///
/// Either task's failure terminates the connection and releases its
/// claims exactly once.
pub struct PeerConnection {
    conn_id: u64,
    addr: SocketAddr,
    peer_id: PeerId,
    package: Arc<Package>,
    scheduler: Arc<dyn BlockScheduler>,
    events: mpsc::UnboundedSender<PeerEvent>,
    out_tx: mpsc::UnboundedSender<Message>,
    state: Mutex<PeerState>,
    download: RateMeter,
    upload: RateMeter,
    running: AtomicBool,
    claims_released: AtomicBool,
    started_at: Instant,
    shutdown: Notify,
}

impl PeerConnection {
    /// Takes over a freshly handshaken stream and spawns both tasks.
    ///
    /// The first queued message is our bitfield, computed from the
    /// package's per-piece completeness.
    pub fn start(
        conn_id: u64,
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: PeerId,
        package: Arc<Package>,
        scheduler: Arc<dyn BlockScheduler>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let conn = Arc::new(Self {
            conn_id,
            addr,
            peer_id,
            package,
            scheduler,
            events,
            out_tx,
            state: Mutex::new(PeerState::new(now)),
            download: RateMeter::new(RATE_WINDOW),
            upload: RateMeter::new(RATE_WINDOW),
            running: AtomicBool::new(true),
            claims_released: AtomicBool::new(false),
            started_at: now,
            shutdown: Notify::new(),
        });

        let bits = Bitfield::from_fn(conn.package.piece_count(), |i| {
            conn.package
                .piece(i as u32)
                .map(|p| p.is_complete())
                .unwrap_or(false)
        });
        let _ = conn.out_tx.send(Message::Bitfield(bits.to_bytes()));

        let (rd, wr) = stream.into_split();
        let reader = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = reader.clone().run_reader(rd).await {
                debug!(peer = %reader.addr, "input loop ended: {e}");
            }
            reader.finish();
        });
        let writer = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.clone().run_writer(wr, out_rx).await {
                debug!(peer = %writer.addr, "output loop ended: {e}");
            }
            writer.finish();
        });

        conn
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn download_rate(&self) -> u64 {
        self.download.rate()
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload.rate()
    }

    pub fn downloaded_total(&self) -> u64 {
        self.download.lifetime_total()
    }

    pub fn uploaded_total(&self) -> u64 {
        self.upload.lifetime_total()
    }

    pub fn last_send(&self) -> Instant {
        self.state.lock().last_send
    }

    pub fn last_receive(&self) -> Instant {
        self.state.lock().last_receive
    }

    pub fn last_block_in(&self) -> Option<Instant> {
        self.state.lock().last_block_in
    }

    pub fn am_interested(&self) -> bool {
        self.state.lock().am_interested
    }

    pub fn am_choking(&self) -> bool {
        self.state.lock().am_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.state.lock().peer_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.state.lock().peer_choking
    }

    pub fn is_snubbed(&self) -> bool {
        self.state.lock().snubbed
    }

    pub fn set_snubbed(&self, snubbed: bool) {
        self.state.lock().snubbed = snubbed;
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.state
            .lock()
            .peer_bits
            .as_ref()
            .map(|b| b.has(piece as usize))
            .unwrap_or(false)
    }

    /// Snapshot of the peer's declared pieces, if it declared any.
    pub fn peer_bitfield(&self) -> Option<Bitfield> {
        self.state.lock().peer_bits.clone()
    }

    /// Chokes or unchokes the peer, emitting a message only on change.
    pub fn set_choking(&self, choke: bool) {
        let changed = {
            let mut state = self.state.lock();
            if state.am_choking == choke {
                false
            } else {
                state.am_choking = choke;
                true
            }
        };
        if changed {
            let msg = if choke {
                Message::Choke
            } else {
                Message::Unchoke
            };
            let _ = self.out_tx.send(msg);
        }
    }

    pub fn queue_have(&self, piece: u32) {
        let _ = self.out_tx.send(Message::Have { piece });
    }

    pub fn queue_keepalive(&self) {
        let _ = self.out_tx.send(Message::KeepAlive);
    }

    /// Drops a block from the want queue; emits a wire `cancel` if the
    /// request had already gone out.
    pub fn cancel_block(&self, block: &Block) {
        let was_requested = {
            let mut state = self.state.lock();
            match state.want_blocks.iter().position(|b| b == block) {
                Some(pos) => state.want_blocks.remove(pos).is_requested(),
                None => return,
            }
        };
        if was_requested {
            let _ = self.out_tx.send(Message::Cancel {
                index: block.piece_index,
                begin: block.begin,
                length: block.length,
            });
        }
    }

    /// Closes the connection. Both tasks observe the signal and exit;
    /// claims are released exactly once.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// One dispatch round: expire stale requests, emit requests up to
    /// `dl_budget`, drain the peer's pending blocks up to `ul_budget`,
    /// then refill claims. Returns `(bytes_requested, bytes_sent)`.
    pub async fn pump(&self, dl_budget: u64, ul_budget: u64) -> (u64, u64) {
        if !self.is_running() {
            return (0, 0);
        }

        let expired = {
            let mut state = self.state.lock();
            let mut out = Vec::new();
            state.want_blocks.retain(|b| {
                let stale = b
                    .requested_at()
                    .map(|t| t.elapsed() >= REQUEST_TIMEOUT)
                    .unwrap_or(false);
                if stale {
                    out.push(b.clone());
                }
                !stale
            });
            out
        };
        for block in &expired {
            trace!(peer = %self.addr, piece = block.piece_index, "request timed out");
            self.scheduler.forget_block(block);
        }

        let mut requested = 0u64;
        {
            let mut state = self.state.lock();
            if state.am_interested && !state.peer_choking {
                for block in state.want_blocks.iter_mut() {
                    if block.is_requested() {
                        continue;
                    }
                    if requested + block.length as u64 > dl_budget {
                        break;
                    }
                    block.mark_requested();
                    requested += block.length as u64;
                    let _ = self.out_tx.send(Message::Request {
                        index: block.piece_index,
                        begin: block.begin,
                        length: block.length,
                    });
                }
            }
        }

        let mut sent = 0u64;
        loop {
            let block = {
                let mut state = self.state.lock();
                if state.am_choking || !state.peer_interested {
                    break;
                }
                let fits = state
                    .peer_want_blocks
                    .front()
                    .map(|b| sent + b.length as u64 <= ul_budget)
                    .unwrap_or(false);
                if fits {
                    state.peer_want_blocks.pop_front()
                } else {
                    None
                }
            };
            let Some(block) = block else { break };

            let piece = match self.package.piece(block.piece_index) {
                Some(p) => p,
                None => continue,
            };
            match piece.read_block(block.begin, block.length).await {
                Ok(full) => {
                    sent += block.length as u64;
                    let _ = self.out_tx.send(Message::Piece {
                        index: full.piece_index,
                        begin: full.begin,
                        data: full.take_data(),
                    });
                }
                Err(e) => {
                    warn!(peer = %self.addr, piece = block.piece_index, "upload read failed: {e}");
                }
            }
        }

        self.refill_claims();
        (requested, sent)
    }

    async fn run_reader(self: Arc<Self>, mut rd: OwnedReadHalf) -> Result<(), PeerError> {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                frame = read_frame(&mut rd, &mut buf) => frame?,
            };
            if !self.is_running() {
                return Ok(());
            }
            self.state.lock().last_receive = Instant::now();
            let message = Message::decode(frame)?;
            self.handle_message(message).await?;
            if self.scheduler.self_paced() {
                self.pump(u64::MAX, u64::MAX).await;
            }
        }
    }

    async fn run_writer(
        self: Arc<Self>,
        mut wr: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Result<(), PeerError> {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                msg = out_rx.recv() => match msg {
                    Some(m) => m,
                    None => return Ok(()),
                },
            };
            if let Message::Piece { data, .. } = &message {
                self.upload.add(data.len() as u64);
                self.state.lock().last_block_out = Some(Instant::now());
            }
            let bytes = message.encode();
            for chunk in bytes.chunks(SEND_CHUNK_SIZE) {
                wr.write_all(chunk).await?;
            }
            self.state.lock().last_send = Instant::now();
        }
    }

    async fn handle_message(&self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.state.lock().peer_choking = true;
            }
            Message::Unchoke => {
                self.state.lock().peer_choking = false;
                self.refill_claims();
            }
            Message::Interested => {
                self.state.lock().peer_interested = true;
            }
            Message::NotInterested => {
                self.state.lock().peer_interested = false;
            }
            Message::Have { piece } => self.handle_have(piece)?,
            Message::Bitfield(bytes) => self.handle_bitfield(bytes)?,
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(index, begin, length),
            Message::Piece { index, begin, data } => {
                self.handle_piece(index, begin, data).await?
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let probe = Block::new(index, begin, length);
                let mut state = self.state.lock();
                state.peer_want_blocks.retain(|b| *b != probe);
            }
        }
        Ok(())
    }

    fn handle_have(&self, piece: u32) -> Result<(), PeerError> {
        if piece as usize >= self.package.piece_count() {
            return Err(PeerError::InvalidMessage(format!(
                "have for piece {piece} of {}",
                self.package.piece_count()
            )));
        }
        let fresh = {
            let mut state = self.state.lock();
            let count = self.package.piece_count();
            let bits = state.peer_bits.get_or_insert_with(|| Bitfield::new(count));
            if bits.has(piece as usize) {
                false
            } else {
                bits.set(piece as usize);
                true
            }
        };
        if fresh {
            self.scheduler.peer_has_piece(self.conn_id, piece);
            self.update_interest();
            self.refill_claims();
        }
        Ok(())
    }

    fn handle_bitfield(&self, bytes: Bytes) -> Result<(), PeerError> {
        let bits = Bitfield::from_wire(bytes, self.package.piece_count())?;
        {
            let mut state = self.state.lock();
            if state.peer_bits.is_some() {
                return Err(PeerError::InvalidMessage("duplicate bitfield".into()));
            }
            state.peer_bits = Some(bits.clone());
        }
        for piece in bits.present() {
            self.scheduler.peer_has_piece(self.conn_id, piece as u32);
        }
        self.update_interest();
        self.refill_claims();
        Ok(())
    }

    // Bad requests are dropped, not fatal: the peer may be acting on
    // state it has not seen updated yet.
    fn handle_request(&self, index: u32, begin: u32, length: u32) {
        let holds = self
            .package
            .piece(index)
            .map(|p| {
                p.is_complete() && length > 0 && begin as u64 + length as u64 <= p.length()
            })
            .unwrap_or(false);
        if !holds {
            debug!(peer = %self.addr, piece = index, "ignoring request for piece we lack");
            return;
        }

        let mut state = self.state.lock();
        if state.am_choking {
            debug!(peer = %self.addr, piece = index, "ignoring request while choking");
            return;
        }
        if !state.peer_interested {
            debug!(peer = %self.addr, piece = index, "ignoring request from uninterested peer");
            return;
        }
        let block = Block::new(index, begin, length);
        if !state.peer_want_blocks.contains(&block) {
            state.peer_want_blocks.push_back(block);
        }
    }

    async fn handle_piece(&self, index: u32, begin: u32, data: Bytes) -> Result<(), PeerError> {
        let block = {
            let mut state = self.state.lock();
            let pos = state.want_blocks.iter().position(|b| {
                b.piece_index == index && b.begin == begin && b.length as usize == data.len()
            });
            pos.map(|p| state.want_blocks.remove(p))
        };
        let Some(mut block) = block else {
            // Late arrival of a cancelled or timed-out request.
            trace!(peer = %self.addr, piece = index, "unsolicited block");
            return Ok(());
        };

        self.download.add(data.len() as u64);
        self.state.lock().last_block_in = Some(Instant::now());
        block.add_chunk(&data);

        let piece = self
            .package
            .piece(index)
            .ok_or_else(|| PeerError::InvalidMessage(format!("block for piece {index}")))?;
        let piece_completed = piece.add_block(&block).await?;

        let _ = self.events.send(PeerEvent::BlockReceived {
            from: self.conn_id,
            block,
            piece_completed,
        });
        self.refill_claims();
        Ok(())
    }

    /// Re-evaluates interest from the peer's piece set; on transition,
    /// emits the message and (when dropping interest) releases every
    /// claimed block back to the pool.
    fn update_interest(&self) {
        let mut released = Vec::new();
        let transition = {
            let mut state = self.state.lock();
            let wants = match &state.peer_bits {
                Some(bits) => bits.present().any(|i| {
                    self.package
                        .piece(i as u32)
                        .map(|p| !p.is_complete())
                        .unwrap_or(false)
                }),
                None => false,
            };
            if wants == state.am_interested {
                None
            } else {
                state.am_interested = wants;
                if !wants {
                    released = std::mem::take(&mut state.want_blocks);
                }
                Some(wants)
            }
        };
        if let Some(interested) = transition {
            let msg = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            let _ = self.out_tx.send(msg);
        }
        for block in &released {
            self.scheduler.forget_block(block);
        }
    }

    /// Tops the want queue back up from the scheduler.
    ///
    /// The acceptance closure works on a snapshot of our state so no
    /// peer lock is held while the scheduler walks its piece order;
    /// blocks that raced in twice are returned to the pool.
    fn refill_claims(&self) {
        let (bits, existing) = {
            let state = self.state.lock();
            if !state.am_interested
                || state.peer_choking
                || state.want_blocks.len() >= MIN_REQUESTS
            {
                return;
            }
            let bits = match &state.peer_bits {
                Some(b) => b.clone(),
                None => return,
            };
            let existing: HashSet<(u32, u32, u32)> = state
                .want_blocks
                .iter()
                .map(|b| (b.piece_index, b.begin, b.length))
                .collect();
            (bits, existing)
        };

        let base = existing.len();
        let mut accepted: Vec<Block> = Vec::new();
        self.scheduler.claim_blocks(&mut |block| {
            if base + accepted.len() >= MAX_REQUESTS {
                return Claim::Stop;
            }
            let key = (block.piece_index, block.begin, block.length);
            if !bits.has(block.piece_index as usize)
                || existing.contains(&key)
                || accepted.iter().any(|b| b == block)
            {
                return Claim::Pass;
            }
            accepted.push(block.clone());
            Claim::Take
        });

        if accepted.is_empty() {
            return;
        }
        let mut spill = Vec::new();
        {
            let mut state = self.state.lock();
            for block in accepted {
                if state.want_blocks.len() >= MAX_REQUESTS || state.want_blocks.contains(&block) {
                    spill.push(block);
                } else {
                    state.want_blocks.push(block);
                }
            }
        }
        for block in &spill {
            self.scheduler.forget_block(block);
        }
    }

    fn finish(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
        self.release_claims();
    }

    fn release_claims(&self) {
        if self.claims_released.swap(true, Ordering::AcqRel) {
            return;
        }
        let blocks = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.want_blocks)
        };
        for block in &blocks {
            self.scheduler.forget_block(block);
        }
        let _ = self.events.send(PeerEvent::Disconnected { from: self.conn_id });
    }
}

async fn read_frame(rd: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<Bytes, PeerError> {
    loop {
        if buf.len() >= 4 {
            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length > MAX_FRAME_LEN {
                return Err(PeerError::FrameTooLarge(length));
            }
            if buf.len() >= 4 + length {
                return Ok(buf.split_to(4 + length).freeze());
            }
        }
        let n = rd.read_buf(buf).await?;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
}
