//! Torrent session
//!
//! A session owns every piece and every peer connection for one info-hash.
//! All protocol state lives in [`SessionCore`] and is mutated from exactly
//! one task, the session driver, which multiplexes caller commands, socket
//! I/O events, and the pacing tick over a `select` loop. Peer connections
//! are pure state machines; the driver executes the actions they emit,
//! owns the timers, and routes bytes through sockets paced by the shared
//! [`RateController`].
//!
//! Callers interact through a cloneable [`SessionHandle`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitvec::prelude::*;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::check::{self, CheckResult};
use crate::config::{generate_peer_id, SessionConfig};
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::{Metainfo, Sha1Hash};
use crate::peer::{Action, CloseReason, PeerConnection, PeerEvent, PeerRole, PeerState};
use crate::piece::{BlockDelivery, BlockRequest, Piece};
use crate::rate::{RateController, ThrottledIo};
use crate::storage::Storage;

/// Aggregate transfer counters, shared between the driver and handles
#[derive(Debug, Default)]
pub struct SessionStats {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    session_downloaded: AtomicU64,
    session_uploaded: AtomicU64,
}

impl SessionStats {
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.session_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.session_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Lifetime bytes downloaded
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Lifetime bytes uploaded
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Bytes downloaded since the last start
    pub fn session_downloaded(&self) -> u64 {
        self.session_downloaded.load(Ordering::Relaxed)
    }

    /// Bytes uploaded since the last start
    pub fn session_uploaded(&self) -> u64 {
        self.session_uploaded.load(Ordering::Relaxed)
    }

    pub fn reset_session(&self) {
        self.session_downloaded.store(0, Ordering::Relaxed);
        self.session_uploaded.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of one peer connection's state and transfer tallies
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// Block payload bytes received from this peer
    pub downloaded: u64,
    /// Block payload bytes served to this peer
    pub uploaded: u64,
}

/// Notifications emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnected { addr: SocketAddr },
    PeerDisconnected { addr: SocketAddr },
    PieceVerified { index: u32 },
    /// A completed piece failed hash verification and was discarded
    PieceFailed { index: u32 },
    /// Startup integrity check finished
    CheckFinished { valid: usize },
    /// Every piece is verified
    Completed,
}

/// Protocol state for one torrent: pieces, assignment policy, counters.
///
/// Mutated only from the session driver task, so none of it is locked.
pub struct SessionCore {
    pub config: SessionConfig,
    metainfo: Metainfo,
    storage: Arc<dyn Storage>,
    local_peer_id: [u8; 20],
    pieces: Vec<Piece>,
    /// Peers whose reply timer expired with requests pending; their
    /// outstanding blocks are fair game for endgame duplication
    stalled: HashSet<SocketAddr>,
    /// Cancel notifications owed to other assignees after a delivery race,
    /// drained by the driver after every dispatch
    cancels: Vec<(SocketAddr, BlockRequest)>,
    /// Freshly verified pieces awaiting "have" broadcast
    completed: Vec<u32>,
    /// Pieces discarded after a hash mismatch, awaiting event emission
    failed: Vec<u32>,
    stats: Arc<SessionStats>,
}

impl SessionCore {
    pub fn new(
        metainfo: Metainfo,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
        local_peer_id: [u8; 20],
    ) -> Self {
        let mut pieces = Vec::with_capacity(metainfo.num_pieces());
        for i in 0..metainfo.num_pieces() {
            if let (Some(len), Some(hash)) = (metainfo.piece_len(i), metainfo.piece_hash(i)) {
                pieces.push(Piece::new(i as u32, len as u32, *hash));
            }
        }
        Self {
            config,
            metainfo,
            storage,
            local_peer_id,
            pieces,
            stalled: HashSet::new(),
            cancels: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.metainfo.info_hash
    }

    pub fn local_peer_id(&self) -> [u8; 20] {
        self.local_peer_id
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn bitfield_len(&self) -> usize {
        self.metainfo.bitfield_len()
    }

    pub fn piece_len(&self, index: u32) -> Option<u32> {
        self.metainfo.piece_len(index as usize).map(|l| l as u32)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.is_verified())
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_verified())
    }

    pub fn bitfield(&self) -> BitVec<u8, Msb0> {
        let mut bits = bitvec![u8, Msb0; 0; self.num_pieces()];
        for piece in &self.pieces {
            if piece.is_verified() {
                bits.set(piece.index as usize, true);
            }
        }
        bits
    }

    /// Our bitfield in wire form, MSB-first with zero pad bits
    pub fn bitfield_bytes(&self) -> Vec<u8> {
        let mut bits = self.bitfield();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    /// Assignment policy. Fresh blocks first, in piece-index order; when no
    /// fresh block exists, duplicate a stalled peer's outstanding block
    /// (endgame). Returns `None` when the peer has nothing useful to
    /// request.
    pub fn assign_block(
        &mut self,
        peer: SocketAddr,
        peer_pieces: &BitSlice<u8, Msb0>,
        outstanding: &[BlockRequest],
    ) -> Option<BlockRequest> {
        let peer_has =
            |idx: usize| peer_pieces.get(idx).map(|b| *b).unwrap_or(false);

        for piece in &mut self.pieces {
            if piece.is_verified() || !peer_has(piece.index as usize) {
                continue;
            }
            if let Some(req) = piece.request_block(peer, self.config.block_size) {
                return Some(req);
            }
        }

        if self.stalled.is_empty() {
            return None;
        }
        for i in 0..self.pieces.len() {
            if self.pieces[i].is_verified() || !peer_has(i) {
                continue;
            }
            if let Some(req) = self.pieces[i].duplicate_candidate(peer, &self.stalled) {
                if outstanding.contains(&req) {
                    continue;
                }
                if self.pieces[i].add_assignee(req.offset, req.length, peer) {
                    tracing::debug!(peer = %peer, piece = req.piece, offset = req.offset, "endgame duplicate");
                    return Some(req);
                }
            }
        }
        None
    }

    /// Deliver block payload from a peer.
    ///
    /// First delivery wins: the losers' in-flight requests are queued as
    /// cancels for the driver to route. Completing a piece triggers hash
    /// verification; a match persists the piece and queues the "have"
    /// broadcast, a mismatch discards the piece's data. Only a storage
    /// failure is an error, fatal to the delivering connection.
    pub fn deliver_block(
        &mut self,
        from: SocketAddr,
        index: u32,
        begin: u32,
        data: &[u8],
    ) -> Result<()> {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            tracing::warn!(peer = %from, index, "block for unknown piece, discarded");
            return Ok(());
        };

        match piece.set_block_data(begin, data) {
            BlockDelivery::Stored { cancel } => {
                self.stats.add_downloaded(data.len() as u64);
                let req = BlockRequest {
                    piece: index,
                    offset: begin,
                    length: data.len() as u32,
                };
                for peer in cancel {
                    if peer != from {
                        self.cancels.push((peer, req));
                    }
                }
                self.verify_piece(index)?;
            }
            BlockDelivery::Duplicate => {
                tracing::debug!(peer = %from, index, begin, "duplicate block delivery, ignored");
            }
            BlockDelivery::Unknown => {
                tracing::warn!(peer = %from, index, begin, "unexpected block, discarded");
            }
        }
        Ok(())
    }

    fn verify_piece(&mut self, index: u32) -> Result<()> {
        let idx = index as usize;
        if !self.pieces[idx].is_complete() {
            return Ok(());
        }

        if self.pieces[idx].check_hash() {
            let Some(offset) = self.metainfo.piece_offset(idx) else {
                return Ok(());
            };
            if let Some(data) = self.pieces[idx].data() {
                self.storage.write_range(offset, data)?;
            }
            self.pieces[idx].mark_verified();
            self.completed.push(index);
            tracing::info!(index, "piece verified");
        } else {
            tracing::warn!(index, "piece hash mismatch, discarding");
            self.pieces[idx].reset();
            self.failed.push(index);
        }
        Ok(())
    }

    /// Serve a validated request from persistent storage
    pub fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        if !self.has_piece(index) {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("request for piece {} we do not have", index),
            ));
        }
        let offset = self
            .metainfo
            .piece_offset(index as usize)
            .ok_or_else(|| EngineError::Internal(format!("no offset for piece {}", index)))?;
        self.storage.read_range(offset + begin as u64, length as usize)
    }

    /// Return a peer's in-flight requests to the assignment pool
    pub fn release_outstanding(&mut self, peer: SocketAddr, outstanding: &[BlockRequest]) {
        for req in outstanding {
            if let Some(piece) = self.pieces.get_mut(req.piece as usize) {
                piece.release_assignee(peer);
            }
        }
    }

    /// Drop every trace of a peer: stall flag and any assignments
    pub fn forget_peer(&mut self, peer: SocketAddr) {
        self.stalled.remove(&peer);
        for piece in &mut self.pieces {
            piece.release_assignee(peer);
        }
        self.cancels.retain(|(p, _)| *p != peer);
    }

    pub fn set_stalled(&mut self, peer: SocketAddr, stalled: bool) {
        if stalled {
            self.stalled.insert(peer);
        } else {
            self.stalled.remove(&peer);
        }
    }

    /// Mark a piece verified without data flow (startup check found it on
    /// disk already)
    pub fn adopt_verified(&mut self, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if !piece.is_verified() {
                piece.mark_verified();
                self.completed.push(index);
            }
        }
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.stats.add_uploaded(bytes);
    }

    /// Drain the queued cancel notifications
    pub fn take_cancels(&mut self) -> Vec<(SocketAddr, BlockRequest)> {
        std::mem::take(&mut self.cancels)
    }

    /// Drain the pieces verified since the last drain
    pub fn take_completed_pieces(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.completed)
    }

    /// Drain the pieces that failed verification since the last drain
    pub fn take_failed_pieces(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.failed)
    }

    #[cfg(test)]
    pub fn mark_piece_verified_for_tests(&mut self, index: u32) {
        self.adopt_verified(index);
    }
}

/// Commands from handles to the driver
enum Command {
    Start,
    Pause,
    Resume,
    AddPeer(SocketAddr),
    AcceptPeer(TcpStream, SocketAddr),
    Bitfield(oneshot::Sender<BitVec<u8, Msb0>>),
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Shutdown,
}

/// Events from I/O tasks and the checker into the driver
enum IoEvent {
    Connected(SocketAddr, TcpStream),
    ConnectFailed(SocketAddr, EngineError),
    Data(SocketAddr, Vec<u8>),
    SocketClosed(SocketAddr),
    PieceChecked(CheckResult),
    CheckFinished,
}

/// Rate-controlled socket for one peer.
///
/// Writes are queued here and drained by the controller's ticks via
/// `try_write`; reads happen in the tick too, with the bytes forwarded to
/// the driver as events. `try_read`/`try_write` take `&self`, so a tick
/// never blocks the driver.
struct ThrottledPeerSocket {
    addr: SocketAddr,
    stream: TcpStream,
    out: Mutex<BytesMut>,
    read_ahead: AtomicUsize,
    upload_cap: AtomicUsize,
    closed: AtomicBool,
    io_tx: mpsc::UnboundedSender<IoEvent>,
}

impl ThrottledPeerSocket {
    fn new(addr: SocketAddr, stream: TcpStream, io_tx: mpsc::UnboundedSender<IoEvent>) -> Self {
        Self {
            addr,
            stream,
            out: Mutex::new(BytesMut::new()),
            read_ahead: AtomicUsize::new(64 * 1024),
            upload_cap: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            io_tx,
        }
    }

    fn queue_upload(&self, bytes: &[u8]) {
        self.out.lock().extend_from_slice(bytes);
    }

    /// Room left under the outstanding-write cap
    fn upload_room(&self) -> usize {
        let cap = self.upload_cap.load(Ordering::Relaxed);
        if cap == 0 {
            usize::MAX
        } else {
            cap.saturating_sub(self.out.lock().len())
        }
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.io_tx.send(IoEvent::SocketClosed(self.addr));
        }
    }
}

impl ThrottledIo for ThrottledPeerSocket {
    fn pending_upload(&self) -> usize {
        if self.closed.load(Ordering::Relaxed) {
            0
        } else {
            self.out.lock().len()
        }
    }

    fn download_room(&self) -> usize {
        if self.closed.load(Ordering::Relaxed) {
            0
        } else {
            self.read_ahead.load(Ordering::Relaxed)
        }
    }

    fn transfer_upload(&self, budget: usize) -> usize {
        let mut out = self.out.lock();
        if out.is_empty() || budget == 0 {
            return 0;
        }
        let want = budget.min(out.len());
        match self.stream.try_write(&out[..want]) {
            Ok(n) => {
                out.advance(n);
                n
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(_) => {
                self.mark_closed();
                0
            }
        }
    }

    fn transfer_download(&self, budget: usize) -> usize {
        let mut total = 0;
        while total < budget {
            let want = (budget - total).min(16 * 1024);
            let mut buf = vec![0u8; want];
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    self.mark_closed();
                    break;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let _ = self.io_tx.send(IoEvent::Data(self.addr, buf));
                    total += n;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.mark_closed();
                    break;
                }
            }
        }
        total
    }

    fn set_read_ahead(&self, bytes: usize) {
        self.read_ahead.store(bytes, Ordering::Relaxed);
    }

    fn set_upload_cap(&self, bytes: usize) {
        self.upload_cap.store(bytes, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Timers {
    handshake: Option<Instant>,
    reply: Option<Instant>,
}

/// The session driver. All mutation happens inside `run`.
pub struct TorrentSession {
    core: SessionCore,
    conns: HashMap<SocketAddr, PeerConnection>,
    sockets: HashMap<SocketAddr, Arc<ThrottledPeerSocket>>,
    timers: HashMap<SocketAddr, Timers>,
    /// Sends waiting for room under a socket's outstanding-write cap
    deferred: HashMap<SocketAddr, VecDeque<Vec<u8>>>,
    /// Re-dial due times for disconnected peers we initiated
    reconnects: HashMap<SocketAddr, Instant>,
    /// Peers added before start
    pending_peers: Vec<SocketAddr>,
    rate: Arc<RateController>,
    running: bool,
    paused: bool,
    completion_announced: bool,
    checked_valid: usize,
    cmd_rx: mpsc::Receiver<Command>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    events: broadcast::Sender<SessionEvent>,
}

impl TorrentSession {
    /// Validate the config, build the session, and spawn its driver task
    pub fn spawn(
        metainfo: Metainfo,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
        rate: Arc<RateController>,
    ) -> Result<SessionHandle> {
        config.validate()?;

        let core = SessionCore::new(metainfo, storage, config, generate_peer_id());
        let stats = core.stats();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let session = TorrentSession {
            core,
            conns: HashMap::new(),
            sockets: HashMap::new(),
            timers: HashMap::new(),
            deferred: HashMap::new(),
            reconnects: HashMap::new(),
            pending_peers: Vec::new(),
            rate,
            running: false,
            paused: false,
            completion_announced: false,
            checked_valid: 0,
            cmd_rx,
            io_rx,
            io_tx,
            events: events.clone(),
        };
        tokio::spawn(session.run());

        Ok(SessionHandle {
            cmd_tx,
            stats,
            events,
        })
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.core.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(event) = self.io_rx.recv() => self.handle_io(event),
                _ = tick.tick() => {
                    if self.running && !self.paused {
                        self.handle_tick();
                    }
                }
            }
        }

        for (_, socket) in self.sockets.drain() {
            let socket: Arc<dyn ThrottledIo> = socket;
            self.rate.unregister(&socket);
        }
        tracing::debug!(info_hash = %self.core.metainfo.info_hash_hex(), "session stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                if self.running {
                    return;
                }
                self.running = true;
                self.core.stats.reset_session();
                tracing::info!(
                    info_hash = %self.core.metainfo.info_hash_hex(),
                    pieces = self.core.num_pieces(),
                    "session started"
                );
                if self.core.config.verify_on_start {
                    self.spawn_check();
                }
                for addr in std::mem::take(&mut self.pending_peers) {
                    self.dial(addr);
                }
            }
            Command::Pause => {
                if self.paused {
                    return;
                }
                self.paused = true;
                let addrs: Vec<_> = self.conns.keys().copied().collect();
                for addr in addrs {
                    let actions = match self.conns.get_mut(&addr) {
                        Some(conn) => {
                            let actions = conn.pause(&mut self.core);
                            self.core.set_stalled(addr, conn.stalled);
                            actions
                        }
                        None => continue,
                    };
                    self.apply_actions(addr, actions);
                }
            }
            Command::Resume => {
                self.paused = false;
            }
            Command::AddPeer(addr) => self.add_peer(addr),
            Command::AcceptPeer(stream, addr) => self.accept_peer(stream, addr),
            Command::Bitfield(reply) => {
                let _ = reply.send(self.core.bitfield());
            }
            Command::Peers(reply) => {
                let peers = self
                    .conns
                    .values()
                    .map(|conn| PeerInfo {
                        addr: conn.addr,
                        state: conn.state(),
                        downloaded: conn.downloaded(),
                        uploaded: conn.uploaded(),
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Shutdown => {}
        }
    }

    fn spawn_check(&self) {
        let rx = check::spawn_check(self.core.metainfo.clone(), self.core.storage());
        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(result) = rx.recv().await {
                if io_tx.send(IoEvent::PieceChecked(result)).is_err() {
                    return;
                }
            }
            let _ = io_tx.send(IoEvent::CheckFinished);
        });
    }

    fn add_peer(&mut self, addr: SocketAddr) {
        if self.conns.contains_key(&addr) || self.reconnects.contains_key(&addr) {
            return;
        }
        if !self.running {
            self.pending_peers.push(addr);
            return;
        }
        self.dial(addr);
    }

    fn dial(&mut self, addr: SocketAddr) {
        if self.core.is_complete() || self.conns.contains_key(&addr) {
            return;
        }
        let mut conn = PeerConnection::new(addr, PeerRole::Initiator, self.core.num_pieces());
        conn.begin_connect();
        self.conns.insert(addr, conn);

        let io_tx = self.io_tx.clone();
        let timeout = self.core.config.connect_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = io_tx.send(IoEvent::Connected(addr, stream));
                }
                Ok(Err(err)) => {
                    let _ = io_tx.send(IoEvent::ConnectFailed(addr, connect_error(&err)));
                }
                Err(_) => {
                    let err =
                        EngineError::network(NetworkErrorKind::Timeout, "connect timed out");
                    let _ = io_tx.send(IoEvent::ConnectFailed(addr, err));
                }
            }
        });
    }

    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.conns.contains_key(&addr) {
            return;
        }
        let conn = PeerConnection::new(addr, PeerRole::Acceptor, self.core.num_pieces());
        self.conns.insert(addr, conn);
        self.attach_socket(addr, stream);
        self.dispatch(addr, PeerEvent::SocketConnected);
    }

    fn attach_socket(&mut self, addr: SocketAddr, stream: TcpStream) {
        let socket = Arc::new(ThrottledPeerSocket::new(addr, stream, self.io_tx.clone()));
        self.rate.register(socket.clone());
        self.sockets.insert(addr, socket);
        let _ = self.events.send(SessionEvent::PeerConnected { addr });
    }

    fn handle_io(&mut self, event: IoEvent) {
        match event {
            IoEvent::Connected(addr, stream) => {
                if !self.conns.contains_key(&addr) {
                    return;
                }
                self.attach_socket(addr, stream);
                self.dispatch(addr, PeerEvent::SocketConnected);
            }
            IoEvent::ConnectFailed(addr, err) => {
                tracing::debug!(peer = %addr, error = %err, "connect failed");
                self.conns.remove(&addr);
                // refused connections are not re-dialed; timeouts and resets are
                if err.is_retryable()
                    && self.running
                    && !self.paused
                    && !self.core.is_complete()
                {
                    self.reconnects
                        .insert(addr, Instant::now() + self.core.config.reconnect_delay());
                }
            }
            IoEvent::Data(addr, bytes) => self.dispatch(addr, PeerEvent::Data(bytes)),
            IoEvent::SocketClosed(addr) => self.dispatch(addr, PeerEvent::Closed),
            IoEvent::PieceChecked(result) => {
                if result.valid {
                    self.checked_valid += 1;
                    self.core.adopt_verified(result.index);
                    self.drain_core();
                }
            }
            IoEvent::CheckFinished => {
                tracing::info!(valid = self.checked_valid, "startup check finished");
                let _ = self.events.send(SessionEvent::CheckFinished {
                    valid: self.checked_valid,
                });
            }
        }
    }

    fn handle_tick(&mut self) {
        let now = Instant::now();

        let due: Vec<_> = self
            .reconnects
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in due {
            self.reconnects.remove(&addr);
            self.dial(addr);
        }

        let mut fired = Vec::new();
        for (addr, timers) in self.timers.iter_mut() {
            if timers.handshake.is_some_and(|at| at <= now) {
                timers.handshake = None;
                fired.push((*addr, true));
            }
            if timers.reply.is_some_and(|at| at <= now) {
                timers.reply = None;
                fired.push((*addr, false));
            }
        }
        for (addr, is_handshake) in fired {
            let event = if is_handshake {
                PeerEvent::HandshakeTimeout
            } else {
                PeerEvent::ReplyTimeout
            };
            self.dispatch(addr, event);
        }

        let addrs: Vec<_> = self.conns.keys().copied().collect();
        for addr in addrs {
            self.flush_deferred(addr);
            self.dispatch(addr, PeerEvent::Tick);
        }
    }

    /// Feed one event to a connection and execute everything that falls out
    fn dispatch(&mut self, addr: SocketAddr, event: PeerEvent) {
        let actions = match self.conns.get_mut(&addr) {
            Some(conn) => {
                let actions = conn.on_event(event, &mut self.core);
                self.core.set_stalled(addr, conn.stalled);
                actions
            }
            None => return,
        };
        self.apply_actions(addr, actions);
        self.drain_core();
    }

    fn apply_actions(&mut self, addr: SocketAddr, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(bytes) => self.queue_send(addr, bytes),
                Action::SetHandshakeTimer => {
                    self.timers.entry(addr).or_default().handshake =
                        Some(Instant::now() + self.core.config.handshake_timeout());
                }
                Action::ClearHandshakeTimer => {
                    if let Some(timers) = self.timers.get_mut(&addr) {
                        timers.handshake = None;
                    }
                }
                Action::SetReplyTimer => {
                    self.timers.entry(addr).or_default().reply =
                        Some(Instant::now() + self.core.config.request_timeout());
                }
                Action::ClearReplyTimer => {
                    if let Some(timers) = self.timers.get_mut(&addr) {
                        timers.reply = None;
                    }
                }
                Action::Close(reason) => self.close_conn(addr, reason),
            }
        }
    }

    /// Queue bytes on the peer's socket, or park them while the socket is
    /// over its outstanding-write cap
    fn queue_send(&mut self, addr: SocketAddr, bytes: Vec<u8>) {
        let Some(socket) = self.sockets.get(&addr) else {
            return;
        };
        let deferred = self.deferred.entry(addr).or_default();
        if deferred.is_empty() && socket.upload_room() >= bytes.len() {
            socket.queue_upload(&bytes);
            self.rate.notify_work();
        } else {
            deferred.push_back(bytes);
        }
    }

    fn flush_deferred(&mut self, addr: SocketAddr) {
        let Some(socket) = self.sockets.get(&addr) else {
            return;
        };
        let Some(deferred) = self.deferred.get_mut(&addr) else {
            return;
        };
        let mut queued = false;
        while let Some(front) = deferred.front() {
            if socket.upload_room() < front.len() {
                break;
            }
            if let Some(bytes) = deferred.pop_front() {
                socket.queue_upload(&bytes);
                queued = true;
            }
        }
        if queued {
            self.rate.notify_work();
        }
    }

    fn close_conn(&mut self, addr: SocketAddr, reason: CloseReason) {
        if let Some(socket) = self.sockets.remove(&addr) {
            let socket: Arc<dyn ThrottledIo> = socket;
            self.rate.unregister(&socket);
        }
        self.timers.remove(&addr);
        self.deferred.remove(&addr);
        self.core.forget_peer(addr);

        let was_initiator = self
            .conns
            .remove(&addr)
            .map(|conn| conn.role == PeerRole::Initiator)
            .unwrap_or(false);

        tracing::debug!(peer = %addr, reason = ?reason, "peer closed");
        let _ = self.events.send(SessionEvent::PeerDisconnected { addr });

        if was_initiator
            && reason.reconnectable()
            && self.running
            && !self.paused
            && !self.core.is_complete()
        {
            self.reconnects
                .insert(addr, Instant::now() + self.core.config.reconnect_delay());
        }
    }

    /// Route cancels owed after delivery races and broadcast freshly
    /// verified pieces
    fn drain_core(&mut self) {
        for (peer, req) in self.core.take_cancels() {
            let actions = match self.conns.get_mut(&peer) {
                Some(conn) => conn.cancel_block(req),
                None => continue,
            };
            self.apply_actions(peer, actions);
        }

        for index in self.core.take_failed_pieces() {
            let _ = self.events.send(SessionEvent::PieceFailed { index });
        }

        for index in self.core.take_completed_pieces() {
            let _ = self.events.send(SessionEvent::PieceVerified { index });
            let addrs: Vec<_> = self.conns.keys().copied().collect();
            for addr in addrs {
                let actions = match self.conns.get_mut(&addr) {
                    Some(conn) => conn.announce_have(index),
                    None => continue,
                };
                self.apply_actions(addr, actions);
            }
        }

        if self.core.is_complete() && !self.completion_announced {
            self.completion_announced = true;
            tracing::info!(info_hash = %self.core.metainfo.info_hash_hex(), "download complete");
            let _ = self.events.send(SessionEvent::Completed);
        }
    }
}

/// Classify a failed TCP connect; only timeouts and resets are worth
/// re-dialing
fn connect_error(err: &std::io::Error) -> EngineError {
    use std::io::ErrorKind;
    let kind = match err.kind() {
        ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            NetworkErrorKind::ConnectionReset
        }
        ErrorKind::TimedOut => NetworkErrorKind::Timeout,
        _ => NetworkErrorKind::Other,
    };
    EngineError::network(kind, err.to_string())
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    stats: Arc<SessionStats>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    /// Begin transferring: dial queued peers, optionally verify storage
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// Stop requesting and cancel everything in flight
    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Queue a tracker-supplied peer address for dialing
    pub async fn add_peer(&self, addr: SocketAddr) -> Result<()> {
        self.send(Command::AddPeer(addr)).await
    }

    /// Hand an inbound connection to the session
    pub async fn accept_peer(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        self.send(Command::AcceptPeer(stream, addr)).await
    }

    /// Snapshot of our verified-piece bitfield
    pub async fn bitfield(&self) -> Result<BitVec<u8, Msb0>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Bitfield(tx)).await?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Snapshot of every live peer connection with its transfer tallies
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Peers(tx)).await?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Count of live peer connections
    pub async fn num_peers(&self) -> Result<usize> {
        Ok(self.peers().await?.len())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.stats.downloaded()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.stats.uploaded()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use sha1::{Digest, Sha1};

    fn sha1_of(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.1:{}", port).parse().unwrap()
    }

    /// One piece of 16384 bytes, content 0x5a
    fn single_piece_core() -> SessionCore {
        let content = vec![0x5au8; 16384];
        let metainfo =
            Metainfo::new([0xcc; 20], 16384, 16384, vec![sha1_of(&content)]).unwrap();
        SessionCore::new(
            metainfo,
            Arc::new(MemoryStorage::new(16384)),
            SessionConfig::default(),
            [0x07; 20],
        )
    }

    #[test]
    fn test_endgame_duplicates_stalled_block_and_first_delivery_cancels() {
        let mut core = single_piece_core();
        let a = addr(1);
        let b = addr(2);
        let everything = bitvec![u8, Msb0; 1; 1];

        let req = core.assign_block(a, &everything, &[]).unwrap();
        assert_eq!((req.piece, req.offset, req.length), (0, 0, 16384));

        // piece fully covered, nothing fresh for b
        assert!(core.assign_block(b, &everything, &[]).is_none());

        // a stalls, b duplicates a's block
        core.set_stalled(a, true);
        let dup = core.assign_block(b, &everything, &[]).unwrap();
        assert_eq!(dup, req);

        // b delivers first: a is owed a cancel, the piece verifies
        core.deliver_block(b, 0, 0, &vec![0x5au8; 16384]).unwrap();
        assert_eq!(core.take_cancels(), vec![(a, req)]);
        assert!(core.has_piece(0));
        assert_eq!(core.take_completed_pieces(), vec![0]);

        // a's late delivery is a no-op
        core.deliver_block(a, 0, 0, &vec![0x5au8; 16384]).unwrap();
        assert!(core.take_cancels().is_empty());
        assert!(core.take_completed_pieces().is_empty());
    }

    #[test]
    fn test_no_duplicate_without_stall() {
        let mut core = single_piece_core();
        let everything = bitvec![u8, Msb0; 1; 1];

        core.assign_block(addr(1), &everything, &[]).unwrap();
        for _ in 0..3 {
            assert!(core.assign_block(addr(2), &everything, &[]).is_none());
        }
    }

    #[test]
    fn test_assignment_respects_peer_bitfield() {
        let mut core = single_piece_core();
        let nothing = bitvec![u8, Msb0; 0; 1];
        assert!(core.assign_block(addr(1), &nothing, &[]).is_none());
    }

    #[test]
    fn test_hash_mismatch_requeues_piece() {
        let mut core = single_piece_core();
        let a = addr(1);
        let everything = bitvec![u8, Msb0; 1; 1];

        let req = core.assign_block(a, &everything, &[]).unwrap();
        core.deliver_block(a, 0, 0, &vec![0xffu8; 16384]).unwrap();

        assert!(!core.has_piece(0));
        assert!(core.take_completed_pieces().is_empty());
        assert_eq!(core.take_failed_pieces(), vec![0]);

        // the piece is requestable again
        let again = core.assign_block(a, &everything, &[]).unwrap();
        assert_eq!(again, req);
    }

    #[test]
    fn test_verified_piece_persists_to_storage() {
        let mut core = single_piece_core();
        let a = addr(1);
        let everything = bitvec![u8, Msb0; 1; 1];

        core.assign_block(a, &everything, &[]).unwrap();
        core.deliver_block(a, 0, 0, &vec![0x5au8; 16384]).unwrap();

        assert!(core.is_complete());
        assert_eq!(core.storage().read_range(0, 16384).unwrap(), vec![0x5a; 16384]);
        assert_eq!(core.stats().downloaded(), 16384);
    }

    #[test]
    fn test_unknown_piece_delivery_is_ignored() {
        let mut core = single_piece_core();
        core.deliver_block(addr(1), 42, 0, &[0u8; 100]).unwrap();
        assert!(core.take_cancels().is_empty());
    }

    #[test]
    fn test_read_block_requires_verified_piece() {
        let mut core = single_piece_core();
        assert!(core.read_block(0, 0, 100).is_err());

        core.storage().write_range(0, &vec![0x5au8; 16384]).unwrap();
        core.mark_piece_verified_for_tests(0);
        assert_eq!(core.read_block(0, 100, 16).unwrap(), vec![0x5a; 16]);
    }

    #[test]
    fn test_forget_peer_releases_assignments() {
        let mut core = single_piece_core();
        let a = addr(1);
        let b = addr(2);
        let everything = bitvec![u8, Msb0; 1; 1];

        core.assign_block(a, &everything, &[]).unwrap();
        core.set_stalled(a, true);
        core.forget_peer(a);

        // the block is fresh again, not an endgame duplicate
        let req = core.assign_block(b, &everything, &[]).unwrap();
        assert_eq!((req.offset, req.length), (0, 16384));
    }

    #[test]
    fn test_bitfield_bytes_pad_bits_zero() {
        let piece0 = vec![1u8; 100];
        let hashes = vec![sha1_of(&piece0); 3];
        let metainfo = Metainfo::new([0; 20], 100, 300, hashes).unwrap();
        let mut core = SessionCore::new(
            metainfo,
            Arc::new(MemoryStorage::new(300)),
            SessionConfig::default(),
            [0; 20],
        );
        core.mark_piece_verified_for_tests(0);
        core.mark_piece_verified_for_tests(2);

        let bytes = core.bitfield_bytes();
        assert_eq!(bytes, vec![0b1010_0000]);
    }

    #[test]
    fn test_connect_error_retryability() {
        use std::io::{Error, ErrorKind};

        let timeout = connect_error(&Error::new(ErrorKind::TimedOut, "timed out"));
        assert!(timeout.is_retryable());

        let reset = connect_error(&Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_retryable());

        let refused = connect_error(&Error::new(ErrorKind::ConnectionRefused, "refused"));
        assert!(!refused.is_retryable());
    }

    #[test]
    fn test_adopt_verified_is_idempotent() {
        let mut core = single_piece_core();
        core.adopt_verified(0);
        core.adopt_verified(0);
        assert_eq!(core.take_completed_pieces(), vec![0]);
        assert!(core.is_complete());
    }
}
