//! Peer connection state machine
//!
//! One [`PeerConnection`] per remote peer, driven entirely by events. The
//! connection owns no socket: the session driver feeds it socket bytes,
//! timer expirations, and pacing ticks, and it answers with a list of
//! [`Action`]s (bytes to send, timers to arm, a close verdict). This keeps
//! the whole protocol state machine unit-testable without a network stack.
//!
//! Lifecycle: `Created → Connecting → Handshaking → Established` and then
//! either `Disconnected` (reconnectable) or `Failed` (protocol or storage
//! fault, never re-dialed).

use std::net::SocketAddr;

use bitvec::prelude::*;
use bytes::BytesMut;

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::piece::BlockRequest;
use crate::session::SessionCore;
use crate::wire::{Handshake, Message, MAX_BLOCK_SIZE};

/// Keep-alive interval on an otherwise idle connection
const KEEP_ALIVE_SECS: u64 = 120;

/// Which side opened the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// We dialed the peer (tracker-supplied address); eligible for reconnect
    Initiator,
    /// The peer dialed us; never re-dialed
    Acceptor,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    Connecting,
    Handshaking,
    Established,
    Disconnected,
    Failed,
}

/// Input to the state machine
#[derive(Debug)]
pub enum PeerEvent {
    /// TCP connect finished (or, for accepted sockets, the connection is
    /// ready to read)
    SocketConnected,
    /// Bytes read off the socket
    Data(Vec<u8>),
    /// Handshake timer fired
    HandshakeTimeout,
    /// Reply timer fired with requests still outstanding
    ReplyTimeout,
    /// Periodic pacing tick
    Tick,
    /// Socket reached EOF or errored
    Closed,
}

/// Why a connection is being closed
#[derive(Debug)]
pub enum CloseReason {
    /// Handshake did not complete in time
    HandshakeTimeout,
    /// Remote closed the socket or the read failed
    RemoteClosed,
    /// Both sides hold every piece, nothing left to exchange
    MutuallyComplete,
    /// Protocol violation or storage failure, fatal to this connection
    Fatal(EngineError),
}

impl CloseReason {
    /// Whether the session may re-dial this peer after the reconnect delay
    pub fn reconnectable(&self) -> bool {
        match self {
            Self::HandshakeTimeout | Self::RemoteClosed => true,
            Self::MutuallyComplete => false,
            Self::Fatal(err) => err.is_retryable(),
        }
    }
}

/// Output of the state machine, executed by the session driver
#[derive(Debug)]
pub enum Action {
    /// Queue bytes for transmission
    Send(Vec<u8>),
    /// Arm the handshake timer
    SetHandshakeTimer,
    /// Disarm the handshake timer
    ClearHandshakeTimer,
    /// (Re)arm the reply timer
    SetReplyTimer,
    /// Disarm the reply timer
    ClearReplyTimer,
    /// Tear the connection down
    Close(CloseReason),
}

/// State for one remote peer
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub role: PeerRole,
    state: PeerState,

    /// We are choking the remote
    am_choking: bool,
    /// We are interested in the remote's pieces
    am_interested: bool,
    /// The remote is choking us
    peer_choking: bool,
    /// The remote is interested in our pieces
    peer_interested: bool,

    /// Remote availability, one bit per piece
    peer_pieces: BitVec<u8, Msb0>,
    /// Remote peer id from the handshake
    peer_id: Option<[u8; 20]>,

    read_buffer: BytesMut,

    /// Requests sent and not yet answered, bounded by the pipeline depth
    outstanding: Vec<BlockRequest>,
    /// Reply timer expired with requests still pending; the session makes
    /// these requests eligible for endgame duplication
    pub stalled: bool,

    /// Ticks since we last sent anything, drives keep-alives
    idle_ticks: u64,

    /// Block payload bytes received from this peer
    bytes_downloaded: u64,
    /// Block payload bytes served to this peer
    bytes_uploaded: u64,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, role: PeerRole, num_pieces: usize) -> Self {
        Self {
            addr,
            role,
            state: PeerState::Created,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_pieces: bitvec![u8, Msb0; 0; num_pieces],
            peer_id: None,
            read_buffer: BytesMut::new(),
            outstanding: Vec::new(),
            stalled: false,
            idle_ticks: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Mark the connection as dialing. The driver calls this when it spawns
    /// the TCP connect.
    pub fn begin_connect(&mut self) {
        self.state = PeerState::Connecting;
    }

    pub fn outstanding(&self) -> &[BlockRequest] {
        &self.outstanding
    }

    pub fn peer_pieces(&self) -> &BitVec<u8, Msb0> {
        &self.peer_pieces
    }

    /// Block payload bytes received from this peer
    pub fn downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Block payload bytes served to this peer
    pub fn uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Single dispatch point: feed one event, collect the actions
    pub fn on_event(&mut self, event: PeerEvent, core: &mut SessionCore) -> Vec<Action> {
        match event {
            PeerEvent::SocketConnected => self.on_socket_connected(core),
            PeerEvent::Data(bytes) => self.on_data(bytes, core),
            PeerEvent::HandshakeTimeout => self.on_handshake_timeout(core),
            PeerEvent::ReplyTimeout => self.on_reply_timeout(),
            PeerEvent::Tick => self.on_tick(core),
            PeerEvent::Closed => self.on_closed(core),
        }
    }

    fn on_socket_connected(&mut self, core: &mut SessionCore) -> Vec<Action> {
        if !matches!(self.state, PeerState::Created | PeerState::Connecting) {
            tracing::warn!(peer = %self.addr, state = ?self.state, "socket connected in unexpected state");
            return Vec::new();
        }

        self.state = PeerState::Handshaking;
        let mut actions = vec![Action::SetHandshakeTimer];
        if self.role == PeerRole::Initiator {
            let hs = Handshake::new(core.info_hash(), core.local_peer_id());
            self.send_raw(hs.encode().to_vec(), &mut actions);
        }
        actions
    }

    fn on_data(&mut self, bytes: Vec<u8>, core: &mut SessionCore) -> Vec<Action> {
        self.read_buffer.extend_from_slice(&bytes);
        let mut actions = Vec::new();

        if self.state == PeerState::Handshaking {
            match self.try_complete_handshake(core, &mut actions) {
                Ok(true) => {}
                Ok(false) => return actions,
                Err(err) => return self.fail(core, err),
            }
        }

        if self.state == PeerState::Established {
            loop {
                match Message::next_frame(&mut self.read_buffer) {
                    Ok(Some(msg)) => match self.handle_message(msg, core, &mut actions) {
                        Ok(()) => {}
                        Err(err) => return self.fail(core, err),
                    },
                    Ok(None) => break,
                    Err(err) => return self.fail(core, err),
                }
            }
        }

        actions
    }

    /// Parse the 68-byte handshake reply once fully buffered. Returns
    /// Ok(true) once established.
    fn try_complete_handshake(
        &mut self,
        core: &mut SessionCore,
        actions: &mut Vec<Action>,
    ) -> Result<bool> {
        let Some(hs) = Handshake::next_from(&mut self.read_buffer)? else {
            return Ok(false);
        };

        if hs.info_hash != core.info_hash() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::Handshake,
                "info hash mismatch",
            ));
        }

        self.peer_id = Some(hs.peer_id);
        actions.push(Action::ClearHandshakeTimer);

        // the accepting side replies with its own handshake first
        if self.role == PeerRole::Acceptor {
            let reply = Handshake::new(core.info_hash(), core.local_peer_id());
            self.send_raw(reply.encode().to_vec(), actions);
        }

        self.state = PeerState::Established;
        tracing::debug!(peer = %self.addr, "handshake complete");

        self.send(
            Message::Bitfield {
                bitfield: core.bitfield_bytes(),
            },
            actions,
        );
        Ok(true)
    }

    fn handle_message(
        &mut self,
        msg: Message,
        core: &mut SessionCore,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}

            Message::Choke => {
                self.peer_choking = true;
                // everything in flight goes back to the assignment pool
                core.release_outstanding(self.addr, &self.outstanding);
                self.outstanding.clear();
                self.stalled = false;
                actions.push(Action::ClearReplyTimer);
            }

            Message::Unchoke => {
                self.peer_choking = false;
                if self.am_interested {
                    self.fill_pipeline(core, actions);
                }
            }

            Message::Interested => {
                self.peer_interested = true;
            }

            Message::NotInterested => {
                self.peer_interested = false;
            }

            Message::Have { index } => {
                let idx = index as usize;
                if idx >= self.peer_pieces.len() {
                    tracing::warn!(peer = %self.addr, index, "have for out-of-range piece, ignored");
                } else {
                    self.peer_pieces.set(idx, true);
                }
            }

            Message::Bitfield { bitfield } => {
                if bitfield.len() != core.bitfield_len() {
                    return Err(EngineError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        format!(
                            "bitfield is {} bytes, expected {}",
                            bitfield.len(),
                            core.bitfield_len()
                        ),
                    ));
                }
                let bits = BitVec::<u8, Msb0>::from_vec(bitfield);
                self.peer_pieces = bits[..core.num_pieces()].to_bitvec();
            }

            Message::Request {
                index,
                begin,
                length,
            } => {
                self.validate_request(index, begin, length, core)?;
                let data = core.read_block(index, begin, length)?;
                core.record_upload(data.len() as u64);
                self.bytes_uploaded += data.len() as u64;
                self.send(Message::Piece { index, begin, data }, actions);
            }

            Message::Piece { index, begin, data } => {
                let length = data.len() as u32;
                self.bytes_downloaded += data.len() as u64;
                if let Some(pos) = self
                    .outstanding
                    .iter()
                    .position(|r| r.piece == index && r.offset == begin && r.length == length)
                {
                    self.outstanding.remove(pos);
                    self.stalled = false;
                    if self.outstanding.is_empty() {
                        actions.push(Action::ClearReplyTimer);
                    } else {
                        actions.push(Action::SetReplyTimer);
                    }
                }
                // delivery also handles the no-queue-match case: endgame
                // duplicates land here and resolve against the piece itself
                core.deliver_block(self.addr, index, begin, &data)?;
            }

            // accepted, not acted upon
            Message::Cancel { .. } | Message::Port { .. } => {}
        }
        Ok(())
    }

    fn validate_request(
        &self,
        index: u32,
        begin: u32,
        length: u32,
        core: &SessionCore,
    ) -> Result<()> {
        let piece_len = core.piece_len(index).ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("request for out-of-range piece {}", index),
            )
        })?;
        let end = begin as u64 + length as u64;
        if length == 0 || length > MAX_BLOCK_SIZE || end > piece_len as u64 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!(
                    "request out of bounds: begin={} length={} piece_len={}",
                    begin, length, piece_len
                ),
            ));
        }
        Ok(())
    }

    fn on_tick(&mut self, core: &mut SessionCore) -> Vec<Action> {
        if self.state != PeerState::Established {
            return Vec::new();
        }
        let mut actions = Vec::new();

        if core.is_complete() && self.peer_has_all(core) {
            core.release_outstanding(self.addr, &self.outstanding);
            self.outstanding.clear();
            self.state = PeerState::Disconnected;
            actions.push(Action::ClearReplyTimer);
            actions.push(Action::Close(CloseReason::MutuallyComplete));
            return actions;
        }

        let wants = self.remote_has_needed_piece(core);
        if wants && !self.am_interested {
            self.am_interested = true;
            self.send(Message::Interested, &mut actions);
        } else if !wants && self.am_interested {
            self.am_interested = false;
            self.send(Message::NotInterested, &mut actions);
        }

        if self.peer_interested && self.am_choking {
            self.am_choking = false;
            self.send(Message::Unchoke, &mut actions);
        }

        if self.am_interested && !self.peer_choking {
            self.fill_pipeline(core, &mut actions);
        }

        self.idle_ticks += 1;
        let keep_alive_ticks = (KEEP_ALIVE_SECS * 1000 / core.config.tick_interval_ms).max(1);
        if self.idle_ticks >= keep_alive_ticks {
            self.send(Message::KeepAlive, &mut actions);
        }

        actions
    }

    /// Pull assignments until the pipeline is full or the session has
    /// nothing useful for this peer
    fn fill_pipeline(&mut self, core: &mut SessionCore, actions: &mut Vec<Action>) {
        while self.outstanding.len() < core.config.pipeline_depth {
            let Some(req) = core.assign_block(self.addr, &self.peer_pieces, &self.outstanding)
            else {
                break;
            };
            self.outstanding.push(req);
            self.send(
                Message::Request {
                    index: req.piece,
                    begin: req.offset,
                    length: req.length,
                },
                actions,
            );
            actions.push(Action::SetReplyTimer);
        }
    }

    fn remote_has_needed_piece(&self, core: &SessionCore) -> bool {
        self.peer_pieces
            .iter_ones()
            .any(|i| !core.has_piece(i as u32))
    }

    fn peer_has_all(&self, core: &SessionCore) -> bool {
        self.peer_pieces.count_ones() == core.num_pieces()
    }

    fn on_handshake_timeout(&mut self, core: &mut SessionCore) -> Vec<Action> {
        if self.state != PeerState::Handshaking {
            return Vec::new();
        }
        tracing::debug!(peer = %self.addr, "handshake timed out");
        core.release_outstanding(self.addr, &self.outstanding);
        self.outstanding.clear();
        self.state = PeerState::Disconnected;
        vec![Action::Close(CloseReason::HandshakeTimeout)]
    }

    /// A reply timeout only flags the connection as stalled. Its pending
    /// requests stay queued but become eligible for endgame duplication by
    /// other connections.
    fn on_reply_timeout(&mut self) -> Vec<Action> {
        if self.state == PeerState::Established && !self.outstanding.is_empty() {
            tracing::debug!(peer = %self.addr, pending = self.outstanding.len(), "peer stalled");
            self.stalled = true;
        }
        Vec::new()
    }

    fn on_closed(&mut self, core: &mut SessionCore) -> Vec<Action> {
        if matches!(self.state, PeerState::Disconnected | PeerState::Failed) {
            return Vec::new();
        }
        core.release_outstanding(self.addr, &self.outstanding);
        self.outstanding.clear();
        self.stalled = false;
        self.state = PeerState::Disconnected;
        vec![
            Action::ClearHandshakeTimer,
            Action::ClearReplyTimer,
            Action::Close(CloseReason::RemoteClosed),
        ]
    }

    /// Pause: stop requesting, re-choke, cancel everything in flight
    pub fn pause(&mut self, core: &mut SessionCore) -> Vec<Action> {
        if self.state != PeerState::Established {
            return Vec::new();
        }
        let mut actions = Vec::new();

        if self.am_interested {
            self.am_interested = false;
            self.send(Message::NotInterested, &mut actions);
        }
        if !self.am_choking {
            self.am_choking = true;
            self.send(Message::Choke, &mut actions);
        }
        for req in &self.outstanding {
            self.idle_ticks = 0;
            actions.push(Action::Send(
                Message::Cancel {
                    index: req.piece,
                    begin: req.offset,
                    length: req.length,
                }
                .encode(),
            ));
        }
        core.release_outstanding(self.addr, &self.outstanding);
        self.outstanding.clear();
        self.stalled = false;
        actions.push(Action::ClearReplyTimer);
        actions
    }

    /// Drop a block from this connection's pipeline because another peer
    /// delivered it first, sending `cancel` so the remote stops uploading it
    pub fn cancel_block(&mut self, req: BlockRequest) -> Vec<Action> {
        let Some(pos) = self.outstanding.iter().position(|r| *r == req) else {
            return Vec::new();
        };
        self.outstanding.remove(pos);
        let mut actions = Vec::new();
        self.send(
            Message::Cancel {
                index: req.piece,
                begin: req.offset,
                length: req.length,
            },
            &mut actions,
        );
        if self.outstanding.is_empty() {
            self.stalled = false;
            actions.push(Action::ClearReplyTimer);
        }
        actions
    }

    /// Broadcast path for a freshly verified piece
    pub fn announce_have(&mut self, index: u32) -> Vec<Action> {
        if self.state != PeerState::Established {
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.send(Message::Have { index }, &mut actions);
        actions
    }

    /// Queue a wire message, resetting the keep-alive counter
    fn send(&mut self, msg: Message, actions: &mut Vec<Action>) {
        self.send_raw(msg.encode(), actions);
    }

    fn send_raw(&mut self, bytes: Vec<u8>, actions: &mut Vec<Action>) {
        self.idle_ticks = 0;
        actions.push(Action::Send(bytes));
    }

    fn fail(&mut self, core: &mut SessionCore, err: EngineError) -> Vec<Action> {
        tracing::warn!(peer = %self.addr, error = %err, "connection failed");
        core.release_outstanding(self.addr, &self.outstanding);
        self.outstanding.clear();
        self.stalled = false;
        self.state = PeerState::Failed;
        vec![
            Action::ClearHandshakeTimer,
            Action::ClearReplyTimer,
            Action::Close(CloseReason::Fatal(err)),
        ]
    }
}
