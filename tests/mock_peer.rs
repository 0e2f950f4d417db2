//! Mock BitTorrent peer for integration tests
//!
//! A minimal remote peer over real TCP: it answers the handshake, announces
//! a bitfield, optionally unchokes immediately, and serves block requests
//! from in-memory piece data. Deliberately simple so tests stay readable.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bitvec::prelude::*;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash to accept connections for
    pub info_hash: [u8; 20],
    /// Our peer id
    pub peer_id: [u8; 20],
    /// Pieces we have
    pub pieces: BitVec<u8, Msb0>,
    /// Piece data to serve
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Unchoke connecting peers without waiting for interest
    pub auto_unchoke: bool,
    /// Raw bitfield payload override, for malformed-bitfield tests
    pub bitfield_override: Option<Vec<u8>>,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-MK0001-");
        for byte in &mut peer_id[8..] {
            *byte = rand::random();
        }
        Self {
            info_hash,
            peer_id,
            pieces: bitvec![u8, Msb0; 0; num_pieces],
            piece_data: HashMap::new(),
            auto_unchoke: true,
            bitfield_override: None,
        }
    }

    /// Add a piece we serve
    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.pieces.set(index as usize, true);
        self.piece_data.insert(index, data);
        self
    }

    /// Announce a raw bitfield payload instead of the real one
    pub fn with_bitfield_override(mut self, payload: Vec<u8>) -> Self {
        self.bitfield_override = Some(payload);
        self
    }
}

/// A mock peer listening on localhost
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
}

impl MockPeer {
    pub async fn new(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self { config, listener })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accept connections in the background until dropped
    pub fn start_accepting(self: Arc<Self>) {
        let peer = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match peer.listener.accept().await {
                    Ok((stream, _)) => {
                        let peer = Arc::clone(&peer);
                        tokio::spawn(async move {
                            let _ = peer.handle_connection(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        self.do_handshake(&mut stream).await?;
        self.send_bitfield(&mut stream).await?;
        if self.config.auto_unchoke {
            stream.write_all(&[0, 0, 0, 1, 1]).await?;
        }

        loop {
            let msg = read_message(&mut stream).await?;
            match msg {
                MockMessage::Interested => {
                    if !self.config.auto_unchoke {
                        stream.write_all(&[0, 0, 0, 1, 1]).await?;
                    }
                }
                MockMessage::Request {
                    index,
                    begin,
                    length,
                } => {
                    if let Some(piece) = self.config.piece_data.get(&index) {
                        let end = (begin + length) as usize;
                        if end <= piece.len() {
                            let block = &piece[begin as usize..end];
                            send_piece(&mut stream, index, begin, block).await?;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    async fn do_handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;

        if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid protocol string",
            ));
        }
        if handshake[28..48] != self.config.info_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "info hash mismatch",
            ));
        }

        let mut response = Vec::with_capacity(68);
        response.push(19);
        response.extend_from_slice(PROTOCOL_STRING);
        response.extend_from_slice(&[0u8; 8]);
        response.extend_from_slice(&self.config.info_hash);
        response.extend_from_slice(&self.config.peer_id);
        stream.write_all(&response).await
    }

    async fn send_bitfield(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let payload = match &self.config.bitfield_override {
            Some(raw) => raw.clone(),
            None => self.config.pieces.as_raw_slice().to_vec(),
        };
        let len = 1 + payload.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(5);
        msg.extend_from_slice(&payload);
        stream.write_all(&msg).await
    }
}

async fn send_piece(
    stream: &mut TcpStream,
    index: u32,
    begin: u32,
    block: &[u8],
) -> std::io::Result<()> {
    let len = 9 + block.len() as u32;
    let mut msg = Vec::with_capacity(4 + len as usize);
    msg.extend_from_slice(&len.to_be_bytes());
    msg.push(7);
    msg.extend_from_slice(&index.to_be_bytes());
    msg.extend_from_slice(&begin.to_be_bytes());
    msg.extend_from_slice(block);
    stream.write_all(&msg).await
}

/// Simplified message view for the mock
#[derive(Debug)]
pub enum MockMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { payload: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Other { id: u8 },
}

pub async fn read_message(stream: &mut TcpStream) -> std::io::Result<MockMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(MockMessage::KeepAlive);
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    let payload = data[1..].to_vec();

    let be = |at: usize| {
        u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
    };

    Ok(match data[0] {
        0 => MockMessage::Choke,
        1 => MockMessage::Unchoke,
        2 => MockMessage::Interested,
        3 => MockMessage::NotInterested,
        4 => MockMessage::Have { index: be(0) },
        5 => MockMessage::Bitfield {
            payload: payload.clone(),
        },
        6 => MockMessage::Request {
            index: be(0),
            begin: be(4),
            length: be(8),
        },
        7 => MockMessage::Piece {
            index: be(0),
            begin: be(4),
            block: payload[8..].to_vec(),
        },
        8 => MockMessage::Cancel {
            index: be(0),
            begin: be(4),
            length: be(8),
        },
        id => MockMessage::Other { id },
    })
}

/// Deterministic piece data with its SHA-1
pub fn create_test_piece_data(piece_length: usize) -> (Vec<u8>, [u8; 20]) {
    let data: Vec<u8> = (0..piece_length).map(|i| (i % 256) as u8).collect();
    let mut hasher = Sha1::new();
    hasher.update(&data);
    (data, hasher.finalize().into())
}

pub fn random_info_hash() -> [u8; 20] {
    let mut hash = [0u8; 20];
    for byte in &mut hash {
        *byte = rand::random();
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_peer_listens() {
        let config = MockPeerConfig::new(random_info_hash(), 4);
        let peer = MockPeer::new(config).await.unwrap();
        assert!(peer.addr().port() > 0);
    }

    #[test]
    fn test_create_piece_data_hash() {
        let (data, hash) = create_test_piece_data(16384);
        assert_eq!(data.len(), 16384);

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let computed: [u8; 20] = hasher.finalize().into();
        assert_eq!(hash, computed);
    }
}
