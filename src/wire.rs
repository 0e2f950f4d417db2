//! Peer Wire Protocol codec
//!
//! Bit-exact encoding and decoding of the BitTorrent peer wire protocol
//! (BEP 3): the fixed 68-byte handshake and the length-prefixed message
//! frames. Only the 10 base message types are supported; an unrecognized
//! message id is a protocol violation.

use bytes::{Buf, BytesMut};

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Protocol string for BitTorrent
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake message (1 + 19 + 8 + 20 + 20)
pub const HANDSHAKE_SIZE: usize = 68;

/// Maximum accepted message length. Declared frame lengths above this are a
/// fatal protocol error.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest block length we will serve for a `request` message
pub const MAX_BLOCK_SIZE: u32 = 32 * 1024;

/// Standard block request size (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// The fixed-size handshake exchanged at connection start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encode to the 68-byte wire form
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        // bytes 20..28 are reserved, all zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decode from exactly 68 bytes, validating the protocol string
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::Handshake,
                format!("handshake must be {} bytes, got {}", HANDSHAKE_SIZE, data.len()),
            ));
        }
        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &data[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(EngineError::protocol(
                ProtocolErrorKind::Handshake,
                "invalid protocol string",
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /// Pull one complete handshake off the front of `buf`, if buffered.
    pub fn next_from(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < HANDSHAKE_SIZE {
            return Ok(None);
        }
        let frame = buf.split_to(HANDSHAKE_SIZE);
        Self::decode(&frame).map(Some)
    }
}

/// Peer wire protocol message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep connection alive (zero-length frame)
    KeepAlive,

    /// Stop serving the peer's requests
    Choke,

    /// Start serving the peer's requests
    Unchoke,

    /// Interested in the peer's data
    Interested,

    /// Not interested in the peer's data
    NotInterested,

    /// Announce possession of one piece
    Have { index: u32 },

    /// Full availability bitfield, MSB-first within each byte
    Bitfield { bitfield: Vec<u8> },

    /// Request a block
    Request { index: u32, begin: u32, length: u32 },

    /// Block data (response to a request)
    Piece {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },

    /// Cancel a pending request
    Cancel { index: u32, begin: u32, length: u32 },

    /// DHT listen port (accepted, not acted upon)
    Port { port: u16 },
}

impl Message {
    /// Get the message id, `None` for keep-alive
    pub fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Cancel { .. } => Some(8),
            Self::Port { .. } => Some(9),
        }
    }

    /// Encode the message including its 4-byte length prefix
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],

            Self::Choke => vec![0, 0, 0, 1, 0],

            Self::Unchoke => vec![0, 0, 0, 1, 1],

            Self::Interested => vec![0, 0, 0, 1, 2],

            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece { index, begin, data } => {
                let len = 9 + data.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }

    /// Decode a message body (without the length prefix)
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        match id {
            0 => expect_empty(payload, Self::Choke),
            1 => expect_empty(payload, Self::Unchoke),
            2 => expect_empty(payload, Self::Interested),
            3 => expect_empty(payload, Self::NotInterested),

            4 => {
                if payload.len() != 4 {
                    return Err(malformed("have"));
                }
                Ok(Self::Have {
                    index: read_u32(payload, 0),
                })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                if payload.len() != 12 {
                    return Err(malformed("request"));
                }
                Ok(Self::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(malformed("piece"));
                }
                Ok(Self::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    data: payload[8..].to_vec(),
                })
            }

            8 => {
                if payload.len() != 12 {
                    return Err(malformed("cancel"));
                }
                Ok(Self::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            9 => {
                if payload.len() != 2 {
                    return Err(malformed("port"));
                }
                Ok(Self::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                })
            }

            other => Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("unknown message id {}", other),
            )),
        }
    }

    /// Pull the next complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame; the
    /// bytes stay buffered for the next read. A declared length above
    /// [`MAX_MESSAGE_SIZE`] is a fatal protocol error.
    pub fn next_frame(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(EngineError::protocol(
                ProtocolErrorKind::OversizedMessage,
                format!("declared message length {} exceeds ceiling {}", len, MAX_MESSAGE_SIZE),
            ));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(len);
        Self::decode(&body).map(Some)
    }
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

fn expect_empty(payload: &[u8], msg: Message) -> Result<Message> {
    if payload.is_empty() {
        Ok(msg)
    } else {
        Err(EngineError::protocol(
            ProtocolErrorKind::PeerProtocol,
            "unexpected payload on flag message",
        ))
    }
}

fn malformed(name: &str) -> EngineError {
    EngineError::protocol(
        ProtocolErrorKind::PeerProtocol,
        format!("malformed {} message", name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let hs = Handshake::new([0x11; 20], [0x22; 20]);
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_SIZE);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], PROTOCOL_STRING);
        assert_eq!(&encoded[20..28], &[0u8; 8]);

        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_handshake_bad_protocol_string() {
        let mut encoded = Handshake::new([0; 20], [0; 20]).encode();
        encoded[1] = b'X';
        assert!(Handshake::decode(&encoded).is_err());

        encoded = Handshake::new([0; 20], [0; 20]).encode();
        encoded[0] = 18;
        assert!(Handshake::decode(&encoded).is_err());
    }

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::KeepAlive;
        assert_eq!(msg.encode(), vec![0, 0, 0, 0]);

        let msg = Message::Choke;
        assert_eq!(msg.encode(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::decode(&[0]).unwrap(), Message::Choke);

        let msg = Message::Have { index: 42 };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded[4..]).unwrap(), msg);

        let msg = Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        };
        let encoded = msg.encode();
        assert_eq!(encoded[3], 13);
        assert_eq!(Message::decode(&encoded[4..]).unwrap(), msg);

        let msg = Message::Piece {
            index: 3,
            begin: 0,
            data: vec![0xaa; 64],
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded[4..]).unwrap(), msg);

        let msg = Message::Port { port: 6881 };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded[4..]).unwrap(), msg);
    }

    #[test]
    fn test_bitfield_round_trip() {
        let msg = Message::Bitfield {
            bitfield: vec![0b10101010, 0b01000000],
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded[4..]).unwrap(), msg);
    }

    #[test]
    fn test_unknown_message_id_is_fatal() {
        assert!(Message::decode(&[20, 0, 0]).is_err());
        assert!(Message::decode(&[0x0e]).is_err());
    }

    #[test]
    fn test_next_frame_partial_then_complete() {
        let mut buf = BytesMut::new();
        let encoded = Message::Have { index: 7 }.encode();

        buf.extend_from_slice(&encoded[..3]);
        assert!(Message::next_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&encoded[3..]);
        let msg = Message::next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Have { index: 7 });
        assert!(buf.is_empty());
    }

    #[test]
    fn test_next_frame_two_messages_buffered() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Message::Unchoke.encode());
        buf.extend_from_slice(&Message::Interested.encode());

        assert_eq!(Message::next_frame(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(
            Message::next_frame(&mut buf).unwrap(),
            Some(Message::Interested)
        );
        assert_eq!(Message::next_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_next_frame_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[7]);
        assert!(Message::next_frame(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            Message::next_frame(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        );
    }
}
