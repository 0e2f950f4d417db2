//! Piece and block model
//!
//! A torrent's content is split into pieces, each independently SHA-1
//! verifiable, and pieces into blocks, the unit peers actually request.
//! [`Piece`] owns the staging buffer for its bytes while downloads are in
//! flight; once the hash verifies the buffer is released and never read
//! again. Blocks track which peers currently hold an outstanding request
//! for them, which is what makes endgame duplication and cancel fan-out
//! possible.

use std::collections::HashSet;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};

use crate::metainfo::Sha1Hash;

/// A block request on the wire, identified by (piece, offset, length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Block offset within piece
    pub offset: u32,
    /// Block length
    pub length: u32,
}

/// A contiguous byte range of one piece
#[derive(Debug)]
pub struct Block {
    /// Offset within the owning piece
    pub offset: u32,
    /// Byte length
    pub length: u32,
    /// Set once the first delivery lands; the block is immutable after
    pub downloaded: bool,
    /// Peers currently holding an outstanding request for this block
    pub assignees: HashSet<SocketAddr>,
}

/// Staging buffer lifecycle for a piece.
///
/// `Verified` holds no bytes, so no read path can exist after release.
#[derive(Debug)]
pub enum PieceBuffer {
    /// No data received yet
    Empty,
    /// Download in progress, bytes staged here
    Buffered(Vec<u8>),
    /// Hash verified and persisted externally, buffer released
    Verified,
}

/// Outcome of delivering block data to a piece
#[derive(Debug, PartialEq, Eq)]
pub enum BlockDelivery {
    /// First delivery for this block. Carries the other assignees whose
    /// in-flight requests should now be cancelled.
    Stored { cancel: Vec<SocketAddr> },
    /// Block already downloaded (or piece already verified), data discarded
    Duplicate,
    /// No block with this (offset, length) exists in the piece
    Unknown,
}

/// One piece of the torrent content
#[derive(Debug)]
pub struct Piece {
    /// 0-based piece index
    pub index: u32,
    /// Declared byte length
    pub length: u32,
    /// Expected SHA-1 of the full piece
    hash: Sha1Hash,
    buffer: PieceBuffer,
    /// Blocks actually requested or received, ascending offset, contiguous
    /// from 0
    blocks: Vec<Block>,
}

impl Piece {
    /// Panics if `length` is zero; a zero-length piece is invalid input and
    /// is rejected by [`Metainfo`](crate::metainfo::Metainfo) upstream.
    pub fn new(index: u32, length: u32, hash: Sha1Hash) -> Self {
        assert!(length > 0, "piece length must be non-zero");
        Self {
            index,
            length,
            hash,
            buffer: PieceBuffer::Empty,
            blocks: Vec::new(),
        }
    }

    /// Check if this piece has been hash-verified
    pub fn is_verified(&self) -> bool {
        matches!(self.buffer, PieceBuffer::Verified)
    }

    /// Byte offset one past the last block's range (blocks are contiguous
    /// from 0, so this is the covered prefix length)
    fn covered(&self) -> u32 {
        self.blocks.last().map_or(0, |b| b.offset + b.length)
    }

    /// Find the next block for `peer` to request.
    ///
    /// Scans existing blocks in offset order and returns the first that is
    /// neither downloaded nor assigned to anyone. If all existing blocks are
    /// taken, extends coverage with a new block over the next uncovered
    /// range, capped at `max_size` and shrunk to fit the piece tail. Returns
    /// `None` once the piece is verified or fully covered.
    pub fn request_block(&mut self, peer: SocketAddr, max_size: u32) -> Option<BlockRequest> {
        if self.is_verified() || max_size == 0 {
            return None;
        }

        if let Some(block) = self
            .blocks
            .iter_mut()
            .find(|b| !b.downloaded && b.assignees.is_empty())
        {
            block.assignees.insert(peer);
            return Some(BlockRequest {
                piece: self.index,
                offset: block.offset,
                length: block.length,
            });
        }

        let offset = self.covered();
        if offset >= self.length {
            return None;
        }
        let length = max_size.min(self.length - offset);

        let mut assignees = HashSet::new();
        assignees.insert(peer);
        self.blocks.push(Block {
            offset,
            length,
            downloaded: false,
            assignees,
        });

        Some(BlockRequest {
            piece: self.index,
            offset,
            length,
        })
    }

    /// Add `peer` as an additional assignee of an existing undownloaded
    /// block (endgame duplication). Returns false if no such block exists
    /// or it is already downloaded or already assigned to `peer`.
    pub fn add_assignee(&mut self, offset: u32, length: u32, peer: SocketAddr) -> bool {
        match self.block_mut(offset, length) {
            Some(block) if !block.downloaded => block.assignees.insert(peer),
            _ => false,
        }
    }

    /// Find a block worth duplicating to `peer` in endgame: undownloaded,
    /// not already assigned to `peer`, and currently assigned to at least
    /// one stalled peer
    pub fn duplicate_candidate(
        &self,
        peer: SocketAddr,
        stalled: &HashSet<SocketAddr>,
    ) -> Option<BlockRequest> {
        self.blocks
            .iter()
            .find(|b| {
                !b.downloaded
                    && !b.assignees.contains(&peer)
                    && b.assignees.iter().any(|a| stalled.contains(a))
            })
            .map(|b| BlockRequest {
                piece: self.index,
                offset: b.offset,
                length: b.length,
            })
    }

    fn block_mut(&mut self, offset: u32, length: u32) -> Option<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|b| b.offset == offset && b.length == length)
    }

    /// Deliver block data received from a peer.
    ///
    /// The first delivery for a block wins: it stages the bytes, marks the
    /// block downloaded, and drains the assignee set so the caller can
    /// cancel the request on every other peer still transferring it.
    /// Later deliveries for the same block are no-ops.
    pub fn set_block_data(&mut self, offset: u32, data: &[u8]) -> BlockDelivery {
        if self.is_verified() {
            return BlockDelivery::Duplicate;
        }

        let length = self.length;
        let Some(block) = self.block_mut(offset, data.len() as u32) else {
            return BlockDelivery::Unknown;
        };
        if block.downloaded {
            return BlockDelivery::Duplicate;
        }

        block.downloaded = true;
        let cancel: Vec<SocketAddr> = block.assignees.drain().collect();

        if matches!(self.buffer, PieceBuffer::Empty) {
            self.buffer = PieceBuffer::Buffered(vec![0; length as usize]);
        }
        if let PieceBuffer::Buffered(buf) = &mut self.buffer {
            let start = offset as usize;
            buf[start..start + data.len()].copy_from_slice(data);
        }

        BlockDelivery::Stored { cancel }
    }

    /// Remove `peer` from every block's assignee set. Undownloaded blocks
    /// stay in the piece, so the next `request_block` scan hands them out
    /// first.
    pub fn release_assignee(&mut self, peer: SocketAddr) {
        for block in &mut self.blocks {
            block.assignees.remove(&peer);
        }
    }

    /// A piece is complete once its blocks tile the whole length and every
    /// one of them is downloaded
    pub fn is_complete(&self) -> bool {
        self.covered() == self.length && self.blocks.iter().all(|b| b.downloaded)
    }

    /// Compute SHA-1 over the staged bytes and compare to the expected hash.
    /// Returns false if the piece is not complete or not buffered.
    pub fn check_hash(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let PieceBuffer::Buffered(buf) = &self.buffer else {
            return false;
        };
        let mut hasher = Sha1::new();
        hasher.update(buf);
        let actual: Sha1Hash = hasher.finalize().into();
        actual == self.hash
    }

    /// Staged piece bytes, available only while buffered
    pub fn data(&self) -> Option<&[u8]> {
        match &self.buffer {
            PieceBuffer::Buffered(buf) => Some(buf),
            _ => None,
        }
    }

    /// Mark verified and release the staging buffer. The bytes must already
    /// be persisted externally; there is no read path after this.
    pub fn mark_verified(&mut self) {
        self.buffer = PieceBuffer::Verified;
        self.blocks.clear();
    }

    /// Discard all received data after a hash mismatch. The piece re-enters
    /// the requestable pool.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.buffer = PieceBuffer::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn sha1_of(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn test_request_block_covers_piece_in_order() {
        let mut piece = Piece::new(0, 32768, [0; 20]);
        let peer = addr(1000);

        let first = piece.request_block(peer, 16384).unwrap();
        assert_eq!((first.offset, first.length), (0, 16384));

        let second = piece.request_block(peer, 16384).unwrap();
        assert_eq!((second.offset, second.length), (16384, 16384));

        assert!(piece.request_block(peer, 16384).is_none());
    }

    #[test]
    fn test_last_block_shrinks_to_tail() {
        let mut piece = Piece::new(1, 10000, [0; 20]);
        let req = piece.request_block(addr(1), 16384).unwrap();
        assert_eq!((req.offset, req.length), (0, 10000));
    }

    #[test]
    fn test_fully_covered_piece_yields_none_repeatedly() {
        let mut piece = Piece::new(0, 16384, [0; 20]);
        piece.request_block(addr(1), 16384).unwrap();

        for _ in 0..3 {
            assert!(piece.request_block(addr(2), 16384).is_none());
        }
    }

    #[test]
    fn test_first_delivery_wins() {
        let mut piece = Piece::new(0, 16384, [0; 20]);
        let a = addr(1);
        let b = addr(2);

        piece.request_block(a, 16384).unwrap();
        assert!(piece.add_assignee(0, 16384, b));

        match piece.set_block_data(0, &[1u8; 16384]) {
            BlockDelivery::Stored { cancel } => {
                // delivery came via a, so b is left to cancel (a is drained
                // too, the caller filters out the delivering peer)
                assert!(cancel.contains(&a));
                assert!(cancel.contains(&b));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(piece.set_block_data(0, &[2u8; 16384]), BlockDelivery::Duplicate);
        // first payload is retained
        assert_eq!(piece.data().unwrap()[0], 1);
    }

    #[test]
    fn test_unknown_block_delivery() {
        let mut piece = Piece::new(0, 32768, [0; 20]);
        assert_eq!(piece.set_block_data(0, &[0u8; 100]), BlockDelivery::Unknown);
    }

    #[test]
    fn test_verify_and_release() {
        let content = vec![0xabu8; 20000];
        let mut piece = Piece::new(0, 20000, sha1_of(&content));
        let peer = addr(1);

        let first = piece.request_block(peer, 16384).unwrap();
        let second = piece.request_block(peer, 16384).unwrap();
        assert_eq!((second.offset, second.length), (16384, 3616));

        piece.set_block_data(first.offset, &content[..16384]);
        assert!(!piece.is_complete());
        piece.set_block_data(second.offset, &content[16384..]);
        assert!(piece.is_complete());
        assert!(piece.check_hash());

        piece.mark_verified();
        assert!(piece.is_verified());
        assert!(piece.data().is_none());

        // immutable after verification
        assert_eq!(piece.set_block_data(0, &[0u8; 16384]), BlockDelivery::Duplicate);
        assert!(piece.request_block(peer, 16384).is_none());
    }

    #[test]
    fn test_hash_mismatch_resets_piece() {
        let mut piece = Piece::new(0, 16384, [0x55; 20]);
        let peer = addr(1);
        piece.request_block(peer, 16384).unwrap();
        piece.set_block_data(0, &[0u8; 16384]);

        assert!(piece.is_complete());
        assert!(!piece.check_hash());

        piece.reset();
        assert!(!piece.is_complete());
        let req = piece.request_block(peer, 16384).unwrap();
        assert_eq!((req.offset, req.length), (0, 16384));
    }

    #[test]
    fn test_release_assignee_makes_block_requestable() {
        let mut piece = Piece::new(0, 32768, [0; 20]);
        let a = addr(1);
        let b = addr(2);

        let req = piece.request_block(a, 16384).unwrap();
        piece.release_assignee(a);

        // b gets the released block before any new coverage
        let again = piece.request_block(b, 16384).unwrap();
        assert_eq!((again.offset, again.length), (req.offset, req.length));
    }

    #[test]
    fn test_stalled_assignee_makes_block_duplicable() {
        let mut piece = Piece::new(0, 16384, [0; 20]);
        let a = addr(1);
        let b = addr(2);

        piece.request_block(a, 16384).unwrap();
        let mut stalled = HashSet::new();
        assert!(piece.duplicate_candidate(b, &stalled).is_none());

        stalled.insert(a);
        let dup = piece.duplicate_candidate(b, &stalled).unwrap();
        assert_eq!((dup.offset, dup.length), (0, 16384));
        // never duplicated back to an existing assignee
        assert!(piece.duplicate_candidate(a, &stalled).is_none());

        piece.set_block_data(0, &[0u8; 16384]);
        assert!(piece.duplicate_candidate(b, &stalled).is_none());
    }

    #[test]
    #[should_panic(expected = "piece length must be non-zero")]
    fn test_zero_length_piece_rejected() {
        Piece::new(0, 0, [0; 20]);
    }
}
