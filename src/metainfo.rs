//! Torrent metadata
//!
//! Read-only metadata the engine consumes at session construction: info-hash,
//! piece geometry, and per-piece SHA-1 hashes. Decoding the metadata
//! serialization format is an external collaborator's job; this type accepts
//! the already-decoded values and validates their geometry.

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Validated torrent metadata
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the metadata info section, identifying the torrent
    pub info_hash: Sha1Hash,
    /// Nominal piece length in bytes (all pieces except possibly the last)
    pub piece_length: u64,
    /// Total content length in bytes
    pub total_length: u64,
    /// Per-piece SHA-1 hashes, in piece-index order
    piece_hashes: Vec<Sha1Hash>,
}

impl Metainfo {
    /// Build metadata from decoded values, validating piece geometry.
    ///
    /// The hash count must match the piece count implied by the lengths, and
    /// no piece may be empty (a zero piece length or zero total length is
    /// rejected).
    pub fn new(
        info_hash: Sha1Hash,
        piece_length: u64,
        total_length: u64,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidMetainfo,
                "piece length must be non-zero",
            ));
        }
        if total_length == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidMetainfo,
                "total length must be non-zero",
            ));
        }

        let expected_pieces = total_length.div_ceil(piece_length) as usize;
        if piece_hashes.len() != expected_pieces {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidMetainfo,
                format!(
                    "hash count {} does not match piece count {}",
                    piece_hashes.len(),
                    expected_pieces
                ),
            ));
        }

        Ok(Self {
            info_hash,
            piece_length,
            total_length,
            piece_hashes,
        })
    }

    /// Number of pieces
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// SHA-1 hash for a piece
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.piece_hashes.get(index)
    }

    /// Length of a piece in bytes.
    ///
    /// The last piece is `total_length mod piece_length`, or the nominal
    /// length if that remainder is zero.
    pub fn piece_len(&self, index: usize) -> Option<u64> {
        if index >= self.num_pieces() {
            return None;
        }
        if index == self.num_pieces() - 1 {
            let remainder = self.total_length % self.piece_length;
            if remainder == 0 {
                Some(self.piece_length)
            } else {
                Some(remainder)
            }
        } else {
            Some(self.piece_length)
        }
    }

    /// Byte offset of a piece within the logical content concatenation
    pub fn piece_offset(&self, index: usize) -> Option<u64> {
        if index >= self.num_pieces() {
            return None;
        }
        Some(index as u64 * self.piece_length)
    }

    /// Info hash as a lowercase hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Bitfield size in bytes (`ceil(num_pieces / 8)`)
    pub fn bitfield_len(&self) -> usize {
        self.num_pieces().div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(piece_length: u64, total_length: u64) -> Metainfo {
        let pieces = total_length.div_ceil(piece_length) as usize;
        Metainfo::new(
            [0xab; 20],
            piece_length,
            total_length,
            vec![[0u8; 20]; pieces],
        )
        .unwrap()
    }

    #[test]
    fn test_last_piece_length() {
        let m = meta(32768, 42768);
        assert_eq!(m.num_pieces(), 2);
        assert_eq!(m.piece_len(0), Some(32768));
        assert_eq!(m.piece_len(1), Some(10000));
        assert_eq!(m.piece_len(2), None);
    }

    #[test]
    fn test_even_division_keeps_nominal_length() {
        let m = meta(16384, 49152);
        assert_eq!(m.num_pieces(), 3);
        assert_eq!(m.piece_len(2), Some(16384));
    }

    #[test]
    fn test_zero_piece_length_rejected() {
        assert!(Metainfo::new([0; 20], 0, 100, vec![]).is_err());
        assert!(Metainfo::new([0; 20], 100, 0, vec![]).is_err());
    }

    #[test]
    fn test_hash_count_mismatch_rejected() {
        let result = Metainfo::new([0; 20], 32768, 42768, vec![[0u8; 20]; 3]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bitfield_len() {
        let m = meta(16384, 16384 * 9);
        assert_eq!(m.num_pieces(), 9);
        assert_eq!(m.bitfield_len(), 2);
    }
}
