//! Startup integrity checking
//!
//! Hashing a whole torrent is CPU-bound, so it runs on the blocking thread
//! pool instead of the session driver. The worker only reads storage and
//! reports one [`CheckResult`] per piece over a channel; the driver folds
//! the results into live session state itself.

use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::metainfo::{Metainfo, Sha1Hash};
use crate::storage::Storage;

/// Verdict for one piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub index: u32,
    pub valid: bool,
}

/// Hash every piece against the metadata on a blocking worker.
///
/// A piece that cannot be read counts as invalid. The channel closes once
/// every piece has been reported.
pub fn spawn_check(metainfo: Metainfo, storage: Arc<dyn Storage>) -> mpsc::Receiver<CheckResult> {
    let (tx, rx) = mpsc::channel(64);

    tokio::task::spawn_blocking(move || {
        for index in 0..metainfo.num_pieces() {
            let valid = check_piece(&metainfo, storage.as_ref(), index);
            if tx
                .blocking_send(CheckResult {
                    index: index as u32,
                    valid,
                })
                .is_err()
            {
                // receiver dropped, session is gone
                return;
            }
        }
    });

    rx
}

fn check_piece(metainfo: &Metainfo, storage: &dyn Storage, index: usize) -> bool {
    let (Some(offset), Some(length), Some(expected)) = (
        metainfo.piece_offset(index),
        metainfo.piece_len(index),
        metainfo.piece_hash(index),
    ) else {
        return false;
    };

    let data = match storage.read_range(offset, length as usize) {
        Ok(data) => data,
        Err(err) => {
            tracing::debug!(index, error = %err, "piece unreadable during check");
            return false;
        }
    };

    let mut hasher = Sha1::new();
    hasher.update(&data);
    let actual: Sha1Hash = hasher.finalize().into();
    actual == *expected
}
