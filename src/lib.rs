//! peerflow - a BitTorrent peer wire protocol engine
//!
//! The crate implements the transfer core of a BitTorrent client: peer
//! connection handshaking and the wire-message codec, the piece/block data
//! model with SHA-1 verification, block assignment with endgame
//! duplication, and a process-wide rate-limited I/O scheduler.
//!
//! Metadata decoding, tracker announces, and peer discovery are external
//! collaborators: callers hand the session a decoded [`Metainfo`], a
//! [`Storage`] backend, and tracker-supplied peer addresses, and drive it
//! through a [`SessionHandle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerflow::{Metainfo, RateController, SessionConfig, TorrentSession};
//! use peerflow::storage::FileStorage;
//!
//! # async fn run(metainfo: Metainfo) -> peerflow::Result<()> {
//! let storage = Arc::new(FileStorage::create("content.bin", metainfo.total_length)?);
//! let rate = Arc::new(RateController::new(0, 0));
//! tokio::spawn(rate.clone().run());
//!
//! let session = TorrentSession::spawn(metainfo, storage, SessionConfig::default(), rate)?;
//! session.start().await?;
//! session.add_peer("203.0.113.9:6881".parse().map_err(|_| {
//!     peerflow::EngineError::invalid_input("addr", "bad address")
//! })?).await?;
//! # Ok(())
//! # }
//! ```

pub mod check;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod rate;
pub mod session;
pub mod storage;
pub mod wire;

pub use config::SessionConfig;
pub use error::{EngineError, Result};
pub use metainfo::Metainfo;
pub use rate::RateController;
pub use peer::PeerState;
pub use session::{PeerInfo, SessionEvent, SessionHandle, SessionStats, TorrentSession};
pub use storage::{FileStorage, MemoryStorage, Storage};
