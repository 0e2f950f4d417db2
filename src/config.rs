//! Session configuration
//!
//! Tuning knobs for the peer wire protocol engine. Durations are stored in
//! integer milliseconds/seconds so the config serializes cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Configuration for one torrent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum outstanding block requests per peer while unchoked
    pub pipeline_depth: usize,

    /// Block request size in bytes (protocol-standard 16 KiB)
    pub block_size: u32,

    /// Handshake timeout in seconds. Aborts the handshake attempt without
    /// declaring a protocol error.
    pub handshake_timeout_secs: u64,

    /// Reply timeout in seconds. Flags the connection as stalled, making
    /// its outstanding blocks eligible for endgame duplication.
    pub request_timeout_secs: u64,

    /// Pacing tick interval in milliseconds. Controls how frequently each
    /// connection declares interest, unchokes, and pulls block assignments.
    pub tick_interval_ms: u64,

    /// Delay before re-dialing a disconnected peer, in seconds. Only
    /// connections we initiated are re-dialed.
    pub reconnect_delay_secs: u64,

    /// Timeout for the initial TCP connect, in seconds.
    pub connect_timeout_secs: u64,

    /// Verify existing storage contents on start before any peer traffic.
    pub verify_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 5,
            block_size: 16384,
            handshake_timeout_secs: 20,
            request_timeout_secs: 10,
            tick_interval_ms: 100,
            reconnect_delay_secs: 15,
            connect_timeout_secs: 10,
            verify_on_start: false,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(EngineError::invalid_input(
                "pipeline_depth",
                "must be at least 1",
            ));
        }
        if self.block_size == 0 || self.block_size > crate::wire::MAX_BLOCK_SIZE {
            return Err(EngineError::invalid_input(
                "block_size",
                format!(
                    "must be between 1 and {} bytes",
                    crate::wire::MAX_BLOCK_SIZE
                ),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(EngineError::invalid_input(
                "tick_interval_ms",
                "must be non-zero",
            ));
        }
        Ok(())
    }

    /// Handshake timeout as a [`Duration`]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reply timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Pacing tick interval as a [`Duration`]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Reconnect delay as a [`Duration`]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// TCP connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Generate an Azureus-style peer id (`-PF0001-` plus 12 random bytes)
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-PF0001-");
    for byte in &mut peer_id[8..] {
        *byte = rand::random();
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline_depth, 5);
        assert_eq!(config.block_size, 16384);
    }

    #[test]
    fn test_zero_pipeline_depth_rejected() {
        let config = SessionConfig {
            pipeline_depth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_id_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[0..8], b"-PF0001-");
    }
}
