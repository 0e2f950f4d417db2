//! Typed error hierarchy for peerflow
//!
//! Every error type carries context about what went wrong and whether a
//! retry is worthwhile.

use thiserror::Error;

/// Main error type for the transfer engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connection, timeout, reset)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Storage errors while reading or writing piece data
    #[error("Storage error: {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    /// Protocol-level errors (handshake, wire framing, message semantics)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Session is shutting down
    #[error("Session is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset by peer
    ConnectionReset,
    /// Connection or handshake timeout
    Timeout,
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Requested range lies outside the torrent's total length
    OutOfRange,
    /// File/backing store not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Malformed or mismatched handshake
    Handshake,
    /// Peer wire protocol violation (bad message, out-of-range request)
    PeerProtocol,
    /// Declared message length above the accepted ceiling
    OversizedMessage,
    /// Piece hash verification failed
    HashMismatch,
    /// Invalid torrent metadata
    InvalidMetainfo,
}

impl EngineError {
    /// Check if this error is retryable (reconnect may succeed)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionReset
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Storage {
            kind,
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_retryable() {
        let err = EngineError::network(NetworkErrorKind::Timeout, "peer timed out");
        assert!(err.is_retryable());

        let err = EngineError::network(NetworkErrorKind::ConnectionRefused, "refused");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_protocol_errors_not_retryable() {
        let err = EngineError::protocol(ProtocolErrorKind::PeerProtocol, "unknown message id");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_io_retryable() {
        let err = EngineError::storage(StorageErrorKind::Io, "transient read failure");
        assert!(err.is_retryable());
        let err = EngineError::storage(StorageErrorKind::OutOfRange, "bad range");
        assert!(!err.is_retryable());
    }
}
