//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Command code outside the known command set.
    #[error("Unknown command code: {0}")]
    UnknownCommand(u8),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame checksum did not match the payload.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Network magic mismatch.
    #[error("Network magic mismatch")]
    MagicMismatch,

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Command set version mismatch.
    #[error("Command set mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u32, expected: u32 },

    /// A peer with the same identity is already registered.
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    /// Outbound queue of a peer is full; the message was discarded.
    #[error("Send queue full")]
    QueueFull,

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether the error means the remote side broke the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            NetworkError::InvalidMessage(_)
                | NetworkError::UnknownCommand(_)
                | NetworkError::MessageTooLarge { .. }
                | NetworkError::ChecksumMismatch
                | NetworkError::MagicMismatch
                | NetworkError::HandshakeFailed(_)
                | NetworkError::VersionMismatch { .. }
        )
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
