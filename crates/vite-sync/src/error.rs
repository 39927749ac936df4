//! Sync error types.

use crate::chain::ChainError;
use thiserror::Error;
use vite_network::{Cmd, NetworkError};

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Chain collaborator error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// The peer broke the protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No response within the deadline, retries exhausted.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No eligible peer for a request.
    #[error("No peer available")]
    NoPeer,

    /// Chunk failed length, hash or linkage checks.
    #[error("Chunk validation failed: {0}")]
    ChunkValidation(String),

    /// A peer with the same identity is already registered.
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    /// No handler registered for an inbound command.
    #[error("No handler for command {0}")]
    MissingHandler(Cmd),

    /// A command was registered twice.
    #[error("Handler for command {0} registered twice")]
    DuplicateHandler(Cmd),

    /// The serving peer disconnected and no alternative was available.
    #[error("Peer lost: {0}")]
    PeerLost(String),

    /// An identical request is already outstanding.
    #[error("Request already pending: {0}")]
    AlreadyPending(String),

    /// A bulk sync covers the requested data.
    #[error("Sync in progress")]
    SyncInProgress,

    /// The node is stopping.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the error should terminate the connection it came from.
    pub fn is_fatal_for_peer(&self) -> bool {
        match self {
            SyncError::ProtocolViolation(_)
            | SyncError::MissingHandler(_)
            | SyncError::DuplicatePeer(_)
            | SyncError::Cancelled => true,
            SyncError::Network(e) => {
                e.is_protocol_violation()
                    || matches!(e, NetworkError::ConnectionClosed | NetworkError::Io(_))
            }
            _ => false,
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
