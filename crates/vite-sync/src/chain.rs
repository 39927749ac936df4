//! Collaborator interfaces to the ledger store and block verifier.
//!
//! Both are internally synchronized; the sync core calls them from any task
//! and never holds its own locks across these calls.

use thiserror::Error;
use vite_network::{AccountBlock, BlocksRequest, Chunk, ChunkRange, Hash, SnapshotBlock};

/// Errors reported by chain collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A referenced block is not in the store.
    #[error("Missing block: {0}")]
    Missing(String),

    /// The block does not extend the local chain.
    #[error("Does not connect: {0}")]
    Disconnected(String),

    /// Verification rejected the data.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Storage failure.
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Ledger storage consumed by the sync core.
pub trait Chain: Send + Sync + 'static {
    /// Current snapshot head.
    fn latest_snapshot_block(&self) -> SnapshotBlock;

    /// Genesis snapshot block.
    fn genesis_snapshot_block(&self) -> SnapshotBlock;

    /// Apply a chunk. Heights already applied are skipped.
    fn insert_chunk(&self, chunk: &Chunk) -> ChainResult<()>;

    /// Whether a snapshot or account block is stored.
    fn has_block(&self, hash: &Hash) -> bool;

    /// Insert a gossiped snapshot block. Returns `false` if it was already stored.
    fn insert_snapshot_block(&self, block: &SnapshotBlock) -> ChainResult<bool>;

    /// Insert a gossiped account block. Returns `false` if it was already stored.
    fn insert_account_block(&self, block: &AccountBlock) -> ChainResult<bool>;

    /// Snapshot blocks for a serving request.
    fn snapshot_blocks(&self, req: &BlocksRequest) -> ChainResult<Vec<SnapshotBlock>>;

    /// Account blocks for a serving request. Without an address the block is
    /// looked up by hash alone.
    fn account_blocks(&self, req: &BlocksRequest) -> ChainResult<Vec<AccountBlock>>;

    /// Content of a full height range, or `None` if any height is missing.
    fn chunk(&self, range: ChunkRange) -> ChainResult<Option<Chunk>>;
}

/// Block verification consumed by the sync core.
pub trait Verifier: Send + Sync + 'static {
    fn verify_snapshot_block(&self, block: &SnapshotBlock) -> ChainResult<()>;

    fn verify_account_block(&self, block: &AccountBlock) -> ChainResult<()>;

    fn verify_chunk(&self, chunk: &Chunk) -> ChainResult<()>;
}
