//! # vite-sync
//!
//! Ledger synchronization core.
//!
//! This crate provides:
//! - Request/response correlation with retries across peers
//! - Deduplicated gossip broadcast and reception
//! - Targeted fetching of single missing blocks
//! - Chunked bulk sync with a side-channel file transfer
//! - The `Net` service wiring it all to peer connections

mod broadcast;
mod chain;
mod config;
mod error;
mod fetch;
mod file;
mod filter;
mod handler;
mod net;
mod pool;
mod receiver;
mod sync;

pub use broadcast::Broadcaster;
pub use chain::{Chain, ChainError, ChainResult, Verifier};
pub use config::NetConfig;
pub use error::{SyncError, SyncResult};
pub use fetch::{FetchTarget, Fetcher};
pub use file::{
    ChunkFile, ChunkFiles, ClientCodec, FileClient, FileRequest, FileResponse, FileServer,
    FileStatus, ServerCodec,
};
pub use filter::DedupFilter;
pub use handler::{
    Disposition, GossipHandler, HandlerRegistry, MsgHandler, QueryHandler, ResponseHandler,
    StatusHandler,
};
pub use net::{Net, NodeInfo};
pub use pool::{PoolConfig, PoolStats, RequestKey, RequestKind, RequestPool, Response};
pub use receiver::{Receiver, ReceiverConfig, ReceiverStats};
pub use sync::{check_chunk, SyncState, SyncStatus, Syncer};
