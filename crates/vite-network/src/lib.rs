//! # vite-network
//!
//! Wire layer of the ledger synchronization protocol.
//!
//! This crate provides:
//! - Ledger types carried between nodes
//! - Command set, message envelope and payload encoding
//! - Framed codec for the control channel
//! - Connection handshake
//! - Connected peers, the peer set and event feeds

mod codec;
mod error;
mod feed;
mod handshake;
mod message;
mod peer;
mod types;

pub use codec::{MessageCodec, HEADER_SIZE};
pub use error::{NetworkError, NetworkResult};
pub use feed::{Feed, Subscription};
pub use handshake::{handshake, HandshakeMsg};
pub use message::{BlocksRequest, Cmd, ExceptionCode, Message, Payload, MAX_LIST_LEN};
pub use peer::{CmdStats, Peer, PeerEvent, PeerId, PeerInfo, PeerSet, PeerState};
pub use types::{
    AccountBlock, Address, BlockType, Chunk, ChunkRange, FileMeta, Hash, HashHeight,
    SnapshotBlock, ADDRESS_LEN, HASH_LEN,
};

/// Default control channel port.
pub const DEFAULT_PORT: u16 = 8484;

/// Protocol magic bytes for mainnet.
pub const MAINNET_MAGIC: [u8; 4] = [0x56, 0x49, 0x54, 0x45];

/// Protocol magic bytes for testnet.
pub const TESTNET_MAGIC: [u8; 4] = [0x56, 0x49, 0x54, 0x54];

/// Maximum message size.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MB

/// Command set version exchanged in the handshake.
pub const CMD_SET: u32 = 2;
