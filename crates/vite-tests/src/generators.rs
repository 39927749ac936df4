//! Test data generators.
//!
//! Chains are deterministic in their seed: two chains built from the same
//! seed share every block, chains from different seeds share nothing,
//! genesis included.

use bytes::Bytes;
use vite_network::{
    AccountBlock, Address, BlockType, Chunk, ChunkRange, Hash, HandshakeMsg, SnapshotBlock,
    ADDRESS_LEN, CMD_SET,
};

/// Deterministic account address.
pub fn test_address(seed: u8) -> Address {
    let mut bytes = [0u8; ADDRESS_LEN];
    bytes[0] = seed;
    bytes[ADDRESS_LEN - 1] = seed.wrapping_mul(7);
    Address(bytes)
}

/// Snapshot block at `height` on top of `prev_hash`.
pub fn snapshot_block(seed: u8, height: u64, prev_hash: Hash) -> SnapshotBlock {
    let mut data = vec![0x5A, seed];
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(prev_hash.as_bytes());
    SnapshotBlock {
        hash: Hash::digest(&data),
        prev_hash,
        height,
        timestamp: 1_600_000_000 + height,
        account_heads: Vec::new(),
        payload: Bytes::new(),
    }
}

/// Linked snapshot chain covering heights `0..=height`.
pub fn snapshot_chain(seed: u8, height: u64) -> Vec<SnapshotBlock> {
    let mut blocks = Vec::with_capacity(height as usize + 1);
    let mut prev = Hash::default();
    for h in 0..=height {
        let block = snapshot_block(seed, h, prev);
        prev = block.hash;
        blocks.push(block);
    }
    blocks
}

/// Block following `prev` on the same chain.
pub fn next_snapshot_block(seed: u8, prev: &SnapshotBlock) -> SnapshotBlock {
    snapshot_block(seed, prev.height + 1, prev.hash)
}

fn account_block(
    address: Address,
    height: u64,
    prev_hash: Hash,
    block_type: BlockType,
    from_block_hash: Option<Hash>,
    snapshot_hash: Hash,
) -> AccountBlock {
    let mut data = vec![0xAC];
    data.extend_from_slice(&address.0);
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(prev_hash.as_bytes());
    data.push(block_type as u8);
    if let Some(from) = &from_block_hash {
        data.extend_from_slice(from.as_bytes());
    }
    AccountBlock {
        hash: Hash::digest(&data),
        prev_hash,
        height,
        address,
        block_type,
        from_block_hash,
        snapshot_hash,
        payload: Bytes::from_static(b"tx"),
    }
}

/// Send block opening or extending an account chain.
pub fn send_block(address: Address, height: u64, prev_hash: Hash, snapshot_hash: Hash) -> AccountBlock {
    account_block(address, height, prev_hash, BlockType::SendCall, None, snapshot_hash)
}

/// Receive block consuming `from`.
pub fn receive_block(
    address: Address,
    height: u64,
    prev_hash: Hash,
    from: Hash,
    snapshot_hash: Hash,
) -> AccountBlock {
    account_block(address, height, prev_hash, BlockType::Receive, Some(from), snapshot_hash)
}

/// Chunk of `blocks` covering `range`.
pub fn chunk_of(blocks: &[SnapshotBlock], range: ChunkRange) -> Chunk {
    Chunk {
        range,
        snapshot_blocks: blocks[range.start as usize..range.end as usize].to_vec(),
        account_blocks: Vec::new(),
    }
}

/// Handshake announcing the head of `blocks`.
pub fn handshake_for(blocks: &[SnapshotBlock], file_port: u16) -> HandshakeMsg {
    let head = blocks.last().map(|b| (b.hash, b.height)).unwrap_or_default();
    HandshakeMsg {
        version: CMD_SET,
        height: head.1,
        port: file_port,
        head: head.0,
        genesis: blocks.first().map(|b| b.hash).unwrap_or_default(),
    }
}
