//! Ledger data carried by the sync protocol.
//!
//! Block hashes travel on the wire and are never recomputed here; chunk file
//! digests are computed with Blake2b-256.

use crate::message::{get_array, get_u64, get_u8, get_var_bytes, get_vlq, put_var_bytes, put_vlq};
use crate::message::Payload;
use crate::{NetworkError, NetworkResult};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, Serializer};
use std::fmt;

/// Length of a block hash in bytes.
pub const HASH_LEN: usize = 32;

/// Length of an account address in bytes.
pub const ADDRESS_LEN: usize = 21;

/// 32-byte block or content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Blake2b-256 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let digest = Blake2b::<U32>::digest(data);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl Payload for Hash {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self(get_array(buf, "hash")?))
    }
}

/// Account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vite_{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0[..6]))
    }
}

impl Payload for Address {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self(get_array(buf, "address")?))
    }
}

/// A block reference: hash plus height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct HashHeight {
    pub hash: Hash,
    pub height: u64,
}

impl HashHeight {
    pub fn new(hash: Hash, height: u64) -> Self {
        Self { hash, height }
    }
}

impl Payload for HashHeight {
    fn encode(&self, buf: &mut BytesMut) {
        self.hash.encode(buf);
        buf.put_u64(self.height);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let hash = Hash::decode(buf)?;
        let height = get_u64(buf, "height")?;
        Ok(Self { hash, height })
    }
}

/// Account block kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    SendCreate = 1,
    SendCall = 2,
    SendReward = 3,
    Receive = 4,
    ReceiveError = 5,
}

impl BlockType {
    /// Receive blocks reference the send block they consume.
    pub fn is_receive(self) -> bool {
        matches!(self, BlockType::Receive | BlockType::ReceiveError)
    }
}

impl TryFrom<u8> for BlockType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BlockType::SendCreate),
            2 => Ok(BlockType::SendCall),
            3 => Ok(BlockType::SendReward),
            4 => Ok(BlockType::Receive),
            5 => Ok(BlockType::ReceiveError),
            _ => Err(NetworkError::InvalidMessage(format!(
                "Unknown block type: {}",
                value
            ))),
        }
    }
}

/// Block of the global snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlock {
    pub hash: Hash,
    pub prev_hash: Hash,
    pub height: u64,
    /// Seconds since epoch.
    pub timestamp: u64,
    /// Account chain heads confirmed by this snapshot.
    pub account_heads: Vec<(Address, HashHeight)>,
    pub payload: Bytes,
}

impl SnapshotBlock {
    pub fn hash_height(&self) -> HashHeight {
        HashHeight::new(self.hash, self.height)
    }
}

impl Payload for SnapshotBlock {
    fn encode(&self, buf: &mut BytesMut) {
        self.hash.encode(buf);
        self.prev_hash.encode(buf);
        buf.put_u64(self.height);
        buf.put_u64(self.timestamp);
        put_vlq(buf, self.account_heads.len() as u64);
        for (address, head) in &self.account_heads {
            address.encode(buf);
            head.encode(buf);
        }
        put_var_bytes(buf, &self.payload);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let hash = Hash::decode(buf)?;
        let prev_hash = Hash::decode(buf)?;
        let height = get_u64(buf, "snapshot height")?;
        let timestamp = get_u64(buf, "timestamp")?;
        let heads = get_vlq(buf)? as usize;
        let mut account_heads = Vec::with_capacity(heads.min(buf.len() / ADDRESS_LEN));
        for _ in 0..heads {
            let address = Address::decode(buf)?;
            let head = HashHeight::decode(buf)?;
            account_heads.push((address, head));
        }
        let payload = get_var_bytes(buf, "snapshot payload")?;
        Ok(Self {
            hash,
            prev_hash,
            height,
            timestamp,
            account_heads,
            payload,
        })
    }
}

/// Block of a single account chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBlock {
    pub hash: Hash,
    pub prev_hash: Hash,
    pub height: u64,
    pub address: Address,
    pub block_type: BlockType,
    /// Send block consumed by a receive block.
    pub from_block_hash: Option<Hash>,
    /// Snapshot block this block was produced against.
    pub snapshot_hash: Hash,
    pub payload: Bytes,
}

impl AccountBlock {
    pub fn hash_height(&self) -> HashHeight {
        HashHeight::new(self.hash, self.height)
    }
}

impl Payload for AccountBlock {
    fn encode(&self, buf: &mut BytesMut) {
        self.hash.encode(buf);
        self.prev_hash.encode(buf);
        buf.put_u64(self.height);
        self.address.encode(buf);
        buf.put_u8(self.block_type as u8);
        match &self.from_block_hash {
            Some(hash) => {
                buf.put_u8(1);
                hash.encode(buf);
            }
            None => buf.put_u8(0),
        }
        self.snapshot_hash.encode(buf);
        put_var_bytes(buf, &self.payload);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let hash = Hash::decode(buf)?;
        let prev_hash = Hash::decode(buf)?;
        let height = get_u64(buf, "account height")?;
        let address = Address::decode(buf)?;
        let block_type = BlockType::try_from(get_u8(buf, "block type")?)?;
        let from_block_hash = match get_u8(buf, "from flag")? {
            0 => None,
            _ => Some(Hash::decode(buf)?),
        };
        let snapshot_hash = Hash::decode(buf)?;
        let payload = get_var_bytes(buf, "account payload")?;
        Ok(Self {
            hash,
            prev_hash,
            height,
            address,
            block_type,
            from_block_hash,
            snapshot_hash,
            payload,
        })
    }
}

/// Half-open snapshot height range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of heights covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Highest height inside the range.
    pub fn last(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.end - 1)
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.start && height < self.end
    }

    /// Partition `[start, end)` into consecutive ranges of at most `size` heights.
    pub fn split(start: u64, end: u64, size: u64) -> Vec<ChunkRange> {
        let size = size.max(1);
        let mut ranges = Vec::new();
        let mut from = start;
        while from < end {
            let to = from.saturating_add(size).min(end);
            ranges.push(ChunkRange::new(from, to));
            from = to;
        }
        ranges
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

impl Payload for ChunkRange {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.start);
        buf.put_u64(self.end);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let start = get_u64(buf, "range start")?;
        let end = get_u64(buf, "range end")?;
        Ok(Self { start, end })
    }
}

/// Contiguous snapshot range plus the account blocks it confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub range: ChunkRange,
    pub snapshot_blocks: Vec<SnapshotBlock>,
    pub account_blocks: Vec<AccountBlock>,
}

impl Chunk {
    /// Highest snapshot block in the chunk.
    pub fn head(&self) -> Option<HashHeight> {
        self.snapshot_blocks.last().map(SnapshotBlock::hash_height)
    }
}

impl Payload for Chunk {
    fn encode(&self, buf: &mut BytesMut) {
        self.range.encode(buf);
        self.snapshot_blocks.encode(buf);
        self.account_blocks.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let range = ChunkRange::decode(buf)?;
        let snapshot_blocks = Vec::<SnapshotBlock>::decode(buf)?;
        let account_blocks = Vec::<AccountBlock>::decode(buf)?;
        Ok(Self {
            range,
            snapshot_blocks,
            account_blocks,
        })
    }
}

/// Description of a chunk file offered by a peer's file server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    pub range: ChunkRange,
    /// Exact size of the serialized file.
    pub size: u64,
    /// Blake2b-256 of the serialized file.
    pub hash: Hash,
}

impl Payload for FileMeta {
    fn encode(&self, buf: &mut BytesMut) {
        self.range.encode(buf);
        buf.put_u64(self.size);
        self.hash.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let range = ChunkRange::decode(buf)?;
        let size = get_u64(buf, "file size")?;
        let hash = Hash::decode(buf)?;
        Ok(Self { range, size, hash })
    }
}
