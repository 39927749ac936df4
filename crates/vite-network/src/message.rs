//! Wire command set, message envelope and payload encoding.

use crate::types::{Address, HashHeight};
use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum number of items accepted in a single list payload.
pub const MAX_LIST_LEN: u64 = 100_000;

/// VLQ encode an unsigned integer.
pub(crate) fn put_vlq(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// VLQ decode an unsigned integer.
pub(crate) fn get_vlq(buf: &mut Bytes) -> NetworkResult<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(NetworkError::InvalidMessage("Truncated VLQ".into()));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }
        shift += 7;

        if shift > 63 {
            return Err(NetworkError::InvalidMessage("VLQ overflow".into()));
        }
    }
}

pub(crate) fn ensure(buf: &Bytes, len: usize, what: &str) -> NetworkResult<()> {
    if buf.remaining() < len {
        return Err(NetworkError::InvalidMessage(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes, what: &str) -> NetworkResult<u8> {
    ensure(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes, what: &str) -> NetworkResult<u16> {
    ensure(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut Bytes, what: &str) -> NetworkResult<u32> {
    ensure(buf, 4, what)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes, what: &str) -> NetworkResult<u64> {
    ensure(buf, 8, what)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_array<const N: usize>(buf: &mut Bytes, what: &str) -> NetworkResult<[u8; N]> {
    ensure(buf, N, what)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn put_var_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_vlq(buf, data.len() as u64);
    buf.put_slice(data);
}

pub(crate) fn get_var_bytes(buf: &mut Bytes, what: &str) -> NetworkResult<Bytes> {
    let len = get_vlq(buf)? as usize;
    ensure(buf, len, what)?;
    Ok(buf.split_to(len))
}

/// Binary payload encoding used on the control channel and in chunk files.
///
/// Encoding must be deterministic: the same value always yields the same bytes.
pub trait Payload: Sized {
    /// Append the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decode a value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> NetworkResult<Self>;

    /// Encode into a standalone buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a complete buffer, rejecting trailing garbage.
    fn from_bytes(mut bytes: Bytes) -> NetworkResult<Self> {
        let value = Self::decode(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(NetworkError::InvalidMessage(format!(
                "{} trailing bytes",
                bytes.remaining()
            )));
        }
        Ok(value)
    }
}

impl Payload for () {
    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(())
    }
}

impl<T: Payload> Payload for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        put_vlq(buf, self.len() as u64);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let count = get_vlq(buf)?;
        if count > MAX_LIST_LEN {
            return Err(NetworkError::InvalidMessage(format!(
                "List too long: {} items",
                count
            )));
        }
        // Every item takes at least one byte, so remaining() bounds the allocation.
        let mut items = Vec::with_capacity((count as usize).min(buf.remaining()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

/// Command codes of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Cmd {
    /// Handshake, exchanged once per connection.
    Handshake = 0,
    /// Periodic head announcement.
    Status = 1,
    /// Ask which chunk files cover a height range.
    GetSubLedger = 2,
    /// Ask for snapshot blocks.
    GetSnapshotBlocks = 3,
    /// Ask for account blocks.
    GetAccountBlocks = 4,
    /// Ask for a chunk over the control channel.
    GetChunk = 5,
    /// Chunk content.
    SubLedger = 6,
    /// Chunk files available from the file server.
    FileList = 7,
    /// Snapshot blocks response.
    SnapshotBlocks = 8,
    /// Account blocks response.
    AccountBlocks = 9,
    /// Newly produced snapshot block.
    NewSnapshotBlock = 10,
    /// Newly produced account block.
    NewAccountBlock = 11,
    /// Request could not be served.
    Exception = 127,
}

impl Cmd {
    /// Every command in the set.
    pub const ALL: [Cmd; 13] = [
        Cmd::Handshake,
        Cmd::Status,
        Cmd::GetSubLedger,
        Cmd::GetSnapshotBlocks,
        Cmd::GetAccountBlocks,
        Cmd::GetChunk,
        Cmd::SubLedger,
        Cmd::FileList,
        Cmd::SnapshotBlocks,
        Cmd::AccountBlocks,
        Cmd::NewSnapshotBlock,
        Cmd::NewAccountBlock,
        Cmd::Exception,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Cmd::Handshake => "Handshake",
            Cmd::Status => "Status",
            Cmd::GetSubLedger => "GetSubLedger",
            Cmd::GetSnapshotBlocks => "GetSnapshotBlocks",
            Cmd::GetAccountBlocks => "GetAccountBlocks",
            Cmd::GetChunk => "GetChunk",
            Cmd::SubLedger => "SubLedger",
            Cmd::FileList => "FileList",
            Cmd::SnapshotBlocks => "SnapshotBlocks",
            Cmd::AccountBlocks => "AccountBlocks",
            Cmd::NewSnapshotBlock => "NewSnapshotBlock",
            Cmd::NewAccountBlock => "NewAccountBlock",
            Cmd::Exception => "Exception",
        }
    }
}

impl TryFrom<u8> for Cmd {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Cmd::ALL
            .iter()
            .copied()
            .find(|cmd| *cmd as u8 == value)
            .ok_or(NetworkError::UnknownCommand(value))
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reason carried by an `Exception` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// The requested data is not available.
    Missing = 2,
    /// Anything else.
    Other = 255,
}

impl From<u8> for ExceptionCode {
    fn from(value: u8) -> Self {
        match value {
            2 => ExceptionCode::Missing,
            _ => ExceptionCode::Other,
        }
    }
}

impl Payload for ExceptionCode {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(ExceptionCode::from(get_u8(buf, "exception code")?))
    }
}

/// Request for a run of snapshot or account blocks.
///
/// `address == None` addresses the snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksRequest {
    /// Account chain, or `None` for the snapshot chain.
    pub address: Option<Address>,
    /// Starting block.
    pub from: HashHeight,
    /// Number of blocks.
    pub count: u64,
    /// Walk towards higher heights.
    pub forward: bool,
}

impl BlocksRequest {
    /// Request a single block.
    pub fn single(address: Option<Address>, from: HashHeight) -> Self {
        Self {
            address,
            from,
            count: 1,
            forward: true,
        }
    }
}

impl Payload for BlocksRequest {
    fn encode(&self, buf: &mut BytesMut) {
        match &self.address {
            Some(address) => {
                buf.put_u8(1);
                address.encode(buf);
            }
            None => buf.put_u8(0),
        }
        self.from.encode(buf);
        put_vlq(buf, self.count);
        buf.put_u8(self.forward as u8);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let address = match get_u8(buf, "address flag")? {
            0 => None,
            1 => Some(Address::decode(buf)?),
            other => {
                return Err(NetworkError::InvalidMessage(format!(
                    "Bad address flag: {}",
                    other
                )))
            }
        };
        let from = HashHeight::decode(buf)?;
        let count = get_vlq(buf)?;
        let forward = get_u8(buf, "direction")? != 0;
        Ok(Self {
            address,
            from,
            count,
            forward,
        })
    }
}

/// Message envelope.
///
/// `id == 0` marks an unsolicited push; any other value correlates a
/// response with its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command code.
    pub cmd: Cmd,
    /// Request id.
    pub id: u64,
    /// Encoded payload.
    pub payload: Bytes,
}

impl Message {
    /// Build a message with an encoded payload.
    pub fn new(cmd: Cmd, id: u64, payload: &impl Payload) -> Self {
        Self {
            cmd,
            id,
            payload: payload.to_bytes(),
        }
    }

    /// Build an unsolicited push.
    pub fn push(cmd: Cmd, payload: &impl Payload) -> Self {
        Self::new(cmd, 0, payload)
    }

    /// Build an exception response for request `id`.
    pub fn exception(id: u64, code: ExceptionCode) -> Self {
        Self::new(Cmd::Exception, id, &code)
    }

    /// Whether this message is an unsolicited push.
    pub fn is_push(&self) -> bool {
        self.id == 0
    }

    /// Decode the payload.
    pub fn decode<T: Payload>(&self) -> NetworkResult<T> {
        T::from_bytes(self.payload.clone())
    }
}
