//! Frame codec for the control channel.
//!
//! Every message is framed as:
//!
//! ```text
//! +----------+-------+------------+----------+----------+
//! |  Magic   |  Cmd  | Request id |  Length  | Checksum |
//! | 4 bytes  | 1 byte|  8 bytes   | 4 bytes  | 4 bytes  |
//! +----------+-------+------------+----------+----------+
//! |                 Payload (Length bytes)              |
//! +-----------------------------------------------------+
//! ```
//!
//! - Magic: network identifier
//! - Cmd: command code
//! - Request id: 0 for pushes, otherwise correlates request and response
//! - Length: payload length in bytes (big-endian)
//! - Checksum: first 4 bytes of Blake2b256(payload)

use crate::{Cmd, Message, NetworkError, MAINNET_MAGIC, MAX_MESSAGE_SIZE};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header size: magic (4) + cmd (1) + id (8) + length (4) + checksum (4) = 21 bytes
pub const HEADER_SIZE: usize = 21;

/// Message codec for the sync protocol.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    /// Network magic bytes.
    magic: [u8; 4],
    /// Maximum allowed payload size.
    max_size: usize,
}

impl MessageCodec {
    /// Create a new codec with mainnet magic.
    pub fn new() -> Self {
        Self::with_magic(MAINNET_MAGIC)
    }

    /// Create a codec with custom magic bytes.
    pub fn with_magic(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Override the payload size limit.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Calculate checksum for payload (first 4 bytes of Blake2b256).
    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Blake2b::<U32>::digest(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[0..4]);
        checksum
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        if src[0..4] != self.magic {
            return Err(NetworkError::MagicMismatch);
        }

        let cmd = Cmd::try_from(src[4])?;
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&src[5..13]);
        let id = u64::from_be_bytes(id_bytes);
        let length = u32::from_be_bytes([src[13], src[14], src[15], src[16]]) as usize;
        let checksum: [u8; 4] = [src[17], src[18], src[19], src[20]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if Self::checksum(&payload) != checksum {
            return Err(NetworkError::ChecksumMismatch);
        }

        Ok(Some(Message { cmd, id, payload }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.payload.len();
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_slice(&self.magic);
        dst.put_u8(item.cmd as u8);
        dst.put_u64(item.id);
        dst.put_u32(length as u32);
        dst.put_slice(&Self::checksum(&item.payload));
        dst.put_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hash, HashHeight, TESTNET_MAGIC};

    fn status_message() -> Message {
        Message::push(Cmd::Status, &HashHeight::new(Hash([4; 32]), 88))
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = MessageCodec::new();
        let msg = Message::new(Cmd::GetChunk, 9, &crate::ChunkRange::new(1, 5));

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 16);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec::new();
        let mut full = BytesMut::new();
        codec.encode(status_message(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_magic_mismatch() {
        let mut buf = BytesMut::new();
        MessageCodec::with_magic(TESTNET_MAGIC)
            .encode(status_message(), &mut buf)
            .unwrap();

        let result = MessageCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(NetworkError::MagicMismatch)));
    }

    #[test]
    fn test_corrupted_payload() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(status_message(), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_unknown_command() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(status_message(), &mut buf).unwrap();
        buf[4] = 99;

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_oversized_frame() {
        let mut codec = MessageCodec::new().with_max_size(8);
        let mut buf = BytesMut::new();
        assert!(codec.encode(status_message(), &mut buf).is_err());
    }
}
