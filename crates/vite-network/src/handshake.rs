//! Connection handshake.
//!
//! Both sides send a `Handshake` push as their first framed message and then
//! wait for the remote one. The payload carries:
//! - Command set version (u32)
//! - Current snapshot height (u64)
//! - File server port (u16)
//! - Current head hash (32 bytes)
//! - Genesis hash (32 bytes)
//!
//! Command set mismatch fails the handshake. Genesis comparison is left to
//! the caller, which decides whether the peer stays connected.

use crate::message::{get_u16, get_u32, get_u64};
use crate::{Cmd, Hash, HashHeight, Message, MessageCodec, NetworkError, NetworkResult, Payload};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMsg {
    /// Command set version.
    pub version: u32,
    /// Current snapshot height.
    pub height: u64,
    /// Port of the sender's file server.
    pub port: u16,
    /// Current snapshot head.
    pub head: Hash,
    /// Genesis snapshot block.
    pub genesis: Hash,
}

impl HandshakeMsg {
    /// Head as a hash/height pair.
    pub fn head(&self) -> HashHeight {
        HashHeight::new(self.head, self.height)
    }
}

impl Payload for HandshakeMsg {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        buf.put_u64(self.height);
        buf.put_u16(self.port);
        self.head.encode(buf);
        self.genesis.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> NetworkResult<Self> {
        let version = get_u32(buf, "version")?;
        let height = get_u64(buf, "height")?;
        let port = get_u16(buf, "port")?;
        let head = Hash::decode(buf)?;
        let genesis = Hash::decode(buf)?;
        Ok(Self {
            version,
            height,
            port,
            head,
            genesis,
        })
    }
}

/// Exchange handshakes over a freshly framed connection.
pub async fn handshake<T>(
    framed: &mut Framed<T, MessageCodec>,
    ours: &HandshakeMsg,
    timeout: Duration,
) -> NetworkResult<HandshakeMsg>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Message::push(Cmd::Handshake, ours)).await?;

    let next = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| NetworkError::HandshakeFailed("Handshake timeout".into()))?;

    let msg = match next {
        Some(Ok(msg)) => msg,
        Some(Err(e)) => return Err(e),
        None => return Err(NetworkError::ConnectionClosed),
    };

    if msg.cmd != Cmd::Handshake {
        return Err(NetworkError::HandshakeFailed(format!(
            "Expected Handshake, got {}",
            msg.cmd
        )));
    }

    let theirs: HandshakeMsg = msg.decode()?;
    if theirs.version != ours.version {
        return Err(NetworkError::VersionMismatch {
            got: theirs.version,
            expected: ours.version,
        });
    }

    debug!(
        height = theirs.height,
        port = theirs.port,
        head = %theirs.head,
        "Handshake received"
    );

    Ok(theirs)
}
