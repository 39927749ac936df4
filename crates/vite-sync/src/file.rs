//! Bulk chunk transfer over a dedicated TCP channel.
//!
//! Request and response frames:
//!
//! ```text
//! request:  | magic (4) | start (8) | end (8) |
//! response: | status (1) | length (8) | hash (32) | file (length bytes) |
//! ```
//!
//! A connection may carry several requests in sequence. Files are the
//! deterministic encoding of a [`Chunk`], so serving a range twice yields the
//! same bytes.

use crate::chain::Chain;
use crate::{SyncError, SyncResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vite_network::{Chunk, ChunkRange, FileMeta, Hash, NetworkError, Payload, HASH_LEN};

/// Request size: magic (4) + start (8) + end (8).
const REQUEST_SIZE: usize = 20;

/// Response header size: status (1) + length (8) + hash (32).
const RESPONSE_HEADER_SIZE: usize = 1 + 8 + HASH_LEN;

/// Outcome of a file request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileStatus {
    Ok = 0,
    Missing = 1,
}

/// File request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequest {
    pub range: ChunkRange,
}

/// File response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResponse {
    pub status: FileStatus,
    pub hash: Hash,
    pub data: Bytes,
}

impl FileResponse {
    fn missing() -> Self {
        Self {
            status: FileStatus::Missing,
            hash: Hash::default(),
            data: Bytes::new(),
        }
    }
}

/// Server side codec: decodes requests, encodes responses.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    magic: [u8; 4],
}

impl ServerCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

impl Decoder for ServerCodec {
    type Item = FileRequest;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < REQUEST_SIZE {
            return Ok(None);
        }
        if src[0..4] != self.magic {
            return Err(NetworkError::MagicMismatch);
        }
        src.advance(4);
        let start = src.get_u64();
        let end = src.get_u64();
        Ok(Some(FileRequest {
            range: ChunkRange::new(start, end),
        }))
    }
}

impl Encoder<FileResponse> for ServerCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: FileResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(RESPONSE_HEADER_SIZE + item.data.len());
        dst.put_u8(item.status as u8);
        dst.put_u64(item.data.len() as u64);
        dst.put_slice(item.hash.as_bytes());
        dst.put_slice(&item.data);
        Ok(())
    }
}

/// Client side codec: encodes requests, decodes responses up to `max_size`.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    magic: [u8; 4],
    max_size: u64,
}

impl ClientCodec {
    pub fn new(magic: [u8; 4], max_size: u64) -> Self {
        Self { magic, max_size }
    }
}

impl Encoder<FileRequest> for ClientCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: FileRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(REQUEST_SIZE);
        dst.put_slice(&self.magic);
        dst.put_u64(item.range.start);
        dst.put_u64(item.range.end);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = FileResponse;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RESPONSE_HEADER_SIZE {
            return Ok(None);
        }

        let status = match src[0] {
            0 => FileStatus::Ok,
            1 => FileStatus::Missing,
            other => {
                return Err(NetworkError::InvalidMessage(format!(
                    "Unknown file status: {}",
                    other
                )))
            }
        };
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&src[1..9]);
        let length = u64::from_be_bytes(len_bytes);

        // Reject before buffering anything beyond the declared bound.
        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length as usize,
                max: self.max_size as usize,
            });
        }

        let total = RESPONSE_HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(9);
        let mut hash = [0u8; HASH_LEN];
        src.copy_to_slice(&mut hash);
        let data = src.split_to(length as usize).freeze();
        Ok(Some(FileResponse {
            status,
            hash: Hash(hash),
            data,
        }))
    }
}

/// An encoded chunk file with its description.
#[derive(Debug, Clone)]
pub struct ChunkFile {
    pub meta: FileMeta,
    pub data: Bytes,
}

/// Encoded chunk files of the local chain, with an LRU of recent ones.
pub struct ChunkFiles {
    chain: Arc<dyn Chain>,
    cache: Mutex<LruCache<ChunkRange, ChunkFile>>,
}

impl ChunkFiles {
    pub fn new(chain: Arc<dyn Chain>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            chain,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// File for `range`, or `None` if the chain cannot serve all of it.
    pub fn get(&self, range: ChunkRange) -> SyncResult<Option<ChunkFile>> {
        if range.is_empty() {
            return Ok(None);
        }
        if let Some(file) = self.cache.lock().get(&range) {
            return Ok(Some(file.clone()));
        }

        let Some(chunk) = self.chain.chunk(range)? else {
            return Ok(None);
        };
        let data = chunk.to_bytes();
        let file = ChunkFile {
            meta: FileMeta {
                range,
                size: data.len() as u64,
                hash: Hash::digest(&data),
            },
            data,
        };
        self.cache.lock().put(range, file.clone());
        Ok(Some(file))
    }
}

/// Serves chunk files to peers.
pub struct FileServer {
    files: Arc<ChunkFiles>,
    magic: [u8; 4],
    /// Idle deadline per connection.
    timeout: Duration,
}

impl FileServer {
    pub fn new(files: Arc<ChunkFiles>, magic: [u8; 4], timeout: Duration) -> Self {
        Self {
            files,
            magic,
            timeout,
        }
    }

    /// Accept loop.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "File server listening"),
            Err(e) => warn!(error = %e, "File server address unavailable"),
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_connection(stream, cancel).await {
                                debug!(%addr, error = %e, "File connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "File server accept failed"),
                },
            }
        }
        info!("File server stopped");
    }

    /// Answer requests on one connection until it closes or idles out.
    pub async fn serve_connection<T>(&self, io: T, cancel: CancellationToken) -> SyncResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(io, ServerCodec::new(self.magic));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout(self.timeout, framed.next()) => next,
            };
            let request = match next {
                Ok(Some(request)) => request?,
                Ok(None) | Err(_) => return Ok(()),
            };

            let response = match self.files.get(request.range) {
                Ok(Some(file)) => {
                    debug!(range = %request.range, size = file.meta.size, "Serving chunk file");
                    FileResponse {
                        status: FileStatus::Ok,
                        hash: file.meta.hash,
                        data: file.data,
                    }
                }
                Ok(None) => FileResponse::missing(),
                Err(e) => {
                    warn!(range = %request.range, error = %e, "Failed to build chunk file");
                    FileResponse::missing()
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = tokio::time::timeout(self.timeout, framed.send(response)) => match sent {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(SyncError::Timeout(format!("file response for {}", request.range)))
                    }
                },
            }
        }
    }
}

/// Downloads and validates chunk files.
#[derive(Debug, Clone)]
pub struct FileClient {
    magic: [u8; 4],
    timeout: Duration,
    max_size: u64,
}

impl FileClient {
    pub fn new(magic: [u8; 4], timeout: Duration, max_size: u64) -> Self {
        Self {
            magic,
            timeout,
            max_size,
        }
    }

    /// Download the file described by `meta` from a peer's file server.
    pub async fn download(&self, addr: SocketAddr, meta: &FileMeta) -> SyncResult<Chunk> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Timeout(format!("connect to file server {}", addr)))?
            .map_err(NetworkError::from)?;
        self.fetch(stream, meta).await
    }

    /// Request `meta.range` over an open connection and validate the reply.
    pub async fn fetch<T>(&self, io: T, meta: &FileMeta) -> SyncResult<Chunk>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let range = meta.range;
        if meta.size > self.max_size {
            return Err(SyncError::ChunkValidation(format!(
                "{} declared {} bytes, limit {}",
                range, meta.size, self.max_size
            )));
        }

        let mut framed = Framed::new(io, ClientCodec::new(self.magic, meta.size));
        let exchange = async {
            framed.send(FileRequest { range }).await?;
            framed.next().await.transpose()
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout(format!("file {}", range)))?
            .map_err(|e| SyncError::ChunkValidation(format!("{}: {}", range, e)))?
            .ok_or_else(|| SyncError::ChunkValidation(format!("{}: connection closed", range)))?;

        if response.status != FileStatus::Ok {
            return Err(SyncError::ChunkValidation(format!(
                "{}: file not available",
                range
            )));
        }
        if response.data.len() as u64 != meta.size {
            return Err(SyncError::ChunkValidation(format!(
                "{}: got {} bytes, expected {}",
                range,
                response.data.len(),
                meta.size
            )));
        }
        let digest = Hash::digest(&response.data);
        if digest != response.hash || digest != meta.hash {
            return Err(SyncError::ChunkValidation(format!("{}: hash mismatch", range)));
        }

        let chunk = Chunk::from_bytes(response.data)
            .map_err(|e| SyncError::ChunkValidation(format!("{}: {}", range, e)))?;
        if chunk.range != range {
            return Err(SyncError::ChunkValidation(format!(
                "{}: file holds {}",
                range, chunk.range
            )));
        }
        debug!(range = %range, size = meta.size, "Chunk file downloaded");
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use vite_network::MAINNET_MAGIC;

    fn sample() -> (Chunk, FileMeta, Bytes) {
        let chunk = Chunk {
            range: ChunkRange::new(10, 20),
            snapshot_blocks: vec![],
            account_blocks: vec![],
        };
        let data = chunk.to_bytes();
        let meta = FileMeta {
            range: chunk.range,
            size: data.len() as u64,
            hash: Hash::digest(&data),
        };
        (chunk, meta, data)
    }

    fn client() -> FileClient {
        FileClient::new(MAINNET_MAGIC, Duration::from_secs(5), 1024)
    }

    /// Reads the request, then writes `reply` and closes.
    async fn fake_server(mut io: tokio::io::DuplexStream, reply: Vec<u8>) {
        let mut req = [0u8; REQUEST_SIZE];
        io.read_exact(&mut req).await.unwrap();
        assert_eq!(&req[..4], &MAINNET_MAGIC);
        io.write_all(&reply).await.unwrap();
    }

    fn response_bytes(status: u8, len: u64, hash: Hash, body: &[u8]) -> Vec<u8> {
        let mut out = vec![status];
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(hash.as_bytes());
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_valid_file_accepted() {
        let (chunk, meta, data) = sample();
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(b, response_bytes(0, meta.size, meta.hash, &data)));

        assert_eq!(client().fetch(a, &meta).await.unwrap(), chunk);
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let (_, meta, data) = sample();
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(b, response_bytes(0, meta.size, Hash([9; 32]), &data)));

        assert!(matches!(
            client().fetch(a, &meta).await,
            Err(SyncError::ChunkValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_file_rejected() {
        let (_, meta, data) = sample();
        let (a, b) = tokio::io::duplex(4096);
        let body = &data[..data.len() - 2];
        tokio::spawn(fake_server(b, response_bytes(0, meta.size, meta.hash, body)));

        assert!(matches!(
            client().fetch(a, &meta).await,
            Err(SyncError::ChunkValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_declaration_rejected() {
        let (_, meta, data) = sample();
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(b, response_bytes(0, meta.size + 100, meta.hash, &data)));

        assert!(matches!(
            client().fetch(a, &meta).await,
            Err(SyncError::ChunkValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_status() {
        let (_, meta, _) = sample();
        let (a, b) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(b, response_bytes(1, 0, Hash::default(), &[])));

        assert!(matches!(
            client().fetch(a, &meta).await,
            Err(SyncError::ChunkValidation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (_, meta, _) = sample();
        let (a, _b) = tokio::io::duplex(4096);

        assert!(matches!(
            client().fetch(a, &meta).await,
            Err(SyncError::Timeout(_))
        ));
    }

    #[test]
    fn test_server_codec_rejects_bad_magic() {
        let mut codec = ServerCodec::new(MAINNET_MAGIC);
        let mut buf = BytesMut::from(&[0u8; REQUEST_SIZE][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::MagicMismatch)
        ));
    }
}
