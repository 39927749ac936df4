//! Test harness for integration tests.
//!
//! Provides an in-memory chain, a permissive verifier, running test nodes
//! wired over in-process pipes, and scripted fake peers.

use crate::generators::{handshake_for, snapshot_chain};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use vite_network::{
    handshake, AccountBlock, Address, BlocksRequest, Chunk, ChunkRange, Cmd, Hash, HandshakeMsg,
    Message, MessageCodec, PeerId, SnapshotBlock,
};
use vite_sync::{Chain, ChainError, ChainResult, Net, NetConfig, Verifier};

/// Pipe buffer between two in-process nodes.
const PIPE_SIZE: usize = 1 << 20;

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Loopback config with ephemeral ports and short deadlines.
pub fn test_config() -> NetConfig {
    NetConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        file_port: 0,
        status_interval_secs: 1,
        handshake_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        request_retries: 2,
        pool_sweep_ms: 50,
        file_timeout_ms: 5_000,
        ..Default::default()
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct Ledger {
    snapshots: Vec<SnapshotBlock>,
    snapshot_index: HashMap<Hash, u64>,
    accounts: BTreeMap<(Address, u64), AccountBlock>,
    account_index: HashMap<Hash, (Address, u64)>,
}

impl Ledger {
    fn push_snapshot(&mut self, block: &SnapshotBlock) -> ChainResult<bool> {
        if self.snapshot_index.contains_key(&block.hash) {
            return Ok(false);
        }
        let connects = self
            .snapshots
            .last()
            .map(|tip| block.height == tip.height + 1 && block.prev_hash == tip.hash)
            .unwrap_or(block.height == 0);
        if !connects {
            return Err(ChainError::Disconnected(format!(
                "snapshot {} at height {}",
                block.hash, block.height
            )));
        }
        self.snapshot_index.insert(block.hash, block.height);
        self.snapshots.push(block.clone());
        Ok(true)
    }

    fn push_account(&mut self, block: &AccountBlock) -> ChainResult<bool> {
        if self.account_index.contains_key(&block.hash) {
            return Ok(false);
        }
        if let Some(from) = block.from_block_hash.filter(|_| block.block_type.is_receive()) {
            if !self.account_index.contains_key(&from) {
                return Err(ChainError::Missing(format!("send block {}", from)));
            }
        }
        self.account_index
            .insert(block.hash, (block.address, block.height));
        self.accounts
            .insert((block.address, block.height), block.clone());
        Ok(true)
    }
}

/// In-memory ledger with idempotent inserts and insertion counters.
pub struct MemoryChain {
    ledger: RwLock<Ledger>,
    chunks_inserted: AtomicU64,
    snapshots_inserted: AtomicU64,
    accounts_inserted: AtomicU64,
}

impl MemoryChain {
    /// Chain holding `blocks`, genesis first.
    pub fn new(blocks: Vec<SnapshotBlock>) -> Self {
        assert!(!blocks.is_empty(), "a chain needs a genesis block");
        let mut ledger = Ledger::default();
        for block in &blocks {
            ledger
                .push_snapshot(block)
                .expect("generated blocks are linked");
        }
        Self {
            ledger: RwLock::new(ledger),
            chunks_inserted: AtomicU64::new(0),
            snapshots_inserted: AtomicU64::new(0),
            accounts_inserted: AtomicU64::new(0),
        }
    }

    /// Generated chain of `seed` up to `height`.
    pub fn with_height(seed: u8, height: u64) -> Self {
        Self::new(snapshot_chain(seed, height))
    }

    pub fn height(&self) -> u64 {
        self.ledger.read().snapshots.len() as u64 - 1
    }

    pub fn snapshot_at(&self, height: u64) -> Option<SnapshotBlock> {
        self.ledger.read().snapshots.get(height as usize).cloned()
    }

    pub fn snapshots(&self) -> Vec<SnapshotBlock> {
        self.ledger.read().snapshots.clone()
    }

    /// Store an account block directly, bypassing the counters.
    pub fn add_account_block(&self, block: &AccountBlock) {
        self.ledger
            .write()
            .push_account(block)
            .expect("account block accepted");
    }

    pub fn chunks_inserted(&self) -> u64 {
        self.chunks_inserted.load(Ordering::SeqCst)
    }

    /// Snapshot blocks newly stored by single-block inserts.
    pub fn snapshots_inserted(&self) -> u64 {
        self.snapshots_inserted.load(Ordering::SeqCst)
    }

    /// Account blocks newly stored by single-block inserts.
    pub fn accounts_inserted(&self) -> u64 {
        self.accounts_inserted.load(Ordering::SeqCst)
    }
}

impl Chain for MemoryChain {
    fn latest_snapshot_block(&self) -> SnapshotBlock {
        let ledger = self.ledger.read();
        ledger.snapshots[ledger.snapshots.len() - 1].clone()
    }

    fn genesis_snapshot_block(&self) -> SnapshotBlock {
        self.ledger.read().snapshots[0].clone()
    }

    fn insert_chunk(&self, chunk: &Chunk) -> ChainResult<()> {
        let mut ledger = self.ledger.write();
        for block in &chunk.snapshot_blocks {
            let stored = ledger.snapshots.get(block.height as usize).map(|b| b.hash);
            match stored {
                Some(hash) if hash == block.hash => continue,
                Some(hash) => {
                    return Err(ChainError::Disconnected(format!(
                        "height {} holds {}, chunk has {}",
                        block.height, hash, block.hash
                    )))
                }
                None => {
                    ledger.push_snapshot(block)?;
                }
            }
        }
        for block in &chunk.account_blocks {
            ledger.push_account(block)?;
        }
        self.chunks_inserted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn has_block(&self, hash: &Hash) -> bool {
        let ledger = self.ledger.read();
        ledger.snapshot_index.contains_key(hash) || ledger.account_index.contains_key(hash)
    }

    fn insert_snapshot_block(&self, block: &SnapshotBlock) -> ChainResult<bool> {
        let inserted = self.ledger.write().push_snapshot(block)?;
        if inserted {
            self.snapshots_inserted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(inserted)
    }

    fn insert_account_block(&self, block: &AccountBlock) -> ChainResult<bool> {
        let inserted = self.ledger.write().push_account(block)?;
        if inserted {
            self.accounts_inserted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(inserted)
    }

    fn snapshot_blocks(&self, req: &BlocksRequest) -> ChainResult<Vec<SnapshotBlock>> {
        let ledger = self.ledger.read();
        let Some(&start) = ledger.snapshot_index.get(&req.from.hash) else {
            return Ok(Vec::new());
        };
        let count = req.count as usize;
        let heights: Vec<u64> = if req.forward {
            (start..).take(count).collect()
        } else {
            (0..=start).rev().take(count).collect()
        };
        Ok(heights
            .into_iter()
            .filter_map(|h| ledger.snapshots.get(h as usize).cloned())
            .collect())
    }

    fn account_blocks(&self, req: &BlocksRequest) -> ChainResult<Vec<AccountBlock>> {
        let ledger = self.ledger.read();
        let Some(&(address, height)) = ledger.account_index.get(&req.from.hash) else {
            return Ok(Vec::new());
        };
        let count = req.count as usize;
        Ok(match req.address {
            None => ledger.accounts.get(&(address, height)).cloned().into_iter().collect(),
            Some(requested) if requested != address => Vec::new(),
            Some(_) if req.forward => ledger
                .accounts
                .range((address, height)..=(address, u64::MAX))
                .take(count)
                .map(|(_, b)| b.clone())
                .collect(),
            Some(_) => ledger
                .accounts
                .range((address, 0)..=(address, height))
                .rev()
                .take(count)
                .map(|(_, b)| b.clone())
                .collect(),
        })
    }

    fn chunk(&self, range: ChunkRange) -> ChainResult<Option<Chunk>> {
        let ledger = self.ledger.read();
        if range.is_empty() || range.end > ledger.snapshots.len() as u64 {
            return Ok(None);
        }
        let snapshot_blocks = ledger.snapshots[range.start as usize..range.end as usize].to_vec();
        let hashes: HashSet<Hash> = snapshot_blocks.iter().map(|b| b.hash).collect();
        let account_blocks = ledger
            .accounts
            .values()
            .filter(|b| hashes.contains(&b.snapshot_hash))
            .cloned()
            .collect();
        Ok(Some(Chunk {
            range,
            snapshot_blocks,
            account_blocks,
        }))
    }
}

/// Verifier accepting everything.
pub struct AcceptAll;

impl Verifier for AcceptAll {
    fn verify_snapshot_block(&self, _block: &SnapshotBlock) -> ChainResult<()> {
        Ok(())
    }

    fn verify_account_block(&self, _block: &AccountBlock) -> ChainResult<()> {
        Ok(())
    }

    fn verify_chunk(&self, _chunk: &Chunk) -> ChainResult<()> {
        Ok(())
    }
}

/// A started sync core over a [`MemoryChain`].
pub struct TestNode {
    pub net: Arc<Net>,
    pub chain: Arc<MemoryChain>,
}

impl TestNode {
    pub async fn start(config: NetConfig, chain: MemoryChain) -> Self {
        let chain = Arc::new(chain);
        let net = Net::new(config, chain.clone(), Arc::new(AcceptAll)).expect("valid config");
        net.start().await.expect("file server binds");
        Self {
            net: Arc::new(net),
            chain,
        }
    }

    /// Address other nodes know this node by.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.net.file_port())
    }

    pub fn id(&self) -> PeerId {
        PeerId::from_addr(&self.addr())
    }

    pub async fn stop(&self) {
        self.net.stop().await;
    }
}

/// Connect two nodes over an in-process pipe.
pub fn connect(a: &TestNode, b: &TestNode) -> (JoinHandle<()>, JoinHandle<()>) {
    let (left, right) = tokio::io::duplex(PIPE_SIZE);
    (serve(a, left, b.addr()), serve(b, right, a.addr()))
}

fn serve(node: &TestNode, io: DuplexStream, remote: SocketAddr) -> JoinHandle<()> {
    let net = node.net.clone();
    tokio::spawn(async move {
        let _ = net.handle_peer(io, remote).await;
    })
}

/// Scripted remote end of a connection to a test node.
pub struct FakePeer {
    framed: Framed<DuplexStream, MessageCodec>,
    /// Handshake received from the node.
    pub theirs: HandshakeMsg,
    pub addr: SocketAddr,
}

impl FakePeer {
    /// Connect to `node` as `addr`, announcing the head of `blocks`.
    pub async fn connect(node: &TestNode, addr: SocketAddr, blocks: &[SnapshotBlock]) -> Self {
        Self::connect_with(node, addr, handshake_for(blocks, addr.port())).await
    }

    pub async fn connect_with(node: &TestNode, addr: SocketAddr, ours: HandshakeMsg) -> Self {
        let (local, remote) = tokio::io::duplex(PIPE_SIZE);
        serve(node, local, addr);
        let mut framed = Framed::new(remote, MessageCodec::with_magic(node.net.config().magic));
        let theirs = handshake(&mut framed, &ours, Duration::from_secs(5))
            .await
            .expect("handshake with test node");
        Self {
            framed,
            theirs,
            addr,
        }
    }

    pub fn id(&self) -> PeerId {
        PeerId::from_addr(&self.addr)
    }

    pub async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.expect("send to test node");
    }

    /// Next message with `cmd`, skipping others.
    pub async fn recv(&mut self, cmd: Cmd, within: Duration) -> Option<Message> {
        let deadline = Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Ok(Some(Ok(msg))) if msg.cmd == cmd => return Some(msg),
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// Count messages with `cmd` arriving within `window`.
    pub async fn count(&mut self, cmd: Cmd, window: Duration) -> usize {
        let mut seen = 0;
        while self.recv(cmd, window).await.is_some() {
            seen += 1;
        }
        seen
    }

    /// Whether the node closes the connection within `within`.
    pub async fn closed(&mut self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Ok(Some(Ok(_))) => continue,
                Ok(_) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// Loopback address for the `n`th fake peer.
pub fn fake_addr(n: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40_000 + n)
}
