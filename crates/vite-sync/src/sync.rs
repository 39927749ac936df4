//! Bulk catch-up state machine.
//!
//! ```text
//! Idle ──trigger──▶ Checking ──▶ Syncing ──▶ Done
//!   ▲                  │            │          │
//!   └──────────────────┴──▶ Error ◀─┘          └──trigger──▶ Checking
//! ```
//!
//! A sync run partitions `[local height, target]` into chunks, fetches up to
//! `parallel_chunks` of them at once and applies them strictly in height
//! order. Chunks that arrive early wait in an ordering buffer.

use crate::chain::{Chain, Verifier};
use crate::config::NetConfig;
use crate::file::FileClient;
use crate::pool::{RequestKind, RequestPool};
use crate::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vite_network::{
    Chunk, ChunkRange, Feed, FileMeta, HashHeight, Peer, PeerId, PeerSet, Subscription,
};

/// Syncer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SyncState {
    /// Nothing to do.
    #[default]
    Idle,
    /// Comparing against the best peer.
    Checking,
    /// Fetching and applying chunks.
    Syncing,
    /// Reached the target of the last run.
    Done,
    /// Last run failed; the next trigger starts over.
    Error,
}

/// Snapshot of sync progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Local height when the run started.
    pub from: u64,
    /// Height the run is catching up to.
    pub target: u64,
    /// Highest applied height.
    pub current: u64,
    /// Chunks applied over the syncer's lifetime.
    pub chunks_applied: u64,
    /// Reason of the last failure.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct SyncerConfig {
    chunk_size: u64,
    parallel_chunks: usize,
    chunk_retries: u32,
    lag_threshold: u64,
}

/// Result of one chunk fetch task.
struct ChunkOutcome {
    range: ChunkRange,
    /// Peer that served the data, if any answered.
    served_by: Option<PeerId>,
    result: SyncResult<Chunk>,
}

/// Drives bulk synchronization against the best peer.
pub struct Syncer {
    config: SyncerConfig,
    chain: Arc<dyn Chain>,
    verifier: Arc<dyn Verifier>,
    peers: Arc<PeerSet>,
    pool: Arc<RequestPool>,
    files: FileClient,
    status: RwLock<SyncStatus>,
    feed: Feed<SyncState>,
    trigger: Notify,
    /// Cancels the run in progress.
    run_cancel: Mutex<Option<CancellationToken>>,
}

impl Syncer {
    pub fn new(
        config: &NetConfig,
        chain: Arc<dyn Chain>,
        verifier: Arc<dyn Verifier>,
        peers: Arc<PeerSet>,
        pool: Arc<RequestPool>,
    ) -> Self {
        Self {
            config: SyncerConfig {
                chunk_size: config.chunk_size,
                parallel_chunks: config.parallel_chunks.max(1),
                chunk_retries: config.chunk_retries,
                lag_threshold: config.lag_threshold,
            },
            chain,
            verifier,
            peers,
            pool,
            files: FileClient::new(config.magic, config.file_timeout(), config.max_file_size),
            status: RwLock::new(SyncStatus::default()),
            feed: Feed::new(),
            trigger: Notify::new(),
            run_cancel: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> SyncState {
        self.status.read().state
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> Subscription<SyncState> {
        self.feed.subscribe()
    }

    /// A peer advertised `height`. Starts a check if it is far enough ahead.
    pub fn notify_height(&self, height: u64) {
        let local = self.chain.latest_snapshot_block().height;
        if height > local.saturating_add(self.config.lag_threshold) {
            debug!(local, remote = height, "Peer ahead, sync check requested");
            self.trigger.notify_one();
        }
    }

    /// Request a check regardless of heights.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Whether a running sync will fetch `height`.
    pub fn covers(&self, height: u64) -> bool {
        let status = self.status.read();
        status.state == SyncState::Syncing && height > status.current && height <= status.target
    }

    pub fn is_syncing(&self) -> bool {
        self.state() == SyncState::Syncing
    }

    /// Abort the run in progress, if any.
    pub fn stop(&self) {
        if let Some(cancel) = self.run_cancel.lock().take() {
            info!("Stopping sync");
            cancel.cancel();
        }
    }

    fn set_state(&self, state: SyncState) {
        let mut status = self.status.write();
        if status.state == state {
            return;
        }
        debug!(from = ?status.state, to = ?state, "Sync state changed");
        status.state = state;
        // Published under the status lock so subscribers see transitions in order.
        self.feed.publish(state);
    }

    /// Driver loop: waits for triggers and runs one sync pass per trigger.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.trigger.notified() => {}
            }

            let run_cancel = cancel.child_token();
            *self.run_cancel.lock() = Some(run_cancel.clone());
            let result = self.sync_once(&run_cancel).await;
            self.run_cancel.lock().take();

            match result {
                Ok(()) => {}
                Err(SyncError::Cancelled) => self.set_state(SyncState::Idle),
                Err(SyncError::NoPeer | SyncError::PeerLost(_)) if self.peers.is_empty() => {
                    warn!("All peers lost, sync reset");
                    self.set_state(SyncState::Idle);
                }
                Err(e) => {
                    warn!(error = %e, "Sync failed");
                    self.status.write().error = Some(e.to_string());
                    self.set_state(SyncState::Error);
                }
            }
        }
        self.set_state(SyncState::Idle);
        debug!("Syncer stopped");
    }

    async fn sync_once(self: &Arc<Self>, cancel: &CancellationToken) -> SyncResult<()> {
        let previous = self.state();
        self.set_state(SyncState::Checking);

        let genesis = self.chain.genesis_snapshot_block().hash;
        for other in self.peers.peers() {
            if other.genesis() != genesis {
                other.exclude_from_sync();
            }
        }

        let local = self.chain.latest_snapshot_block().hash_height();
        let lag_threshold = self.config.lag_threshold;
        let ahead = |p: &Arc<Peer>| p.height() > local.height.saturating_add(lag_threshold);

        let Some(peer) = self.peers.best_for_sync().filter(|p| ahead(p)) else {
            // The highest peer is on another chain.
            if let Some(foreign) = self
                .peers
                .best()
                .filter(|p| ahead(p) && p.genesis() != genesis)
            {
                return Err(SyncError::ProtocolViolation(format!(
                    "peer {} has genesis {}, expected {}",
                    foreign.id(),
                    foreign.genesis(),
                    genesis
                )));
            }
            self.set_state(if previous == SyncState::Done {
                SyncState::Done
            } else {
                SyncState::Idle
            });
            return Ok(());
        };
        let target = peer.height();

        {
            let mut status = self.status.write();
            status.from = local.height;
            status.target = target;
            status.current = local.height;
            status.error = None;
        }
        self.set_state(SyncState::Syncing);
        info!(peer = %peer.id(), from = local.height, target, "Sync started");

        self.fetch_range(local, target, cancel).await?;

        info!(height = target, "Sync done");
        self.set_state(SyncState::Done);
        Ok(())
    }

    /// Fetch and apply `(head, target]`, chunk by chunk in height order.
    async fn fetch_range(
        self: &Arc<Self>,
        head: HashHeight,
        target: u64,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let end = target.saturating_add(1);
        let mut queue: VecDeque<ChunkRange> =
            ChunkRange::split(head.height, end, self.config.chunk_size).into();
        let mut tasks: JoinSet<ChunkOutcome> = JoinSet::new();
        let mut ready: BTreeMap<u64, Chunk> = BTreeMap::new();
        let mut failures: HashMap<u64, u32> = HashMap::new();
        let mut excluded: HashMap<u64, HashSet<PeerId>> = HashMap::new();
        let mut served: HashMap<u64, PeerId> = HashMap::new();
        let mut next = head.height;
        let mut tip = head;

        while next < end {
            while tasks.len() < self.config.parallel_chunks {
                let Some(range) = queue.pop_front() else { break };
                let exclude = excluded.get(&range.start).cloned().unwrap_or_default();
                tasks.spawn(self.clone().fetch_chunk(range, exclude));
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                return Err(SyncError::ChunkValidation(format!(
                    "sync stalled at height {}",
                    next
                )));
            };
            let outcome =
                joined.map_err(|e| SyncError::ChunkValidation(format!("chunk task: {}", e)))?;
            let range = outcome.range;

            match outcome.result {
                Ok(chunk) => {
                    debug!(range = %range, "Chunk received");
                    if let Some(peer) = outcome.served_by {
                        served.insert(range.start, peer);
                    }
                    ready.insert(range.start, chunk);
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    if let (SyncError::ChunkValidation(_), Some(peer)) = (&e, outcome.served_by) {
                        excluded.entry(range.start).or_default().insert(peer);
                    }
                    self.chunk_failed(range, e, &mut failures)?;
                    queue.push_front(range);
                }
            }

            while let Some(chunk) = ready.remove(&next) {
                let range = chunk.range;
                match self.apply(&chunk, &tip) {
                    Ok(()) => {
                        if let Some(head) = chunk.head() {
                            tip = head;
                        }
                        next = range.end;
                        let mut status = self.status.write();
                        status.current = tip.height;
                        status.chunks_applied += 1;
                    }
                    Err(e) => {
                        if let Some(peer) = served.remove(&range.start) {
                            excluded.entry(range.start).or_default().insert(peer);
                        }
                        self.chunk_failed(range, e, &mut failures)?;
                        queue.push_front(range);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn chunk_failed(
        &self,
        range: ChunkRange,
        error: SyncError,
        failures: &mut HashMap<u64, u32>,
    ) -> SyncResult<()> {
        if self.peers.is_empty() {
            return Err(SyncError::NoPeer);
        }
        let count = failures.entry(range.start).or_insert(0);
        *count += 1;
        if *count > self.config.chunk_retries {
            warn!(range = %range, attempts = *count, error = %error, "Chunk retries exhausted");
            return Err(error);
        }
        warn!(range = %range, attempt = *count, error = %error, "Chunk failed, retrying");
        Ok(())
    }

    async fn fetch_chunk(self: Arc<Self>, range: ChunkRange, exclude: HashSet<PeerId>) -> ChunkOutcome {
        let mut served_by = None;
        let result = self.download_chunk(range, &exclude, &mut served_by).await;
        let result = result.and_then(|chunk| check_chunk(range, &chunk).map(|_| chunk));
        ChunkOutcome {
            range,
            served_by,
            result,
        }
    }

    /// File transfer when the peer lists a file for the range, control
    /// channel otherwise.
    async fn download_chunk(
        &self,
        range: ChunkRange,
        exclude: &HashSet<PeerId>,
        served_by: &mut Option<PeerId>,
    ) -> SyncResult<Chunk> {
        let listing = self
            .pool
            .request_excluding(RequestKind::SubLedger(range), exclude)
            .await?;
        *served_by = Some(listing.peer.clone());
        let files: Vec<FileMeta> = listing.msg.decode()?;

        if let Some(meta) = files.iter().find(|f| f.range == range) {
            let peer = self
                .peers
                .get(&listing.peer)
                .ok_or_else(|| SyncError::PeerLost(listing.peer.to_string()))?;
            return self.files.download(peer.file_addr(), meta).await;
        }

        debug!(range = %range, peer = %listing.peer, "No file listed, fetching over control channel");
        let response = self
            .pool
            .request_excluding(RequestKind::Chunk(range), exclude)
            .await?;
        *served_by = Some(response.peer);
        Ok(response.msg.decode()?)
    }

    /// Check linkage to the applied tip, verify, then write.
    fn apply(&self, chunk: &Chunk, tip: &HashHeight) -> SyncResult<()> {
        let first = chunk
            .snapshot_blocks
            .first()
            .ok_or_else(|| SyncError::ChunkValidation(format!("{} is empty", chunk.range)))?;

        let connects = if first.height == tip.height {
            first.hash == tip.hash
        } else if first.height == tip.height + 1 {
            first.prev_hash == tip.hash
        } else {
            false
        };
        if !connects {
            return Err(SyncError::ChunkValidation(format!(
                "{} does not connect to height {}",
                chunk.range, tip.height
            )));
        }

        self.verifier
            .verify_chunk(chunk)
            .map_err(|e| SyncError::ChunkValidation(format!("{}: {}", chunk.range, e)))?;
        self.chain.insert_chunk(chunk)?;
        debug!(range = %chunk.range, "Chunk applied");
        Ok(())
    }
}

/// Structural checks: the chunk covers exactly `range` with linked blocks.
pub fn check_chunk(range: ChunkRange, chunk: &Chunk) -> SyncResult<()> {
    if chunk.range != range {
        return Err(SyncError::ChunkValidation(format!(
            "asked for {}, got {}",
            range, chunk.range
        )));
    }
    if chunk.snapshot_blocks.len() as u64 != range.len() {
        return Err(SyncError::ChunkValidation(format!(
            "{} holds {} snapshot blocks",
            range,
            chunk.snapshot_blocks.len()
        )));
    }
    for (offset, block) in chunk.snapshot_blocks.iter().enumerate() {
        if block.height != range.start + offset as u64 {
            return Err(SyncError::ChunkValidation(format!(
                "{}: unexpected height {}",
                range, block.height
            )));
        }
    }
    for pair in chunk.snapshot_blocks.windows(2) {
        if pair[1].prev_hash != pair[0].hash {
            return Err(SyncError::ChunkValidation(format!(
                "{}: broken link at height {}",
                range, pair[1].height
            )));
        }
    }
    Ok(())
}
