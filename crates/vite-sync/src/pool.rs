//! Outstanding request tracking.
//!
//! Every request attempt gets a fresh id and a deadline. The first of
//! {matching response, deadline, peer loss} to remove the pending entry
//! resolves it; anything arriving for an id that is no longer pending is
//! discarded. Failed attempts are retried against another eligible peer up
//! to the configured bound.

use crate::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vite_network::{
    Address, BlocksRequest, ChunkRange, Cmd, ExceptionCode, Hash, Message, Peer, PeerEvent,
    PeerId, PeerSet,
};

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Chunk files covering a range (`GetSubLedger` → `FileList`).
    SubLedger(ChunkRange),
    /// Snapshot blocks (`GetSnapshotBlocks` → `SnapshotBlocks`).
    SnapshotBlocks(BlocksRequest),
    /// Account blocks (`GetAccountBlocks` → `AccountBlocks`).
    AccountBlocks(BlocksRequest),
    /// Chunk content over the control channel (`GetChunk` → `SubLedger`).
    Chunk(ChunkRange),
}

impl RequestKind {
    pub fn cmd(&self) -> Cmd {
        match self {
            RequestKind::SubLedger(_) => Cmd::GetSubLedger,
            RequestKind::SnapshotBlocks(_) => Cmd::GetSnapshotBlocks,
            RequestKind::AccountBlocks(_) => Cmd::GetAccountBlocks,
            RequestKind::Chunk(_) => Cmd::GetChunk,
        }
    }

    fn expected(&self) -> Cmd {
        match self {
            RequestKind::SubLedger(_) => Cmd::FileList,
            RequestKind::SnapshotBlocks(_) => Cmd::SnapshotBlocks,
            RequestKind::AccountBlocks(_) => Cmd::AccountBlocks,
            RequestKind::Chunk(_) => Cmd::SubLedger,
        }
    }

    /// Snapshot height a peer must advertise to be asked.
    fn min_height(&self) -> u64 {
        match self {
            RequestKind::SubLedger(range) | RequestKind::Chunk(range) => {
                range.last().unwrap_or(range.start)
            }
            RequestKind::SnapshotBlocks(req) if req.forward => {
                req.from.height.saturating_add(req.count.saturating_sub(1))
            }
            RequestKind::SnapshotBlocks(req) => req.from.height,
            // Account heights say nothing about snapshot height.
            RequestKind::AccountBlocks(_) => 0,
        }
    }

    /// Content identity of the request.
    pub fn key(&self) -> RequestKey {
        match self {
            RequestKind::SubLedger(range) | RequestKind::Chunk(range) => {
                RequestKey::Range(self.cmd(), *range)
            }
            RequestKind::SnapshotBlocks(req) => RequestKey::Block(None, req.from.hash),
            RequestKind::AccountBlocks(req) => RequestKey::Block(req.address, req.from.hash),
        }
    }

    fn message(&self, id: u64) -> Message {
        match self {
            RequestKind::SubLedger(range) | RequestKind::Chunk(range) => {
                Message::new(self.cmd(), id, range)
            }
            RequestKind::SnapshotBlocks(req) | RequestKind::AccountBlocks(req) => {
                Message::new(self.cmd(), id, req)
            }
        }
    }
}

/// Content identity used to spot duplicate outstanding requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Range(Cmd, ChunkRange),
    Block(Option<Address>, Hash),
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKey::Range(cmd, range) => write!(f, "{} {}", cmd, range),
            RequestKey::Block(Some(address), hash) => write!(f, "block {} of {}", hash, address),
            RequestKey::Block(None, hash) => write!(f, "block {}", hash),
        }
    }
}

/// A resolved request.
#[derive(Debug, Clone)]
pub struct Response {
    /// Peer that answered.
    pub peer: PeerId,
    pub msg: Message,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Interval of the expired-entry sweep.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 3,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Pool counters for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub pending: usize,
    pub issued: u64,
    pub resolved: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub discarded: u64,
}

enum Outcome {
    Response(Message),
    PeerLost,
    Expired,
}

enum Failure {
    Timeout,
    PeerLost,
    Refused(ExceptionCode),
    Send,
}

struct Pending {
    peer: PeerId,
    expect: Cmd,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PoolState {
    pending: HashMap<u64, Pending>,
    /// Outstanding logical requests per content key.
    keys: HashMap<RequestKey, usize>,
}

/// Request/response correlation with timeout and retry.
pub struct RequestPool {
    config: PoolConfig,
    peers: Arc<PeerSet>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    issued: AtomicU64,
    resolved: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
}

impl RequestPool {
    pub fn new(config: PoolConfig, peers: Arc<PeerSet>, cancel: CancellationToken) -> Self {
        Self {
            config,
            peers,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            cancel,
            issued: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Issue a request and wait for its resolution.
    pub async fn request(&self, kind: RequestKind) -> SyncResult<Response> {
        self.request_excluding(kind, &HashSet::new()).await
    }

    /// Like [`RequestPool::request`], never asking the peers in `exclude`.
    pub async fn request_excluding(
        &self,
        kind: RequestKind,
        exclude: &HashSet<PeerId>,
    ) -> SyncResult<Response> {
        let _claim = self.claim(kind.key(), false)?;
        self.run_attempts(&kind, exclude).await
    }

    /// Issue a request unless one for the same content is already outstanding.
    pub async fn request_unique(&self, kind: RequestKind) -> SyncResult<Response> {
        let _claim = self.claim(kind.key(), true)?;
        self.run_attempts(&kind, &HashSet::new()).await
    }

    /// Whether a request for `key` is outstanding.
    pub fn is_pending(&self, key: &RequestKey) -> bool {
        self.state.lock().keys.contains_key(key)
    }

    fn claim(&self, key: RequestKey, exclusive: bool) -> SyncResult<KeyClaim<'_>> {
        let mut state = self.state.lock();
        let count = state.keys.entry(key.clone()).or_insert(0);
        if exclusive && *count > 0 {
            return Err(SyncError::AlreadyPending(key.to_string()));
        }
        *count += 1;
        Ok(KeyClaim { pool: self, key })
    }

    async fn run_attempts(
        &self,
        kind: &RequestKind,
        exclude: &HashSet<PeerId>,
    ) -> SyncResult<Response> {
        let attempts = self.config.retries.saturating_add(1);
        let mut tried = HashSet::new();
        let mut last = None;

        for attempt in 0..attempts {
            let Some(peer) = self.select_peer(kind, exclude, &tried) else {
                return Err(match last {
                    None => SyncError::NoPeer,
                    Some(Failure::PeerLost) => SyncError::PeerLost(kind.key().to_string()),
                    Some(_) => SyncError::Timeout(format!(
                        "{} after {} attempts, no peer left",
                        kind.key(),
                        attempt
                    )),
                });
            };
            if attempt > 0 {
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            tried.insert(peer.id().clone());

            let failure = match self.attempt(kind, &peer, attempt).await? {
                Ok(msg) => {
                    self.resolved.fetch_add(1, Ordering::Relaxed);
                    return Ok(Response {
                        peer: peer.id().clone(),
                        msg,
                    });
                }
                Err(failure) => failure,
            };
            match &failure {
                Failure::Timeout => {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %peer.id(), key = %kind.key(), attempt, "Request timed out");
                }
                Failure::PeerLost => {
                    warn!(peer = %peer.id(), key = %kind.key(), attempt, "Peer lost during request")
                }
                Failure::Refused(code) => {
                    debug!(peer = %peer.id(), key = %kind.key(), ?code, "Request refused")
                }
                Failure::Send => {
                    debug!(peer = %peer.id(), key = %kind.key(), "Request not sent")
                }
            }
            last = Some(failure);
        }

        Err(match last {
            Some(Failure::PeerLost) => SyncError::PeerLost(kind.key().to_string()),
            _ => SyncError::Timeout(format!("{} after {} attempts", kind.key(), attempts)),
        })
    }

    /// One attempt against one peer. The outer error is cancellation only.
    async fn attempt(
        &self,
        kind: &RequestKind,
        peer: &Arc<Peer>,
        attempt: u32,
    ) -> SyncResult<Result<Message, Failure>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.timeout;
        self.state.lock().pending.insert(
            id,
            Pending {
                peer: peer.id().clone(),
                expect: kind.expected(),
                deadline,
                tx,
            },
        );
        let _guard = PendingGuard { pool: self, id };

        if peer.send_msg(kind.message(id)).is_err() {
            self.take(id);
            return Ok(Err(Failure::Send));
        }
        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer.id(), id, cmd = %kind.cmd(), attempt, "Request sent");

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            res = &mut rx => res.unwrap_or(Outcome::PeerLost),
            _ = tokio::time::sleep_until(deadline) => match self.take(id) {
                Some(_) => Outcome::Expired,
                // Resolved concurrently; the outcome is already on its way.
                None => rx.await.unwrap_or(Outcome::PeerLost),
            },
        };

        Ok(match outcome {
            Outcome::Response(msg) if msg.cmd == Cmd::Exception => {
                let code = msg.decode().unwrap_or(ExceptionCode::Other);
                Err(Failure::Refused(code))
            }
            Outcome::Response(msg) => Ok(msg),
            Outcome::PeerLost => Err(Failure::PeerLost),
            Outcome::Expired => Err(Failure::Timeout),
        })
    }

    /// Highest eligible peer, preferring ones not tried yet.
    fn select_peer(
        &self,
        kind: &RequestKind,
        exclude: &HashSet<PeerId>,
        tried: &HashSet<PeerId>,
    ) -> Option<Arc<Peer>> {
        let candidates = self.peers.peers_for_height(kind.min_height(), exclude);
        candidates
            .iter()
            .find(|p| !tried.contains(p.id()))
            .or_else(|| candidates.first())
            .cloned()
    }

    fn take(&self, id: u64) -> Option<Pending> {
        self.state.lock().pending.remove(&id)
    }

    /// Route a response command from `from` to its waiter.
    ///
    /// Returns `false` if nothing was waiting for it (late or unsolicited).
    pub fn handle(&self, from: &PeerId, msg: Message) -> SyncResult<bool> {
        if msg.is_push() {
            return Err(SyncError::ProtocolViolation(format!(
                "{} without request id",
                msg.cmd
            )));
        }

        let pending = {
            let mut state = self.state.lock();
            let found = state
                .pending
                .get(&msg.id)
                .map(|p| (&p.peer == from, p.expect));
            match found {
                Some((true, expect)) if msg.cmd == expect || msg.cmd == Cmd::Exception => {
                    state.pending.remove(&msg.id)
                }
                Some((true, expect)) => {
                    return Err(SyncError::ProtocolViolation(format!(
                        "Expected {} for request {}, got {}",
                        expect, msg.id, msg.cmd
                    )))
                }
                _ => None,
            }
        };

        match pending {
            Some(pending) => {
                let _ = pending.tx.send(Outcome::Response(msg));
                Ok(true)
            }
            None => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %from, id = msg.id, cmd = %msg.cmd, "Discarding late or unsolicited response");
                Ok(false)
            }
        }
    }

    /// Fail every attempt bound to a removed peer so its waiter retries.
    pub fn on_peer_removed(&self, peer: &PeerId) -> usize {
        let lost: Vec<Pending> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, p)| &p.peer == peer)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .collect()
        };
        let count = lost.len();
        for pending in lost {
            let _ = pending.tx.send(Outcome::PeerLost);
        }
        count
    }

    /// Expire attempts past their deadline.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Pending> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .collect()
        };
        let count = expired.len();
        for pending in expired {
            let _ = pending.tx.send(Outcome::Expired);
        }
        count
    }

    /// Background loop: peer-loss cascade and deadline sweep.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.peers.subscribe();
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(PeerEvent::Removed(id)) => {
                        let failed = self.on_peer_removed(&id);
                        if failed > 0 {
                            debug!(peer = %id, failed, "Pending requests failed over");
                        }
                    }
                    Some(PeerEvent::Added(_)) => {}
                    None => break,
                },
                _ = ticker.tick() => {
                    let expired = self.sweep();
                    if expired > 0 {
                        debug!(expired, "Swept expired requests");
                    }
                }
            }
        }
        debug!("Request pool stopped");
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pending: self.pending_count(),
            issued: self.issued.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Removes an attempt if its waiter goes away before resolution.
struct PendingGuard<'a> {
    pool: &'a RequestPool,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pool.take(self.id);
    }
}

/// Holds a content key for the lifetime of a logical request.
struct KeyClaim<'a> {
    pool: &'a RequestPool,
    key: RequestKey,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        if let Some(count) = state.keys.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                state.keys.remove(&self.key);
            }
        }
    }
}
