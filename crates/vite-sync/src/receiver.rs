//! Inbound gossip handling.
//!
//! Each new block is inserted at most once however many peers relay it: the
//! inbound filter admits a hash once, and the chain's insert is idempotent
//! for whatever slips past an evicted entry. Newly inserted blocks are
//! relayed to every peer except the one they came from.
//!
//! While a bulk sync runs, gossip is buffered and replayed in height order
//! once the sync leaves the `Syncing` state.

use crate::broadcast::Broadcaster;
use crate::chain::{Chain, Verifier};
use crate::fetch::{FetchTarget, Fetcher};
use crate::filter::DedupFilter;
use crate::sync::SyncState;
use crate::SyncResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vite_network::{AccountBlock, Hash, HashHeight, PeerId, SnapshotBlock, Subscription};

/// Receiver counters for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub inserted: u64,
    pub duplicates: u64,
    pub buffered: usize,
}

enum Gossip {
    Snapshot(SnapshotBlock),
    Account(AccountBlock),
}

impl Gossip {
    fn hash(&self) -> Hash {
        match self {
            Gossip::Snapshot(block) => block.hash,
            Gossip::Account(block) => block.hash,
        }
    }
}

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub filter_capacity: usize,
    pub filter_ttl: Duration,
    /// Gossip blocks held while syncing.
    pub buffer_size: usize,
    /// Deadline for fetching a missing send block.
    pub fetch_timeout: Duration,
}

/// Processes `NewSnapshotBlock` and `NewAccountBlock` pushes.
pub struct Receiver {
    config: ReceiverConfig,
    chain: Arc<dyn Chain>,
    verifier: Arc<dyn Verifier>,
    broadcaster: Arc<Broadcaster>,
    fetcher: Arc<Fetcher>,
    seen: DedupFilter<Hash>,
    buffer: Mutex<VecDeque<Gossip>>,
    syncing: AtomicBool,
    inserted: AtomicU64,
    duplicates: AtomicU64,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        chain: Arc<dyn Chain>,
        verifier: Arc<dyn Verifier>,
        broadcaster: Arc<Broadcaster>,
        fetcher: Arc<Fetcher>,
    ) -> Self {
        Self {
            seen: DedupFilter::new(config.filter_capacity, config.filter_ttl),
            config,
            chain,
            verifier,
            broadcaster,
            fetcher,
            buffer: Mutex::new(VecDeque::new()),
            syncing: AtomicBool::new(false),
            inserted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Handle a gossiped snapshot block. Returns `true` if it was inserted.
    pub fn receive_snapshot_block(&self, block: SnapshotBlock, from: &PeerId) -> SyncResult<bool> {
        if !self.admit(block.hash) {
            return Ok(false);
        }
        if self.syncing.load(Ordering::SeqCst) {
            self.hold(Gossip::Snapshot(block));
            return Ok(false);
        }
        self.insert_snapshot(&block, Some(from))
    }

    /// Handle a gossiped account block. Returns `true` if it was inserted.
    ///
    /// A receive block whose send block is missing is parked until the send
    /// block has been fetched.
    pub fn receive_account_block(
        self: &Arc<Self>,
        block: AccountBlock,
        from: &PeerId,
    ) -> SyncResult<bool> {
        if !self.admit(block.hash) {
            return Ok(false);
        }
        if self.syncing.load(Ordering::SeqCst) {
            self.hold(Gossip::Account(block));
            return Ok(false);
        }
        if let Some(send) = self.missing_send_block(&block) {
            self.fetch_then_insert(block, send, from.clone());
            return Ok(false);
        }
        self.insert_account(&block, Some(from))
    }

    fn admit(&self, hash: Hash) -> bool {
        if self.seen.mark_and_check(hash) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(block = %hash, "Duplicate gossip ignored");
            return false;
        }
        true
    }

    fn missing_send_block(&self, block: &AccountBlock) -> Option<Hash> {
        if !block.block_type.is_receive() {
            return None;
        }
        block
            .from_block_hash
            .filter(|send| !self.chain.has_block(send))
    }

    fn fetch_then_insert(self: &Arc<Self>, block: AccountBlock, send: Hash, from: PeerId) {
        let receiver = self.clone();
        tokio::spawn(async move {
            let target = FetchTarget::Account {
                address: None,
                block: HashHeight::new(send, 0),
            };
            let result = match receiver
                .fetcher
                .fetch(target, receiver.config.fetch_timeout)
                .await
            {
                Ok(()) => receiver.insert_account(&block, Some(&from)).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(block = %block.hash, send = %send, error = %e, "Receive block dropped");
                receiver.seen.forget(&block.hash);
            }
        });
    }

    fn insert_snapshot(&self, block: &SnapshotBlock, origin: Option<&PeerId>) -> SyncResult<bool> {
        let result = self
            .verifier
            .verify_snapshot_block(block)
            .and_then(|_| self.chain.insert_snapshot_block(block));
        let inserted = match result {
            Ok(inserted) => inserted,
            Err(e) => {
                self.seen.forget(&block.hash);
                return Err(e.into());
            }
        };
        if inserted {
            self.inserted.fetch_add(1, Ordering::Relaxed);
            debug!(block = %block.hash, height = block.height, "Snapshot block inserted");
            if let Some(origin) = origin {
                self.broadcaster.broadcast_snapshot_block(block, Some(origin));
            }
        }
        Ok(inserted)
    }

    fn insert_account(&self, block: &AccountBlock, origin: Option<&PeerId>) -> SyncResult<bool> {
        let result = self
            .verifier
            .verify_account_block(block)
            .and_then(|_| self.chain.insert_account_block(block));
        let inserted = match result {
            Ok(inserted) => inserted,
            Err(e) => {
                self.seen.forget(&block.hash);
                return Err(e.into());
            }
        };
        if inserted {
            self.inserted.fetch_add(1, Ordering::Relaxed);
            debug!(block = %block.hash, address = %block.address, height = block.height, "Account block inserted");
            if let Some(origin) = origin {
                self.broadcaster.broadcast_account_block(block, Some(origin));
            }
        }
        Ok(inserted)
    }

    fn hold(&self, gossip: Gossip) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.config.buffer_size {
            if let Some(dropped) = buffer.pop_front() {
                // Let a later relay of it through again.
                self.seen.forget(&dropped.hash());
            }
        }
        buffer.push_back(gossip);
    }

    /// Suspend insertion while a bulk sync runs.
    pub fn pause(&self) {
        if !self.syncing.swap(true, Ordering::SeqCst) {
            debug!("Gossip buffering started");
        }
    }

    /// Resume insertion and replay buffered blocks in height order.
    pub fn resume(&self) -> usize {
        if !self.syncing.swap(false, Ordering::SeqCst) {
            return 0;
        }
        let held: Vec<Gossip> = self.buffer.lock().drain(..).collect();
        let mut snapshots = Vec::new();
        let mut accounts = Vec::new();
        for gossip in held {
            match gossip {
                Gossip::Snapshot(block) => snapshots.push(block),
                Gossip::Account(block) => accounts.push(block),
            }
        }
        snapshots.sort_by_key(|b| b.height);
        accounts.sort_by_key(|b| (b.address, b.height));

        let mut replayed = 0;
        for block in &snapshots {
            if self.chain.has_block(&block.hash) {
                continue;
            }
            match self.insert_snapshot(block, None) {
                Ok(true) => replayed += 1,
                Ok(false) => {}
                Err(e) => debug!(block = %block.hash, error = %e, "Buffered snapshot block rejected"),
            }
        }
        for block in &accounts {
            if self.chain.has_block(&block.hash) {
                continue;
            }
            match self.insert_account(block, None) {
                Ok(true) => replayed += 1,
                Ok(false) => {}
                Err(e) => debug!(block = %block.hash, error = %e, "Buffered account block rejected"),
            }
        }
        info!(replayed, held = snapshots.len() + accounts.len(), "Gossip buffer replayed");
        replayed
    }

    /// Follow sync state: buffer while syncing, replay afterwards.
    pub async fn run(self: Arc<Self>, mut states: Subscription<SyncState>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                state = states.recv() => match state {
                    Some(SyncState::Syncing) => self.pause(),
                    Some(SyncState::Checking) => {}
                    Some(_) => {
                        self.resume();
                    }
                    None => break,
                },
            }
        }
        debug!("Receiver stopped");
    }

    /// Drop expired dedup entries.
    pub fn sweep(&self) -> usize {
        self.seen.sweep()
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            buffered: self.buffer.lock().len(),
        }
    }
}
