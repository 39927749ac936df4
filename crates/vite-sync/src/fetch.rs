//! Targeted retrieval of single missing blocks.

use crate::chain::{Chain, Verifier};
use crate::pool::{RequestKind, RequestPool};
use crate::sync::Syncer;
use crate::{SyncError, SyncResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vite_network::{AccountBlock, Address, BlocksRequest, Hash, HashHeight, SnapshotBlock};

/// Block to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    /// Snapshot block by hash and height.
    Snapshot(HashHeight),
    /// Account block. Without an address the serving peer looks it up by hash.
    Account {
        address: Option<Address>,
        block: HashHeight,
    },
}

impl FetchTarget {
    pub fn hash(&self) -> Hash {
        match self {
            FetchTarget::Snapshot(block) | FetchTarget::Account { block, .. } => block.hash,
        }
    }

    fn kind(&self) -> RequestKind {
        match *self {
            FetchTarget::Snapshot(block) => {
                RequestKind::SnapshotBlocks(BlocksRequest::single(None, block))
            }
            FetchTarget::Account { address, block } => {
                RequestKind::AccountBlocks(BlocksRequest::single(address, block))
            }
        }
    }
}

/// Fetches blocks referenced locally but not stored.
pub struct Fetcher {
    pool: Arc<RequestPool>,
    chain: Arc<dyn Chain>,
    verifier: Arc<dyn Verifier>,
    syncer: Arc<Syncer>,
}

impl Fetcher {
    pub fn new(
        pool: Arc<RequestPool>,
        chain: Arc<dyn Chain>,
        verifier: Arc<dyn Verifier>,
        syncer: Arc<Syncer>,
    ) -> Self {
        Self {
            pool,
            chain,
            verifier,
            syncer,
        }
    }

    /// Fetch, verify and insert `target` within `timeout`.
    ///
    /// Fails with [`SyncError::AlreadyPending`] if the same block is being
    /// fetched, and with [`SyncError::SyncInProgress`] if a bulk sync will
    /// deliver it anyway.
    pub async fn fetch(&self, target: FetchTarget, timeout: Duration) -> SyncResult<()> {
        let hash = target.hash();
        if self.chain.has_block(&hash) {
            return Ok(());
        }

        let suppressed = match target {
            FetchTarget::Snapshot(block) => self.syncer.covers(block.height),
            FetchTarget::Account { .. } => self.syncer.is_syncing(),
        };
        if suppressed {
            debug!(block = %hash, "Fetch suppressed during sync");
            return Err(SyncError::SyncInProgress);
        }

        let response = tokio::time::timeout(timeout, self.pool.request_unique(target.kind()))
            .await
            .map_err(|_| SyncError::Timeout(format!("fetch of {}", hash)))??;

        let missing = || {
            SyncError::ProtocolViolation(format!(
                "{} answered without block {}",
                response.peer, hash
            ))
        };
        match target {
            FetchTarget::Snapshot(_) => {
                let blocks: Vec<SnapshotBlock> = response.msg.decode()?;
                let block = blocks.into_iter().find(|b| b.hash == hash).ok_or_else(missing)?;
                self.verifier.verify_snapshot_block(&block)?;
                self.chain.insert_snapshot_block(&block)?;
            }
            FetchTarget::Account { .. } => {
                let blocks: Vec<AccountBlock> = response.msg.decode()?;
                let block = blocks.into_iter().find(|b| b.hash == hash).ok_or_else(missing)?;
                self.verifier.verify_account_block(&block)?;
                self.chain.insert_account_block(&block)?;
            }
        }

        debug!(block = %hash, peer = %response.peer, "Block fetched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vite_network::Cmd;

    #[test]
    fn test_target_request_kind() {
        let block = HashHeight::new(Hash([5; 32]), 42);

        let snapshot = FetchTarget::Snapshot(block).kind();
        assert_eq!(snapshot.cmd(), Cmd::GetSnapshotBlocks);

        let account = FetchTarget::Account {
            address: None,
            block,
        };
        assert_eq!(account.hash(), block.hash);
        match account.kind() {
            RequestKind::AccountBlocks(req) => {
                assert_eq!(req.count, 1);
                assert_eq!(req.from, block);
                assert!(req.address.is_none());
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
