//! Inbound command dispatch.

use crate::chain::Chain;
use crate::file::ChunkFiles;
use crate::pool::RequestPool;
use crate::receiver::Receiver;
use crate::sync::Syncer;
use crate::{SyncError, SyncResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use vite_network::{
    AccountBlock, BlocksRequest, ChunkRange, Cmd, ExceptionCode, HashHeight, Message, Peer,
    SnapshotBlock,
};

/// What became of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed.
    Handled,
    /// Valid but redundant: duplicate gossip, late response.
    Discarded,
}

/// Handler for one or more commands.
pub trait MsgHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Commands this handler owns.
    fn cmds(&self) -> &'static [Cmd];

    fn handle(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<Disposition>;
}

/// Command code to handler table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Cmd, Arc<dyn MsgHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each of its commands.
    ///
    /// A command registered twice keeps the later handler, and the call
    /// reports [`SyncError::DuplicateHandler`] so startup can refuse the
    /// configuration.
    pub fn register(&mut self, handler: Arc<dyn MsgHandler>) -> SyncResult<()> {
        let mut duplicate = None;
        for &cmd in handler.cmds() {
            if let Some(previous) = self.handlers.insert(cmd, handler.clone()) {
                warn!(cmd = %cmd, previous = previous.name(), handler = handler.name(), "Handler replaced");
                duplicate.get_or_insert(cmd);
            }
        }
        match duplicate {
            Some(cmd) => Err(SyncError::DuplicateHandler(cmd)),
            None => Ok(()),
        }
    }

    /// Route `msg` to its handler.
    pub fn dispatch(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<Disposition> {
        match self.handlers.get(&msg.cmd) {
            Some(handler) => handler.handle(peer, msg),
            None => Err(SyncError::MissingHandler(msg.cmd)),
        }
    }

    pub fn contains(&self, cmd: Cmd) -> bool {
        self.handlers.contains_key(&cmd)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Status pushes: track the peer head and wake the syncer.
pub struct StatusHandler {
    syncer: Arc<Syncer>,
}

impl StatusHandler {
    pub fn new(syncer: Arc<Syncer>) -> Self {
        Self { syncer }
    }
}

impl MsgHandler for StatusHandler {
    fn name(&self) -> &'static str {
        "status"
    }

    fn cmds(&self) -> &'static [Cmd] {
        &[Cmd::Status]
    }

    fn handle(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<Disposition> {
        let head: HashHeight = msg.decode()?;
        peer.set_head(head);
        self.syncer.notify_height(head.height);
        Ok(Disposition::Handled)
    }
}

/// Serves block and chunk requests from the local chain.
pub struct QueryHandler {
    chain: Arc<dyn Chain>,
    files: Arc<ChunkFiles>,
    max_blocks: u64,
}

impl QueryHandler {
    pub fn new(chain: Arc<dyn Chain>, files: Arc<ChunkFiles>, max_blocks: u64) -> Self {
        Self {
            chain,
            files,
            max_blocks,
        }
    }

    fn clamp(&self, mut req: BlocksRequest) -> BlocksRequest {
        req.count = req.count.min(self.max_blocks).max(1);
        req
    }

    fn answer(&self, peer: &Arc<Peer>, msg: &Message) -> SyncResult<()> {
        let id = msg.id;
        match msg.cmd {
            Cmd::GetSubLedger => {
                let range: ChunkRange = msg.decode()?;
                let files: Vec<_> = self.files.get(range)?.map(|f| f.meta).into_iter().collect();
                debug!(peer = %peer.id(), range = %range, files = files.len(), "Answering sub-ledger request");
                peer.send(Cmd::FileList, id, &files)?;
            }
            Cmd::GetSnapshotBlocks => {
                let req = self.clamp(msg.decode()?);
                let blocks: Vec<SnapshotBlock> = self.chain.snapshot_blocks(&req)?;
                if blocks.is_empty() {
                    peer.send_msg(Message::exception(id, ExceptionCode::Missing))?;
                } else {
                    peer.send(Cmd::SnapshotBlocks, id, &blocks)?;
                }
            }
            Cmd::GetAccountBlocks => {
                let req = self.clamp(msg.decode()?);
                let blocks: Vec<AccountBlock> = self.chain.account_blocks(&req)?;
                if blocks.is_empty() {
                    peer.send_msg(Message::exception(id, ExceptionCode::Missing))?;
                } else {
                    peer.send(Cmd::AccountBlocks, id, &blocks)?;
                }
            }
            Cmd::GetChunk => {
                let range: ChunkRange = msg.decode()?;
                match self.chain.chunk(range)? {
                    Some(chunk) => peer.send(Cmd::SubLedger, id, &chunk)?,
                    None => peer.send_msg(Message::exception(id, ExceptionCode::Missing))?,
                }
            }
            other => return Err(SyncError::MissingHandler(other)),
        }
        Ok(())
    }
}

impl MsgHandler for QueryHandler {
    fn name(&self) -> &'static str {
        "query"
    }

    fn cmds(&self) -> &'static [Cmd] {
        &[
            Cmd::GetSubLedger,
            Cmd::GetSnapshotBlocks,
            Cmd::GetAccountBlocks,
            Cmd::GetChunk,
        ]
    }

    fn handle(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<Disposition> {
        if msg.is_push() {
            return Err(SyncError::ProtocolViolation(format!(
                "{} without request id",
                msg.cmd
            )));
        }
        match self.answer(peer, &msg) {
            Ok(()) => Ok(Disposition::Handled),
            Err(SyncError::Chain(e)) => {
                // Local failure: tell the peer, keep the connection.
                let _ = peer.send_msg(Message::exception(msg.id, ExceptionCode::Other));
                Err(SyncError::Chain(e))
            }
            Err(e) => Err(e),
        }
    }
}

/// Routes responses to the request pool.
pub struct ResponseHandler {
    pool: Arc<RequestPool>,
}

impl ResponseHandler {
    pub fn new(pool: Arc<RequestPool>) -> Self {
        Self { pool }
    }
}

impl MsgHandler for ResponseHandler {
    fn name(&self) -> &'static str {
        "response"
    }

    fn cmds(&self) -> &'static [Cmd] {
        &[
            Cmd::SubLedger,
            Cmd::FileList,
            Cmd::SnapshotBlocks,
            Cmd::AccountBlocks,
            Cmd::Exception,
        ]
    }

    fn handle(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<Disposition> {
        Ok(match self.pool.handle(peer.id(), msg)? {
            true => Disposition::Handled,
            false => Disposition::Discarded,
        })
    }
}

/// New block pushes.
pub struct GossipHandler {
    receiver: Arc<Receiver>,
}

impl GossipHandler {
    pub fn new(receiver: Arc<Receiver>) -> Self {
        Self { receiver }
    }
}

impl MsgHandler for GossipHandler {
    fn name(&self) -> &'static str {
        "gossip"
    }

    fn cmds(&self) -> &'static [Cmd] {
        &[Cmd::NewSnapshotBlock, Cmd::NewAccountBlock]
    }

    fn handle(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<Disposition> {
        let inserted = match msg.cmd {
            Cmd::NewSnapshotBlock => {
                let block: SnapshotBlock = msg.decode()?;
                if block.height > peer.height() {
                    peer.set_head(block.hash_height());
                }
                self.receiver.receive_snapshot_block(block, peer.id())?
            }
            Cmd::NewAccountBlock => {
                let block: AccountBlock = msg.decode()?;
                self.receiver.receive_account_block(block, peer.id())?
            }
            other => return Err(SyncError::MissingHandler(other)),
        };
        Ok(if inserted {
            Disposition::Handled
        } else {
            Disposition::Discarded
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vite_network::{Hash, HandshakeMsg, PeerId, CMD_SET};

    struct Counting {
        cmds: &'static [Cmd],
        calls: AtomicUsize,
    }

    impl MsgHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn cmds(&self) -> &'static [Cmd] {
            self.cmds
        }

        fn handle(&self, _peer: &Arc<Peer>, _msg: Message) -> SyncResult<Disposition> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Disposition::Handled)
        }
    }

    fn counting(cmds: &'static [Cmd]) -> Arc<Counting> {
        Arc::new(Counting {
            cmds,
            calls: AtomicUsize::new(0),
        })
    }

    fn peer() -> Arc<Peer> {
        let addr: SocketAddr = "10.0.0.3:8484".parse().unwrap();
        let hs = HandshakeMsg {
            version: CMD_SET,
            height: 1,
            port: 8485,
            head: Hash::default(),
            genesis: Hash::default(),
        };
        Arc::new(Peer::new(PeerId::from_addr(&addr), addr, &hs, 8).0)
    }

    #[test]
    fn test_dispatch_by_command() {
        let mut registry = HandlerRegistry::new();
        let status = counting(&[Cmd::Status]);
        registry.register(status.clone()).unwrap();

        let msg = Message::push(Cmd::Status, &HashHeight::default());
        assert_eq!(registry.dispatch(&peer(), msg).unwrap(), Disposition::Handled);
        assert_eq!(status.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_handler_is_fatal() {
        let registry = HandlerRegistry::new();
        let err = registry
            .dispatch(&peer(), Message::push(Cmd::NewSnapshotBlock, &()))
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingHandler(Cmd::NewSnapshotBlock)));
        assert!(err.is_fatal_for_peer());
    }

    #[test]
    fn test_duplicate_registration_last_wins() {
        let mut registry = HandlerRegistry::new();
        let first = counting(&[Cmd::Status, Cmd::GetChunk]);
        let second = counting(&[Cmd::Status]);

        registry.register(first.clone()).unwrap();
        assert!(matches!(
            registry.register(second.clone()),
            Err(SyncError::DuplicateHandler(Cmd::Status))
        ));

        registry
            .dispatch(&peer(), Message::push(Cmd::Status, &HashHeight::default()))
            .unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert!(registry.contains(Cmd::GetChunk));
        assert_eq!(registry.len(), 2);
    }
}
