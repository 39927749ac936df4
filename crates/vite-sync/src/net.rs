//! Sync core service.
//!
//! `Net` owns every component, runs one task per connected peer and the
//! background tasks (request sweep, syncer driver, receiver, file server,
//! dedup sweep). All of them stop on a single cancellation token.

use crate::broadcast::Broadcaster;
use crate::chain::{Chain, Verifier};
use crate::config::NetConfig;
use crate::fetch::{FetchTarget, Fetcher};
use crate::file::{ChunkFiles, FileServer};
use crate::handler::{
    Disposition, GossipHandler, HandlerRegistry, QueryHandler, ResponseHandler, StatusHandler,
};
use crate::pool::{PoolConfig, PoolStats, RequestPool};
use crate::receiver::{Receiver, ReceiverConfig, ReceiverStats};
use crate::sync::{SyncState, SyncStatus, Syncer};
use crate::{SyncError, SyncResult};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vite_network::{
    handshake, AccountBlock, Cmd, HandshakeMsg, Message, MessageCodec, NetworkError, Peer,
    PeerEvent, PeerId, PeerInfo, PeerSet, SnapshotBlock, Subscription,
};

/// Node diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub peer_count: usize,
    pub file_port: u16,
    pub msg_sent: u64,
    pub msg_received: u64,
    pub msg_handled: u64,
    pub msg_discarded: u64,
    pub peers: Vec<PeerInfo>,
    pub sync: SyncStatus,
    pub requests: PoolStats,
    pub gossip: ReceiverStats,
}

/// The ledger synchronization core.
pub struct Net {
    config: NetConfig,
    chain: Arc<dyn Chain>,
    peers: Arc<PeerSet>,
    pool: Arc<RequestPool>,
    broadcaster: Arc<Broadcaster>,
    receiver: Arc<Receiver>,
    fetcher: Arc<Fetcher>,
    syncer: Arc<Syncer>,
    files: Arc<ChunkFiles>,
    handlers: HandlerRegistry,
    cancel: CancellationToken,
    /// Bound file server port, advertised in handshakes.
    file_port: AtomicU16,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Net {
    /// Build the core. Fails on invalid configuration.
    pub fn new(
        config: NetConfig,
        chain: Arc<dyn Chain>,
        verifier: Arc<dyn Verifier>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let peers = Arc::new(PeerSet::new());
        let pool = Arc::new(RequestPool::new(
            PoolConfig {
                timeout: config.request_timeout(),
                retries: config.request_retries,
                sweep_interval: config.pool_sweep_interval(),
            },
            peers.clone(),
            cancel.clone(),
        ));
        let syncer = Arc::new(Syncer::new(
            &config,
            chain.clone(),
            verifier.clone(),
            peers.clone(),
            pool.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            peers.clone(),
            config.filter_capacity,
            config.filter_ttl(),
        ));
        let fetcher = Arc::new(Fetcher::new(
            pool.clone(),
            chain.clone(),
            verifier.clone(),
            syncer.clone(),
        ));
        let receiver = Arc::new(Receiver::new(
            ReceiverConfig {
                filter_capacity: config.filter_capacity,
                filter_ttl: config.filter_ttl(),
                buffer_size: config.receiver_buffer_size,
                fetch_timeout: config.request_timeout() * (config.request_retries + 1),
            },
            chain.clone(),
            verifier,
            broadcaster.clone(),
            fetcher.clone(),
        ));
        let files = Arc::new(ChunkFiles::new(chain.clone(), config.file_cache_size));

        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(StatusHandler::new(syncer.clone())))?;
        handlers.register(Arc::new(QueryHandler::new(
            chain.clone(),
            files.clone(),
            config.max_blocks_per_response,
        )))?;
        handlers.register(Arc::new(ResponseHandler::new(pool.clone())))?;
        handlers.register(Arc::new(GossipHandler::new(receiver.clone())))?;

        Ok(Self {
            file_port: AtomicU16::new(config.file_port),
            config,
            chain,
            peers,
            pool,
            broadcaster,
            receiver,
            fetcher,
            syncer,
            files,
            handlers,
            cancel,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the file server and spawn the background tasks.
    ///
    /// Returns the file server address.
    pub async fn start(&self) -> SyncResult<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Config("sync core already started".into()));
        }

        let listener = TcpListener::bind((self.config.bind_address, self.config.file_port))
            .await
            .map_err(NetworkError::from)?;
        let file_addr = listener.local_addr().map_err(NetworkError::from)?;
        self.file_port.store(file_addr.port(), Ordering::SeqCst);

        let server = Arc::new(FileServer::new(
            self.files.clone(),
            self.config.magic,
            self.config.file_timeout(),
        ));
        let sweep_every = (self.config.filter_ttl() / 2).max(Duration::from_secs(1));

        let tasks = vec![
            tokio::spawn(server.run(listener, self.cancel.clone())),
            tokio::spawn(self.pool.clone().run(self.cancel.clone())),
            // Subscribed before the syncer runs so no transition is missed.
            tokio::spawn(
                self.receiver
                    .clone()
                    .run(self.syncer.subscribe(), self.cancel.clone()),
            ),
            tokio::spawn(self.syncer.clone().run(self.cancel.clone())),
            tokio::spawn(sweep_filters(
                self.broadcaster.clone(),
                self.receiver.clone(),
                sweep_every,
                self.cancel.clone(),
            )),
        ];
        self.tasks.lock().extend(tasks);

        info!(file_addr = %file_addr, "Sync core started");
        Ok(file_addr)
    }

    /// Stop everything and wait for the background tasks.
    pub async fn stop(&self) {
        info!("Stopping sync core");
        self.syncer.stop();
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Sync core stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Accept control connections until stopped.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "Accepting peers"),
            Err(e) => warn!(error = %e, "Listener address unavailable"),
        }
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let net = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = net.handle_peer(stream, addr).await {
                                debug!(%addr, error = %e, "Inbound peer ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    /// Dial `addr` and serve the connection until it ends.
    pub async fn connect(&self, addr: SocketAddr) -> SyncResult<()> {
        let stream = tokio::time::timeout(self.config.handshake_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Timeout(format!("connect to {}", addr)))?
            .map_err(NetworkError::from)?;
        self.handle_peer(stream, addr).await
    }

    /// Handshake, register and serve one connection until it closes, fails
    /// or the core stops. The peer is removed from the set on return.
    pub async fn handle_peer<T>(&self, io: T, addr: SocketAddr) -> SyncResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(io, MessageCodec::with_magic(self.config.magic));
        let ours = self.local_handshake();

        let theirs = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            theirs = handshake(&mut framed, &ours, self.config.handshake_timeout()) => theirs?,
        };

        if theirs.genesis != ours.genesis {
            warn!(%addr, genesis = %theirs.genesis, "Peer on a different genesis");
            if self.config.disconnect_on_genesis_mismatch {
                return Err(SyncError::ProtocolViolation(format!(
                    "genesis {} differs from {}",
                    theirs.genesis, ours.genesis
                )));
            }
        }

        let (peer, outbound) = Peer::new(
            PeerId::from_addr(&addr),
            addr,
            &theirs,
            self.config.peer_queue_size,
        );
        let peer = Arc::new(peer);
        if theirs.genesis != ours.genesis {
            peer.exclude_from_sync();
        }
        self.peers.add(peer.clone()).map_err(|e| match e {
            NetworkError::DuplicatePeer(id) => SyncError::DuplicatePeer(id),
            other => SyncError::Network(other),
        })?;
        info!(peer = %peer.id(), height = theirs.height, "Peer connected");
        self.syncer.notify_height(theirs.height);

        let result = self.run_peer(&peer, framed, outbound).await;
        self.peers.remove(peer.id());

        match &result {
            Ok(()) => info!(peer = %peer.id(), "Peer disconnected"),
            Err(e) => warn!(peer = %peer.id(), error = %e, "Peer connection closed"),
        }
        result
    }

    fn local_handshake(&self) -> HandshakeMsg {
        let head = self.chain.latest_snapshot_block();
        HandshakeMsg {
            version: self.config.cmd_set,
            height: head.height,
            port: self.file_port(),
            head: head.hash,
            genesis: self.chain.genesis_snapshot_block().hash,
        }
    }

    /// Prioritized loop: cancellation, inbound frames, outbound queue, status timer.
    async fn run_peer<T>(
        &self,
        peer: &Arc<Peer>,
        framed: Framed<T, MessageCodec>,
        mut outbound: mpsc::Receiver<Message>,
    ) -> SyncResult<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = framed.split();

        let write_timeout = self.config.request_timeout();
        let interval = self.config.status_interval();
        // Random first tick spreads status pushes across peers.
        let offset = rand::thread_rng().gen_range(0..=interval.as_millis() as u64);
        let mut status = tokio::time::interval_at(
            Instant::now() + Duration::from_millis(offset),
            interval,
        );
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = stream.next() => match frame {
                    Some(Ok(msg)) => self.dispatch(peer, msg)?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                Some(msg) = outbound.recv() => {
                    // Bounded: a peer that stops reading is dropped.
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        sent = tokio::time::timeout(write_timeout, sink.send(msg)) => match sent {
                            Ok(result) => result?,
                            Err(_) => {
                                return Err(SyncError::Timeout(format!("write to {}", peer.id())))
                            }
                        },
                    }
                }
                _ = status.tick() => {
                    let head = self.chain.latest_snapshot_block().hash_height();
                    if let Err(e) = peer.send(Cmd::Status, 0, &head) {
                        debug!(peer = %peer.id(), error = %e, "Status not sent");
                    }
                }
            }
        }
    }

    fn dispatch(&self, peer: &Arc<Peer>, msg: Message) -> SyncResult<()> {
        let cmd = msg.cmd;
        let id = msg.id;
        peer.record_received(cmd);

        let started = std::time::Instant::now();
        let result = self.handlers.dispatch(peer, msg);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Disposition::Handled) => {
                peer.record_handled(cmd);
                debug!(peer = %peer.id(), cmd = %cmd, id, elapsed_ms, "Message handled");
            }
            Ok(Disposition::Discarded) => {
                peer.record_discarded(cmd);
                debug!(peer = %peer.id(), cmd = %cmd, id, elapsed_ms, "Message discarded");
            }
            Err(e) if e.is_fatal_for_peer() => {
                warn!(peer = %peer.id(), cmd = %cmd, error = %e, "Closing connection");
                return Err(e);
            }
            Err(e) => {
                peer.record_discarded(cmd);
                warn!(peer = %peer.id(), cmd = %cmd, error = %e, "Message handling failed");
            }
        }
        Ok(())
    }

    /// Fan out a locally produced snapshot block.
    pub fn broadcast_snapshot_block(&self, block: &SnapshotBlock) -> usize {
        self.broadcaster.broadcast_snapshot_block(block, None)
    }

    /// Fan out a locally produced account block.
    pub fn broadcast_account_block(&self, block: &AccountBlock) -> usize {
        self.broadcaster.broadcast_account_block(block, None)
    }

    /// Fetch a missing block from peers.
    pub async fn fetch(&self, target: FetchTarget, timeout: Duration) -> SyncResult<()> {
        self.fetcher.fetch(target, timeout).await
    }

    /// Ask the syncer to compare against the best peer now.
    pub fn trigger_sync(&self) {
        self.syncer.trigger();
    }

    pub fn subscribe_sync_state(&self) -> Subscription<SyncState> {
        self.syncer.subscribe()
    }

    pub fn subscribe_peers(&self) -> Subscription<PeerEvent> {
        self.peers.subscribe()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.syncer.status()
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn file_port(&self) -> u16 {
        self.file_port.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Aggregate and per-peer counters plus sync progress.
    pub fn info(&self) -> NodeInfo {
        let peers = self.peers.info();
        NodeInfo {
            peer_count: peers.len(),
            file_port: self.file_port(),
            msg_sent: peers.iter().map(|p| p.msg_sent).sum(),
            msg_received: peers.iter().map(|p| p.msg_received).sum(),
            msg_handled: peers.iter().map(|p| p.msg_handled).sum(),
            msg_discarded: peers.iter().map(|p| p.msg_discarded).sum(),
            peers,
            sync: self.syncer.status(),
            requests: self.pool.stats(),
            gossip: self.receiver.stats(),
        }
    }
}

async fn sweep_filters(
    broadcaster: Arc<Broadcaster>,
    receiver: Arc<Receiver>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = broadcaster.sweep() + receiver.sweep();
                if evicted > 0 {
                    debug!(evicted, "Dedup filters swept");
                }
            }
        }
    }
}
