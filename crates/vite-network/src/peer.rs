//! Connected peers and the peer set.

use crate::feed::{Feed, Subscription};
use crate::{Cmd, Hash, HandshakeMsg, HashHeight, Message, NetworkError, NetworkResult, Payload};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Unique peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Vec<u8>);

impl PeerId {
    /// Create from bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Create from socket address.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        Self(addr.to_string().into_bytes())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => f.write_str(text),
            _ => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

/// Peer liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    /// Handshake in progress.
    Connecting,
    /// Registered and serving.
    Active,
    /// Removed from the peer set.
    Disconnected,
}

/// Per-command message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CmdStats {
    pub sent: u64,
    pub received: u64,
    pub handled: u64,
    pub discarded: u64,
}

/// Diagnostic snapshot of a peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub addr: SocketAddr,
    pub state: PeerState,
    pub height: u64,
    pub head: Hash,
    pub sync_excluded: bool,
    pub connected_secs: u64,
    pub msg_sent: u64,
    pub msg_received: u64,
    pub msg_handled: u64,
    pub msg_discarded: u64,
    pub commands: BTreeMap<String, CmdStats>,
}

/// A handshaken connection.
///
/// Outbound messages go through a bounded queue drained by the peer's
/// connection task; a full queue discards the message instead of blocking.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    file_port: u16,
    genesis: Hash,
    version: u32,
    head: RwLock<HashHeight>,
    state: RwLock<PeerState>,
    sync_excluded: AtomicBool,
    /// Registration order, assigned by the peer set.
    seq: AtomicU64,
    stats: Mutex<HashMap<Cmd, CmdStats>>,
    tx: mpsc::Sender<Message>,
    connected_at: Instant,
}

impl Peer {
    /// Create a peer from its handshake. The receiver yields queued outbound messages.
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        handshake: &HandshakeMsg,
        queue_size: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let peer = Self {
            id,
            addr,
            file_port: handshake.port,
            genesis: handshake.genesis,
            version: handshake.version,
            head: RwLock::new(handshake.head()),
            state: RwLock::new(PeerState::Connecting),
            sync_excluded: AtomicBool::new(false),
            seq: AtomicU64::new(u64::MAX),
            stats: Mutex::new(HashMap::new()),
            tx,
            connected_at: Instant::now(),
        };
        (peer, rx)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address of the peer's file server.
    pub fn file_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.file_port)
    }

    pub fn genesis(&self) -> Hash {
        self.genesis
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn head(&self) -> HashHeight {
        *self.head.read()
    }

    pub fn height(&self) -> u64 {
        self.head.read().height
    }

    /// Record a newer head. Returns `true` if the height grew.
    pub fn set_head(&self, head: HashHeight) -> bool {
        let mut current = self.head.write();
        let grew = head.height > current.height;
        *current = head;
        grew
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write() = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    /// Peers on another genesis stay connected but never serve sync requests.
    pub fn exclude_from_sync(&self) {
        if !self.sync_excluded.swap(true, Ordering::SeqCst) {
            warn!(peer = %self.id, "Peer excluded from sync");
        }
    }

    pub fn is_sync_excluded(&self) -> bool {
        self.sync_excluded.load(Ordering::SeqCst)
    }

    fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Queue a message for the peer.
    pub fn send(&self, cmd: Cmd, id: u64, payload: &impl Payload) -> NetworkResult<()> {
        self.send_msg(Message::new(cmd, id, payload))
    }

    /// Queue an already built message.
    pub fn send_msg(&self, msg: Message) -> NetworkResult<()> {
        let cmd = msg.cmd;
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.bump(cmd, |s| s.sent += 1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.bump(cmd, |s| s.discarded += 1);
                debug!(peer = %self.id, cmd = %cmd, "Send queue full, message discarded");
                Err(NetworkError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn record_received(&self, cmd: Cmd) {
        self.bump(cmd, |s| s.received += 1);
    }

    pub fn record_handled(&self, cmd: Cmd) {
        self.bump(cmd, |s| s.handled += 1);
    }

    pub fn record_discarded(&self, cmd: Cmd) {
        self.bump(cmd, |s| s.discarded += 1);
    }

    fn bump(&self, cmd: Cmd, f: impl FnOnce(&mut CmdStats)) {
        f(self.stats.lock().entry(cmd).or_default());
    }

    /// Counters for a single command.
    pub fn stats(&self, cmd: Cmd) -> CmdStats {
        self.stats.lock().get(&cmd).copied().unwrap_or_default()
    }

    pub fn info(&self) -> PeerInfo {
        let stats = self.stats.lock().clone();
        let head = self.head();
        let total = stats.values().fold(CmdStats::default(), |acc, s| CmdStats {
            sent: acc.sent + s.sent,
            received: acc.received + s.received,
            handled: acc.handled + s.handled,
            discarded: acc.discarded + s.discarded,
        });
        PeerInfo {
            id: self.id.to_string(),
            addr: self.addr,
            state: self.state(),
            height: head.height,
            head: head.hash,
            sync_excluded: self.is_sync_excluded(),
            connected_secs: self.connected_at.elapsed().as_secs(),
            msg_sent: total.sent,
            msg_received: total.received,
            msg_handled: total.handled,
            msg_discarded: total.discarded,
            commands: stats
                .into_iter()
                .map(|(cmd, s)| (cmd.name().to_string(), s))
                .collect(),
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Peer set membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(PeerId),
    Removed(PeerId),
}

/// Registry of connected peers.
pub struct PeerSet {
    peers: DashMap<PeerId, Arc<Peer>>,
    next_seq: AtomicU64,
    events: Feed<PeerEvent>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            events: Feed::new(),
        }
    }

    /// Register a peer. Fails if the identity is already present.
    pub fn add(&self, peer: Arc<Peer>) -> NetworkResult<()> {
        let id = peer.id().clone();
        match self.peers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(NetworkError::DuplicatePeer(id.to_string())),
            Entry::Vacant(slot) => {
                peer.seq
                    .store(self.next_seq.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                peer.set_state(PeerState::Active);
                info!(peer = %peer, height = peer.height(), "Peer added");
                slot.insert(peer);
            }
        }
        self.events.publish(PeerEvent::Added(id));
        Ok(())
    }

    /// Remove a peer. Idempotent; only the first call publishes a removal.
    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove(id)?;
        peer.set_state(PeerState::Disconnected);
        info!(peer = %peer, "Peer removed");
        self.events.publish(PeerEvent::Removed(id.clone()));
        Some(peer)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of connected peers in registration order.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .map(|p| p.value().clone())
            .filter(|p| p.is_active())
            .collect();
        peers.sort_by_key(|p| p.seq());
        peers
    }

    /// Connected peer with the greatest height, earliest registered on ties.
    pub fn best(&self) -> Option<Arc<Peer>> {
        Self::pick_best(self.peers())
    }

    /// Like [`PeerSet::best`] but skipping peers excluded from sync.
    pub fn best_for_sync(&self) -> Option<Arc<Peer>> {
        Self::pick_best(
            self.peers()
                .into_iter()
                .filter(|p| !p.is_sync_excluded())
                .collect(),
        )
    }

    fn pick_best(peers: Vec<Arc<Peer>>) -> Option<Arc<Peer>> {
        // peers() is seq-ordered, so keeping the first maximum breaks ties by age.
        peers
            .into_iter()
            .fold(None, |best: Option<Arc<Peer>>, p| match &best {
                Some(b) if b.height() >= p.height() => best,
                _ => Some(p),
            })
    }

    /// Sync-eligible peers at or above `min_height`, highest first.
    pub fn peers_for_height(&self, min_height: u64, skip: &HashSet<PeerId>) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self
            .peers()
            .into_iter()
            .filter(|p| !p.is_sync_excluded())
            .filter(|p| p.height() >= min_height)
            .filter(|p| !skip.contains(p.id()))
            .collect();
        peers.sort_by(|a, b| b.height().cmp(&a.height()).then(a.seq().cmp(&b.seq())));
        peers
    }

    /// Subscribe to membership changes.
    pub fn subscribe(&self) -> Subscription<PeerEvent> {
        self.events.subscribe()
    }

    /// Diagnostic snapshot of all peers.
    pub fn info(&self) -> Vec<PeerInfo> {
        self.peers().iter().map(|p| p.info()).collect()
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}
