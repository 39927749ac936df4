//! Gossip fan-out of new blocks.

use crate::filter::DedupFilter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use vite_network::{AccountBlock, Cmd, Hash, Message, NetworkError, PeerId, PeerSet, SnapshotBlock};

/// Sends new blocks to every connected peer at most once per retention window.
pub struct Broadcaster {
    peers: Arc<PeerSet>,
    /// (peer, block) pairs already sent or known to the peer.
    sent: DedupFilter<(PeerId, Hash)>,
}

impl Broadcaster {
    pub fn new(peers: Arc<PeerSet>, capacity: usize, ttl: Duration) -> Self {
        Self {
            peers,
            sent: DedupFilter::new(capacity, ttl),
        }
    }

    /// Fan out a snapshot block. Returns the number of peers it was sent to.
    pub fn broadcast_snapshot_block(&self, block: &SnapshotBlock, origin: Option<&PeerId>) -> usize {
        self.fan_out(Message::push(Cmd::NewSnapshotBlock, block), block.hash, origin)
    }

    /// Fan out an account block. Returns the number of peers it was sent to.
    pub fn broadcast_account_block(&self, block: &AccountBlock, origin: Option<&PeerId>) -> usize {
        self.fan_out(Message::push(Cmd::NewAccountBlock, block), block.hash, origin)
    }

    fn fan_out(&self, msg: Message, hash: Hash, origin: Option<&PeerId>) -> usize {
        // The origin already has the block.
        if let Some(origin) = origin {
            self.sent.mark_and_check((origin.clone(), hash));
        }

        let mut sent = 0;
        for peer in self.peers.peers() {
            if origin == Some(peer.id()) {
                continue;
            }
            if self.sent.mark_and_check((peer.id().clone(), hash)) {
                trace!(peer = %peer.id(), block = %hash, "Already sent");
                continue;
            }
            match peer.send_msg(msg.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Not delivered, so a later broadcast may try again.
                    self.sent.forget(&(peer.id().clone(), hash));
                    match e {
                        NetworkError::QueueFull => {
                            debug!(peer = %peer.id(), block = %hash, "Gossip dropped, queue full")
                        }
                        e => debug!(peer = %peer.id(), block = %hash, error = %e, "Gossip not sent"),
                    }
                }
            }
        }
        debug!(block = %hash, cmd = %msg.cmd, sent, "Block broadcast");
        sent
    }

    /// Drop expired dedup entries.
    pub fn sweep(&self) -> usize {
        self.sent.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use vite_network::{HandshakeMsg, Peer, CMD_SET};

    fn add_peer(set: &PeerSet, port: u16) -> (PeerId, mpsc::Receiver<Message>) {
        let addr: SocketAddr = format!("10.0.0.2:{}", port).parse().unwrap();
        let hs = HandshakeMsg {
            version: CMD_SET,
            height: 1,
            port: port + 1,
            head: Hash([1; 32]),
            genesis: Hash([0; 32]),
        };
        let (peer, rx) = Peer::new(PeerId::from_addr(&addr), addr, &hs, 64);
        let id = peer.id().clone();
        set.add(Arc::new(peer)).unwrap();
        (id, rx)
    }

    fn block(n: u8) -> SnapshotBlock {
        SnapshotBlock {
            hash: Hash([n; 32]),
            prev_hash: Hash([n - 1; 32]),
            height: n as u64,
            timestamp: 0,
            account_heads: vec![],
            payload: Bytes::new(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn test_repeated_broadcast_sends_once_per_peer() {
        let peers = Arc::new(PeerSet::new());
        let (_a, mut rx_a) = add_peer(&peers, 9000);
        let (_b, mut rx_b) = add_peer(&peers, 9010);
        let broadcaster = Broadcaster::new(peers, 100, Duration::from_secs(60));

        for _ in 0..5 {
            broadcaster.broadcast_snapshot_block(&block(7), None);
        }

        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_b), 1);
    }

    #[tokio::test]
    async fn test_origin_excluded() {
        let peers = Arc::new(PeerSet::new());
        let (a, mut rx_a) = add_peer(&peers, 9000);
        let (_b, mut rx_b) = add_peer(&peers, 9010);
        let broadcaster = Broadcaster::new(peers, 100, Duration::from_secs(60));

        assert_eq!(broadcaster.broadcast_snapshot_block(&block(3), Some(&a)), 1);
        // A later local broadcast does not echo it back to the origin either.
        assert_eq!(broadcaster.broadcast_snapshot_block(&block(3), None), 0);

        assert_eq!(drain(&mut rx_a), 0);
        let msg = rx_b.recv().await.unwrap();
        assert_eq!(msg.cmd, Cmd::NewSnapshotBlock);
        assert!(msg.is_push());
        assert_eq!(msg.decode::<SnapshotBlock>().unwrap(), block(3));
    }

    #[tokio::test]
    async fn test_full_queue_does_not_suppress_later_broadcast() {
        let peers = Arc::new(PeerSet::new());
        let addr: SocketAddr = "10.0.0.3:9100".parse().unwrap();
        let hs = HandshakeMsg {
            version: CMD_SET,
            height: 1,
            port: 9101,
            head: Hash([1; 32]),
            genesis: Hash([0; 32]),
        };
        let (peer, mut rx) = Peer::new(PeerId::from_addr(&addr), addr, &hs, 1);
        peers.add(Arc::new(peer)).unwrap();
        let broadcaster = Broadcaster::new(peers, 100, Duration::from_secs(60));

        assert_eq!(broadcaster.broadcast_snapshot_block(&block(5), None), 1);
        // Queue of one is full, block 6 is dropped.
        assert_eq!(broadcaster.broadcast_snapshot_block(&block(6), None), 0);

        assert_eq!(drain(&mut rx), 1);
        assert_eq!(broadcaster.broadcast_snapshot_block(&block(6), None), 1);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.decode::<SnapshotBlock>().unwrap(), block(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_window() {
        let peers = Arc::new(PeerSet::new());
        let (_a, mut rx_a) = add_peer(&peers, 9000);
        let broadcaster = Broadcaster::new(peers, 100, Duration::from_secs(10));

        broadcaster.broadcast_snapshot_block(&block(4), None);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(broadcaster.sweep(), 1);
        broadcaster.broadcast_snapshot_block(&block(4), None);

        assert_eq!(drain(&mut rx_a), 2);
    }
}
