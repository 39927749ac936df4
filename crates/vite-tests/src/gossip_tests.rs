//! Gossip fan-out, inbound dedup and targeted fetching.

use crate::generators::{next_snapshot_block, receive_block, send_block, snapshot_chain, test_address};
use crate::harness::*;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vite_network::{
    BlocksRequest, Cmd, ExceptionCode, HashHeight, Message, PeerId, PeerSet, SnapshotBlock,
};
use vite_sync::{
    Broadcaster, Chain, FetchTarget, Fetcher, NetConfig, PoolConfig, Receiver, ReceiverConfig,
    RequestPool, SyncError, SyncState, Syncer,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_same_block_from_two_peers_inserted_once() {
    init_tracing();
    let blocks = snapshot_chain(20, 5);
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut first = FakePeer::connect(&node, fake_addr(10), &blocks).await;
    let mut second = FakePeer::connect(&node, fake_addr(11), &blocks).await;

    let block = next_snapshot_block(20, &blocks[5]);
    first.send(Message::push(Cmd::NewSnapshotBlock, &block)).await;
    assert!(wait_until(WAIT, || node.chain.height() == 6).await);

    second.send(Message::push(Cmd::NewSnapshotBlock, &block)).await;

    // Relayed to the other peer only, once.
    let relayed = second
        .recv(Cmd::NewSnapshotBlock, WAIT)
        .await
        .expect("relay to the non-origin peer");
    assert_eq!(relayed.decode::<SnapshotBlock>().unwrap(), block);
    assert_eq!(second.count(Cmd::NewSnapshotBlock, Duration::from_millis(300)).await, 0);
    assert_eq!(first.count(Cmd::NewSnapshotBlock, Duration::from_millis(300)).await, 0);

    assert_eq!(node.chain.snapshots_inserted(), 1);
    let info = node.net.info();
    assert_eq!(info.gossip.inserted, 1);
    assert_eq!(info.gossip.duplicates, 1);

    node.stop().await;
}

#[tokio::test]
async fn test_double_delivery_is_discarded() {
    init_tracing();
    let blocks = snapshot_chain(21, 3);
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut peer = FakePeer::connect(&node, fake_addr(12), &blocks).await;

    let block = next_snapshot_block(21, &blocks[3]);
    for _ in 0..2 {
        peer.send(Message::push(Cmd::NewSnapshotBlock, &block)).await;
    }

    assert!(wait_until(WAIT, || {
        node.net
            .peers()
            .get(&peer.id())
            .map(|p| {
                let stats = p.stats(Cmd::NewSnapshotBlock);
                stats.handled + stats.discarded == 2
            })
            .unwrap_or(false)
    })
    .await);
    let stats = node.net.peers().get(&peer.id()).unwrap().stats(Cmd::NewSnapshotBlock);
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(node.chain.height(), 4);
    assert_eq!(node.chain.snapshots_inserted(), 1);

    node.stop().await;
}

#[tokio::test]
async fn test_broadcast_sends_once_per_peer() {
    init_tracing();
    let blocks = snapshot_chain(22, 2);
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut peers = Vec::new();
    for n in 0..3 {
        peers.push(FakePeer::connect(&node, fake_addr(20 + n), &blocks).await);
    }
    assert!(wait_until(WAIT, || node.net.peers().len() == 3).await);

    let block = next_snapshot_block(22, &blocks[2]);
    assert_eq!(node.net.broadcast_snapshot_block(&block), 3);
    assert_eq!(node.net.broadcast_snapshot_block(&block), 0);

    for peer in &mut peers {
        assert_eq!(peer.count(Cmd::NewSnapshotBlock, Duration::from_millis(500)).await, 1);
    }

    node.stop().await;
}

#[tokio::test]
async fn test_broadcast_account_block_between_nodes() {
    init_tracing();
    let a = TestNode::start(test_config(), MemoryChain::with_height(23, 4)).await;
    let b = TestNode::start(test_config(), MemoryChain::with_height(23, 4)).await;
    connect(&a, &b);
    assert!(wait_until(WAIT, || a.net.peers().len() == 1 && b.net.peers().len() == 1).await);

    let snapshot = a.chain.latest_snapshot_block().hash;
    let send = send_block(test_address(1), 1, Default::default(), snapshot);
    a.chain.add_account_block(&send);
    assert_eq!(a.net.broadcast_account_block(&send), 1);

    assert!(wait_until(WAIT, || b.chain.has_block(&send.hash)).await);
    assert_eq!(b.chain.accounts_inserted(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_receive_block_fetches_missing_send() {
    init_tracing();
    let blocks = snapshot_chain(24, 5);
    let holder = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;

    let snapshot = blocks[5].hash;
    let send = send_block(test_address(1), 1, Default::default(), snapshot);
    let recv = receive_block(test_address(2), 1, Default::default(), send.hash, snapshot);
    holder.chain.add_account_block(&send);

    connect(&node, &holder);
    assert!(wait_until(WAIT, || node.net.peers().len() == 1).await);
    let mut gossiper = FakePeer::connect(&node, fake_addr(30), &blocks).await;

    gossiper.send(Message::push(Cmd::NewAccountBlock, &recv)).await;

    assert!(wait_until(WAIT, || node.chain.has_block(&recv.hash)).await);
    assert!(node.chain.has_block(&send.hash));
    // Relayed to the holder, never back to the gossiper.
    assert!(wait_until(WAIT, || holder.chain.has_block(&recv.hash)).await);
    assert_eq!(gossiper.count(Cmd::NewAccountBlock, Duration::from_millis(300)).await, 0);

    node.stop().await;
    holder.stop().await;
}

#[tokio::test]
async fn test_fetch_missing_snapshot_block() {
    init_tracing();
    let blocks = snapshot_chain(25, 8);
    let holder = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let node = TestNode::start(test_config(), MemoryChain::new(blocks[..=7].to_vec())).await;
    connect(&node, &holder);
    assert!(wait_until(WAIT, || node.net.peers().len() == 1).await);

    let target = FetchTarget::Snapshot(blocks[8].hash_height());
    // One height behind is within the lag threshold, so no sync run competes.
    node.net.fetch(target, WAIT).await.unwrap();
    assert_eq!(node.chain.height(), 8);

    // Already stored: no request at all.
    let issued = node.net.info().requests.issued;
    node.net.fetch(target, WAIT).await.unwrap();
    assert_eq!(node.net.info().requests.issued, issued);

    node.stop().await;
    holder.stop().await;
}

#[tokio::test]
async fn test_fetch_refused_everywhere_fails() {
    init_tracing();
    let blocks = snapshot_chain(26, 4);
    let holder = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    connect(&node, &holder);
    assert!(wait_until(WAIT, || node.net.peers().len() == 1).await);

    let unknown = send_block(test_address(3), 7, Default::default(), blocks[4].hash);
    let target = FetchTarget::Account {
        address: None,
        block: unknown.hash_height(),
    };
    let err = node.net.fetch(target, WAIT).await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)), "unexpected {err:?}");

    node.stop().await;
    holder.stop().await;
}

#[tokio::test]
async fn test_foreign_genesis_peer_never_asked() {
    init_tracing();
    let node = TestNode::start(test_config(), MemoryChain::with_height(31, 7)).await;
    // One ahead: within the lag threshold, so no sync run looks at it.
    let foreign = snapshot_chain(32, 8);
    let mut peer = FakePeer::connect(&node, fake_addr(44), &foreign).await;
    assert!(wait_until(WAIT, || node.net.peers().contains(&peer.id())).await);

    let registered = node.net.peers().get(&peer.id()).expect("peer stays connected");
    assert!(registered.is_sync_excluded());

    let target = FetchTarget::Snapshot(foreign[8].hash_height());
    let err = node.net.fetch(target, WAIT).await.unwrap_err();
    assert!(matches!(err, SyncError::NoPeer), "unexpected {err:?}");
    assert!(peer
        .recv(Cmd::GetSnapshotBlocks, Duration::from_millis(300))
        .await
        .is_none());
    assert_eq!(node.net.sync_status().state, SyncState::Idle);
    assert_eq!(node.chain.height(), 7);

    node.stop().await;
}

/// A block too large for the test pipe, so writing it stalls until the
/// remote reads.
fn oversized_block(seed: u8, prev: &SnapshotBlock) -> SnapshotBlock {
    SnapshotBlock {
        payload: Bytes::from(vec![7u8; 4 << 20]),
        ..next_snapshot_block(seed, prev)
    }
}

#[tokio::test]
async fn test_stalled_peer_dropped_after_write_timeout() {
    init_tracing();
    let blocks = snapshot_chain(33, 3);
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    // Never reads after the handshake.
    let stalled = FakePeer::connect(&node, fake_addr(45), &blocks).await;
    assert!(wait_until(WAIT, || node.net.peers().len() == 1).await);

    assert_eq!(node.net.broadcast_snapshot_block(&oversized_block(33, &blocks[3])), 1);
    assert!(wait_until(WAIT, || node.net.peers().is_empty()).await);

    drop(stalled);
    node.stop().await;
}

#[tokio::test]
async fn test_stop_not_blocked_by_stalled_peer() {
    init_tracing();
    let config = NetConfig {
        request_timeout_ms: 60_000,
        ..test_config()
    };
    let blocks = snapshot_chain(34, 3);
    let node = TestNode::start(config, MemoryChain::new(blocks.clone())).await;
    let stalled = FakePeer::connect(&node, fake_addr(46), &blocks).await;
    assert!(wait_until(WAIT, || node.net.peers().len() == 1).await);

    node.net.broadcast_snapshot_block(&oversized_block(34, &blocks[3]));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.net.peers().len(), 1);

    tokio::time::timeout(Duration::from_secs(3), node.stop())
        .await
        .expect("stop returns with a stalled peer");
    assert!(wait_until(Duration::from_secs(3), || node.net.peers().is_empty()).await);

    drop(stalled);
}

#[tokio::test]
async fn test_missing_block_request_gets_exception() {
    init_tracing();
    let blocks = snapshot_chain(27, 4);
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut peer = FakePeer::connect(&node, fake_addr(40), &blocks).await;

    let unknown = HashHeight::new(snapshot_chain(28, 0)[0].hash, 0);
    peer.send(Message::new(
        Cmd::GetSnapshotBlocks,
        77,
        &BlocksRequest::single(None, unknown),
    ))
    .await;
    let reply = peer.recv(Cmd::Exception, WAIT).await.expect("exception reply");
    assert_eq!(reply.id, 77);
    assert_eq!(reply.decode::<ExceptionCode>().unwrap(), ExceptionCode::Missing);

    let known = BlocksRequest {
        count: 3,
        ..BlocksRequest::single(None, blocks[1].hash_height())
    };
    peer.send(Message::new(Cmd::GetSnapshotBlocks, 78, &known)).await;
    let reply = peer.recv(Cmd::SnapshotBlocks, WAIT).await.expect("blocks reply");
    assert_eq!(reply.id, 78);
    let served: Vec<SnapshotBlock> = reply.decode().unwrap();
    assert_eq!(served, blocks[1..4].to_vec());

    node.stop().await;
}

#[tokio::test]
async fn test_unsolicited_response_is_discarded_not_fatal() {
    init_tracing();
    let blocks = snapshot_chain(29, 2);
    let node = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut peer = FakePeer::connect(&node, fake_addr(41), &blocks).await;

    peer.send(Message::new(Cmd::SnapshotBlocks, 9_999, &Vec::<SnapshotBlock>::new()))
        .await;
    assert!(wait_until(WAIT, || node.net.info().requests.discarded == 1).await);
    assert!(node.net.peers().contains(&peer.id()));

    // A response without a request id breaks the protocol.
    peer.send(Message::push(Cmd::SnapshotBlocks, &Vec::<SnapshotBlock>::new()))
        .await;
    assert!(peer.closed(WAIT).await);
    assert!(wait_until(WAIT, || node.net.peers().is_empty()).await);

    node.stop().await;
}

fn standalone_receiver(chain: Arc<MemoryChain>, buffer_size: usize) -> Arc<Receiver> {
    let config = test_config();
    let peers = Arc::new(PeerSet::new());
    let pool = Arc::new(RequestPool::new(
        PoolConfig {
            timeout: config.request_timeout(),
            retries: 0,
            sweep_interval: config.pool_sweep_interval(),
        },
        peers.clone(),
        CancellationToken::new(),
    ));
    let syncer = Arc::new(Syncer::new(
        &config,
        chain.clone(),
        Arc::new(AcceptAll),
        peers.clone(),
        pool.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new(peers, 100, Duration::from_secs(60)));
    let fetcher = Arc::new(Fetcher::new(pool, chain.clone(), Arc::new(AcceptAll), syncer));
    Arc::new(Receiver::new(
        ReceiverConfig {
            filter_capacity: 100,
            filter_ttl: Duration::from_secs(60),
            buffer_size,
            fetch_timeout: Duration::from_secs(1),
        },
        chain,
        Arc::new(AcceptAll),
        broadcaster,
        fetcher,
    ))
}

#[tokio::test]
async fn test_gossip_held_while_syncing_then_replayed_in_order() {
    let chain = Arc::new(MemoryChain::with_height(50, 3));
    let receiver = standalone_receiver(chain.clone(), 10);
    let blocks = snapshot_chain(50, 6);
    let origin = PeerId::from_bytes(b"gossiper".to_vec());

    receiver.pause();
    for height in [6, 4, 5] {
        let held = receiver
            .receive_snapshot_block(blocks[height].clone(), &origin)
            .unwrap();
        assert!(!held);
    }
    assert_eq!(chain.height(), 3);
    assert_eq!(receiver.stats().buffered, 3);

    assert_eq!(receiver.resume(), 3);
    assert_eq!(chain.height(), 6);
    assert_eq!(receiver.stats().buffered, 0);
    // Not paused any more: a second resume has nothing to do.
    assert_eq!(receiver.resume(), 0);
}

#[tokio::test]
async fn test_full_buffer_drops_oldest() {
    let chain = Arc::new(MemoryChain::with_height(51, 1));
    let receiver = standalone_receiver(chain.clone(), 2);
    let blocks = snapshot_chain(51, 4);
    let origin = PeerId::from_bytes(b"gossiper".to_vec());

    receiver.pause();
    for height in 2..=4 {
        receiver
            .receive_snapshot_block(blocks[height].clone(), &origin)
            .unwrap();
    }
    assert_eq!(receiver.stats().buffered, 2);

    // Height 2 was dropped, so 3 and 4 cannot connect yet.
    assert_eq!(receiver.resume(), 0);
    assert_eq!(chain.height(), 1);

    // The dropped block is admitted again when relayed later, and a failed
    // insert does not poison the filter for the others.
    assert!(receiver
        .receive_snapshot_block(blocks[2].clone(), &origin)
        .unwrap());
    assert!(receiver
        .receive_snapshot_block(blocks[3].clone(), &origin)
        .unwrap());
    assert_eq!(chain.height(), 3);
}
