//! Bulk sync between nodes.

use crate::generators::{chunk_of, snapshot_chain};
use crate::harness::*;
use std::time::Duration;
use tokio::net::TcpListener;
use std::cmp::Reverse;
use vite_network::{ChunkRange, Cmd, FileMeta, HandshakeMsg, Message, CMD_SET};
use vite_sync::{NetConfig, SyncState};

const SYNC_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_catch_up_from_peer() {
    init_tracing();
    let remote = TestNode::start(test_config(), MemoryChain::with_height(1, 1000)).await;
    let local = TestNode::start(test_config(), MemoryChain::with_height(1, 10)).await;
    let mut states = local.net.subscribe_sync_state();

    connect(&local, &remote);

    assert!(wait_until(SYNC_DEADLINE, || local.chain.height() == 1000).await);
    assert_eq!(local.chain.snapshots(), remote.chain.snapshots());

    // Idle -> Checking -> Syncing -> Done, in that order.
    let mut seen = Vec::new();
    while let Ok(Some(state)) = tokio::time::timeout(Duration::from_secs(2), states.recv()).await {
        seen.push(state);
        if state == SyncState::Done {
            break;
        }
    }
    assert_eq!(seen, vec![SyncState::Checking, SyncState::Syncing, SyncState::Done]);

    let status = local.net.sync_status();
    assert_eq!(status.from, 10);
    assert_eq!(status.target, 1000);
    assert_eq!(status.current, 1000);
    // [10,110) .. [910,1001)
    assert_eq!(status.chunks_applied, 10);
    assert_eq!(local.chain.chunks_inserted(), 10);

    local.stop().await;
    remote.stop().await;
}

#[tokio::test]
async fn test_small_chunks_apply_in_order() {
    init_tracing();
    let config = NetConfig {
        chunk_size: 7,
        parallel_chunks: 8,
        ..test_config()
    };
    let remote = TestNode::start(test_config(), MemoryChain::with_height(2, 200)).await;
    let local = TestNode::start(config, MemoryChain::with_height(2, 0)).await;

    connect(&local, &remote);

    assert!(wait_until(SYNC_DEADLINE, || local.chain.height() == 200).await);
    assert_eq!(local.chain.snapshots(), remote.chain.snapshots());
    // Every chunk links to its predecessor, so none was rejected.
    assert_eq!(local.net.info().requests.timed_out, 0);

    local.stop().await;
    remote.stop().await;
}

#[tokio::test]
async fn test_chunks_answered_out_of_order_apply_in_order() {
    init_tracing();
    let config = NetConfig {
        chunk_size: 10,
        parallel_chunks: 4,
        request_timeout_ms: 10_000,
        ..test_config()
    };
    let blocks = snapshot_chain(11, 39);
    let local = TestNode::start(config, MemoryChain::new(blocks[..=10].to_vec())).await;
    let mut peer = FakePeer::connect(&local, fake_addr(8), &blocks).await;

    // No files on offer, so every chunk comes over the control channel.
    let mut listings = Vec::new();
    for _ in 0..3 {
        let msg = peer
            .recv(Cmd::GetSubLedger, Duration::from_secs(5))
            .await
            .expect("file list requested");
        listings.push(msg.id);
    }
    for id in listings {
        peer.send(Message::new(Cmd::FileList, id, &Vec::<FileMeta>::new()))
            .await;
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        let msg = peer
            .recv(Cmd::GetChunk, Duration::from_secs(5))
            .await
            .expect("chunk requested");
        requests.push((msg.decode::<ChunkRange>().unwrap(), msg.id));
    }
    requests.sort_by_key(|(range, _)| Reverse(range.start));
    let ranges: Vec<_> = requests.iter().map(|(range, _)| *range).collect();
    assert_eq!(
        ranges,
        vec![
            ChunkRange::new(30, 40),
            ChunkRange::new(20, 30),
            ChunkRange::new(10, 20),
        ]
    );

    // [30,40) and [20,30) arrive before [10,20).
    for (range, id) in requests {
        peer.send(Message::new(Cmd::SubLedger, id, &chunk_of(&blocks, range)))
            .await;
    }

    assert!(wait_until(SYNC_DEADLINE, || local.chain.height() == 39).await);
    assert_eq!(local.chain.snapshots(), blocks);
    // Every insert linked to the applied tip: none was refused and retried.
    assert_eq!(local.chain.chunks_inserted(), 3);
    assert_eq!(local.net.sync_status().chunks_applied, 3);
    assert_eq!(local.net.info().requests.timed_out, 0);

    local.stop().await;
}

#[tokio::test]
async fn test_timed_out_chunk_retried_on_other_peer() {
    init_tracing();
    let config = NetConfig {
        request_timeout_ms: 1_000,
        request_retries: 2,
        ..test_config()
    };
    let blocks = snapshot_chain(3, 149);
    let local = TestNode::start(config, MemoryChain::new(blocks[..=50].to_vec())).await;

    // A answers nothing.
    let mut silent = FakePeer::connect(&local, fake_addr(1), &blocks).await;
    for _ in 0..2 {
        let msg = silent
            .recv(Cmd::GetSubLedger, Duration::from_secs(5))
            .await
            .expect("chunk requested from the silent peer");
        assert_eq!(msg.decode::<ChunkRange>().unwrap(), ChunkRange::new(50, 150));
    }

    let serving = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    connect(&local, &serving);

    assert!(wait_until(SYNC_DEADLINE, || local.chain.height() == 149).await);
    assert_eq!(local.chain.snapshots(), blocks);

    let info = local.net.info();
    assert!(info.requests.timed_out >= 2);
    assert!(info.requests.retried >= 2);
    assert!(wait_until(Duration::from_secs(5), || local.net.sync_status().state == SyncState::Done).await);

    local.stop().await;
    serving.stop().await;
}

#[tokio::test]
async fn test_best_peer_removal_fails_over() {
    init_tracing();
    let config = NetConfig {
        request_timeout_ms: 20_000,
        ..test_config()
    };
    let blocks = snapshot_chain(4, 300);
    let local = TestNode::start(config, MemoryChain::new(blocks[..=10].to_vec())).await;
    let mut best = FakePeer::connect(&local, fake_addr(2), &blocks).await;
    let serving = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;

    assert!(best.recv(Cmd::GetSubLedger, Duration::from_secs(5)).await.is_some());
    connect(&local, &serving);
    assert!(wait_until(Duration::from_secs(5), || local.net.peers().len() == 2).await);

    let best_id = best.id();
    drop(best);
    assert!(wait_until(Duration::from_secs(5), || !local.net.peers().contains(&best_id)).await);

    assert!(wait_until(SYNC_DEADLINE, || local.chain.height() == 300).await);
    // Fail-over came from the loss, not from deadlines.
    assert_eq!(local.net.info().requests.timed_out, 0);

    local.stop().await;
    serving.stop().await;
}

#[tokio::test]
async fn test_genesis_mismatch_fails_sync_keeps_peer() {
    init_tracing();
    let local = TestNode::start(test_config(), MemoryChain::with_height(5, 10)).await;
    let foreign = snapshot_chain(6, 500);
    let peer = FakePeer::connect(&local, fake_addr(3), &foreign).await;

    assert!(wait_until(Duration::from_secs(5), || local.net.sync_status().state == SyncState::Error).await);
    assert!(local.net.sync_status().error.is_some());

    let registered = local.net.peers().get(&peer.id()).expect("peer stays connected");
    assert!(registered.is_sync_excluded());
    assert!(local.net.peers().best_for_sync().is_none());
    assert_eq!(local.chain.height(), 10);

    local.stop().await;
}

#[tokio::test]
async fn test_genesis_mismatch_can_disconnect() {
    init_tracing();
    let config = NetConfig {
        disconnect_on_genesis_mismatch: true,
        ..test_config()
    };
    let local = TestNode::start(config, MemoryChain::with_height(5, 10)).await;
    let mut peer = FakePeer::connect(&local, fake_addr(4), &snapshot_chain(6, 20)).await;

    assert!(peer.closed(Duration::from_secs(5)).await);
    assert!(local.net.peers().is_empty());

    local.stop().await;
}

#[tokio::test]
async fn test_no_lag_stays_idle() {
    init_tracing();
    let blocks = snapshot_chain(7, 40);
    let local = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut peer = FakePeer::connect(&local, fake_addr(5), &blocks[..=39]).await;

    // Behind us: nothing is requested.
    assert!(peer.recv(Cmd::GetSubLedger, Duration::from_millis(500)).await.is_none());
    local.net.trigger_sync();
    assert!(peer.recv(Cmd::GetSubLedger, Duration::from_millis(500)).await.is_none());
    assert_eq!(local.net.sync_status().state, SyncState::Idle);

    local.stop().await;
}

#[tokio::test]
async fn test_status_push_announces_head() {
    init_tracing();
    let blocks = snapshot_chain(8, 12);
    let local = TestNode::start(test_config(), MemoryChain::new(blocks.clone())).await;
    let mut peer = FakePeer::connect(&local, fake_addr(6), &blocks).await;

    assert_eq!(peer.theirs.height, 12);
    assert_eq!(peer.theirs.port, local.net.file_port());

    let status = peer
        .recv(Cmd::Status, Duration::from_secs(3))
        .await
        .expect("status pushed within one interval");
    assert!(status.is_push());
    let head: vite_network::HashHeight = status.decode().unwrap();
    assert_eq!(head, blocks[12].hash_height());

    local.stop().await;
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    init_tracing();
    let local = TestNode::start(test_config(), MemoryChain::with_height(9, 3)).await;
    let blocks = snapshot_chain(9, 3);

    let (ours, theirs) = tokio::io::duplex(4096);
    let net = local.net.clone();
    let addr = fake_addr(7);
    let served = tokio::spawn(async move { net.handle_peer(ours, addr).await });

    let mut framed = tokio_util::codec::Framed::new(
        theirs,
        vite_network::MessageCodec::with_magic(local.net.config().magic),
    );
    let hello = HandshakeMsg {
        version: CMD_SET + 1,
        ..crate::generators::handshake_for(&blocks, 1)
    };
    let _ = vite_network::handshake(&mut framed, &hello, Duration::from_secs(2)).await;

    assert!(served.await.unwrap().is_err());
    assert!(local.net.peers().is_empty());

    local.stop().await;
}

#[tokio::test]
async fn test_sync_over_tcp() {
    init_tracing();
    let remote = TestNode::start(test_config(), MemoryChain::with_height(10, 120)).await;
    let local = TestNode::start(test_config(), MemoryChain::with_height(10, 0)).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    tokio::spawn(remote.net.clone().listen(listener));

    let dialer = local.net.clone();
    tokio::spawn(async move {
        let _ = dialer.connect(listen_addr).await;
    });

    assert!(wait_until(SYNC_DEADLINE, || local.chain.height() == 120).await);
    assert_eq!(remote.net.peers().len(), 1);

    let info = local.net.info();
    assert_eq!(info.peer_count, 1);
    assert!(info.msg_received > 0);
    assert!(info.msg_sent > 0);
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["sync"]["target"], 120);

    local.stop().await;
    remote.stop().await;
    assert!(local.net.is_stopped());
}
