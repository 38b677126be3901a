//! End-to-end replication scenarios over loopback WebSockets
//!
//! Covers:
//! - Handshake acceptance and rejection
//! - Gap detection and catch-up
//! - Duplicate and conflicting updates
//! - Fan-out and slow-consumer isolation
//! - Transport limits, idle cutoff and draining on shutdown
//! - Node-to-node replication and restart recovery

use ash_ledger::{verify_chain, Digest, KeyPair, LedgerEntry, LogicalTime, StoreConfig};
use ash_node::codec::{self, CatchUpRange, Envelope, EnvelopeKind};
use ash_node::{CloseReason, Node, NodeConfig, SessionState};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

// Test configuration
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME: usize = 1024 * 1024;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.listen_addr = "127.0.0.1:0".to_string();
    config.key_file = dir.join("node.key");
    config.store = StoreConfig::at(dir.join("ledger"));
    config.handshake_timeout_ms = 2_000;
    config.drain_timeout_ms = 500;
    config.reconnect.initial_ms = 50;
    config.reconnect.max_ms = 500;
    config
}

struct TestNode {
    node: Node,
    _temp: TempDir,
}

impl TestNode {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        tweak(&mut config);
        let node = Node::start(config).await.unwrap();
        Self { node, _temp: temp }
    }

    async fn wait_for_tail(&self, sequence: u64) {
        let store = self.node.store();
        eventually(&format!("tail {}", sequence), || store.tail_sequence() >= sequence).await;
    }

    async fn wait_for_sessions(&self, count: usize) {
        let sessions = self.node.sessions();
        eventually(&format!("{} sessions", count), || sessions.len() == count).await;
    }

    async fn stop(self) {
        self.node.shutdown().await.unwrap();
    }
}

/// A hand-driven peer speaking the wire protocol directly
struct TestPeer {
    keypair: KeyPair,
    ws: Client,
}

impl TestPeer {
    async fn connect(url: &str) -> Self {
        Self::connect_as(url, KeyPair::generate()).await
    }

    async fn connect_as(url: &str, keypair: KeyPair) -> Self {
        let mut peer = Self::raw(url, keypair).await;
        peer.handshake().await;
        peer
    }

    async fn raw(url: &str, keypair: KeyPair) -> Self {
        let (ws, _) = connect_async(url).await.unwrap();
        Self { keypair, ws }
    }

    async fn handshake(&mut self) {
        let challenge = self.recv().await;
        assert_eq!(challenge.kind, EnvelopeKind::Challenge);
        assert!(challenge.verify());
        self.send(&Envelope::proof(&challenge.payload, &self.keypair)).await;

        let nonce: [u8; 32] = rand::random();
        self.send(&Envelope::challenge(nonce, &self.keypair)).await;

        let proof = self.recv().await;
        assert_eq!(proof.kind, EnvelopeKind::Proof);
        assert!(proof.verify_proof(&nonce));
        assert_eq!(proof.signer, challenge.signer);
    }

    async fn send(&mut self, envelope: &Envelope) {
        self.ws
            .send(Message::Text(codec::encode_text(envelope)))
            .await
            .unwrap();
    }

    async fn send_update(&mut self, entry: &LedgerEntry) {
        let envelope = Envelope::update(entry, &self.keypair);
        self.send(&envelope).await;
    }

    async fn recv(&mut self) -> Envelope {
        loop {
            let frame = timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .unwrap();
            match frame {
                Message::Text(text) => return codec::decode(text.as_bytes(), MAX_FRAME).unwrap(),
                Message::Binary(data) => return codec::decode(&data, MAX_FRAME).unwrap(),
                _ => continue,
            }
        }
    }

    async fn expect_closed(&mut self) {
        let deadline = Instant::now() + TEST_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.ws.next()).await {
                Err(_) => panic!("connection was not closed"),
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

/// A well-formed chain of `n` updates
fn chain(n: u64) -> Vec<LedgerEntry> {
    let mut predecessor = Digest::ZERO;
    (1..=n)
        .map(|sequence| {
            let entry = LedgerEntry {
                sequence,
                payload: format!("update-{}", sequence).into_bytes(),
                accepted_at: LogicalTime::new(sequence, 0),
                predecessor_hash: predecessor,
            };
            predecessor = entry.hash();
            entry
        })
        .collect()
}

#[tokio::test]
async fn test_gap_is_filled_by_catch_up() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    let entries = chain(4);

    // Updates 1, 2 and 4; 3 is missing
    peer.send_update(&entries[0]).await;
    peer.send_update(&entries[1]).await;
    peer.send_update(&entries[3]).await;

    let request = peer.recv().await;
    assert_eq!(request.kind, EnvelopeKind::CatchupRequest);
    assert_eq!(request.signer, env.node.public_key());
    assert_eq!(
        CatchUpRange::decode(&request.payload).unwrap(),
        CatchUpRange { from: 3, to: 3 }
    );

    let response = Envelope::catchup_response(&entries[2], &peer.keypair);
    peer.send(&response).await;

    env.wait_for_tail(4).await;
    let report = verify_chain(env.node.store(), 1, 4).unwrap();
    assert_eq!(report.entries, 4);
    assert_eq!(report.tail_hash, entries[3].hash());
    assert_eq!(env.node.status().await.unwrap().pending, 0);

    env.stop().await;
}

#[tokio::test]
async fn test_duplicate_update_is_noop() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    let entries = chain(2);

    peer.send_update(&entries[0]).await;
    peer.send_update(&entries[0]).await;
    peer.send_update(&entries[1]).await;

    env.wait_for_tail(2).await;
    assert_eq!(env.node.store().get(1).unwrap().payload, entries[0].payload);
    assert_eq!(env.node.sessions().len(), 1);

    env.stop().await;
}

#[tokio::test]
async fn test_conflicting_update_is_discarded() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    let entries = chain(6);

    for entry in &entries[..5] {
        peer.send_update(entry).await;
    }
    env.wait_for_tail(5).await;

    // Same position, different payload
    let mut conflicting = entries[4].clone();
    conflicting.payload = b"forged".to_vec();
    peer.send_update(&conflicting).await;
    peer.send_update(&entries[5]).await;

    env.wait_for_tail(6).await;
    assert_eq!(env.node.store().get(5).unwrap().payload, entries[4].payload);
    verify_chain(env.node.store(), 1, 6).unwrap();

    env.stop().await;
}

#[tokio::test]
async fn test_accepted_update_fans_out_to_other_sessions() {
    let env = TestNode::start().await;
    let mut origin = TestPeer::connect(&env.node.url()).await;
    let mut observer = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(2).await;

    let entries = chain(1);
    origin.send_update(&entries[0]).await;

    let update = observer.recv().await;
    assert_eq!(update.kind, EnvelopeKind::Update);
    assert_eq!(update.sequence, 1);
    assert_eq!(update.payload, entries[0].payload);
    assert_eq!(update.predecessor_hash, Some(Digest::ZERO));
    assert_eq!(update.signer, env.node.public_key());
    assert!(update.verify());

    env.stop().await;
}

#[tokio::test]
async fn test_slow_session_is_closed_alone() {
    let env = TestNode::start_with(|config| {
        config.session_queue_capacity = 32;
        config.catchup_batch_size = 16;
    })
    .await;
    let slow = TestPeer::connect(&env.node.url()).await;
    let mut fast = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(2).await;
    let fast_key = fast.keypair.public_key();

    const UPDATES: u64 = 256;
    let reader = tokio::spawn(async move {
        let mut last = 0;
        while last < UPDATES {
            let update = fast.recv().await;
            assert_eq!(update.sequence, last + 1);
            last = update.sequence;
        }
        last
    });

    // The slow peer never reads; its socket buffers fill first
    for _ in 0..UPDATES {
        env.node.submit(vec![0x5a; 64 * 1024]).await.unwrap();
    }

    assert_eq!(reader.await.unwrap(), UPDATES);
    env.wait_for_sessions(1).await;
    let active = env.node.sessions().active_peers();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].public_key, fast_key);

    drop(slow);
    env.stop().await;
}

#[tokio::test]
async fn test_handshake_with_wrong_nonce_is_rejected() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::raw(&env.node.url(), KeyPair::generate()).await;

    let challenge = peer.recv().await;
    assert_eq!(challenge.kind, EnvelopeKind::Challenge);
    let proof = Envelope::proof(&[0u8; 32], &peer.keypair);
    peer.send(&proof).await;

    peer.expect_closed().await;
    assert!(env.node.sessions().is_empty());

    env.stop().await;
}

#[tokio::test]
async fn test_handshake_with_mismatched_keys_is_rejected() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::raw(&env.node.url(), KeyPair::generate()).await;
    let other = KeyPair::generate();

    // Proof from one key, challenge from another
    let challenge = peer.recv().await;
    peer.send(&Envelope::proof(&challenge.payload, &peer.keypair)).await;
    peer.send(&Envelope::challenge(rand::random(), &other)).await;

    peer.expect_closed().await;
    assert!(env.node.sessions().is_empty());

    env.stop().await;
}

#[tokio::test]
async fn test_silent_peer_times_out_in_handshake() {
    let env = TestNode::start_with(|config| config.handshake_timeout_ms = 200).await;
    let mut peer = TestPeer::raw(&env.node.url(), KeyPair::generate()).await;

    let started = Instant::now();
    peer.expect_closed().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(env.node.sessions().is_empty());

    env.stop().await;
}

#[tokio::test]
async fn test_unlisted_peer_is_not_allowed() {
    let allowed = KeyPair::generate();
    let allowed_hex = allowed.public_key().to_hex();
    let env = TestNode::start_with(|config| config.allowed_peers = vec![allowed_hex]).await;

    let mut stranger = TestPeer::raw(&env.node.url(), KeyPair::generate()).await;
    stranger.handshake().await;
    stranger.expect_closed().await;

    let _member = TestPeer::connect_as(&env.node.url(), allowed).await;
    env.wait_for_sessions(1).await;

    env.stop().await;
}

#[tokio::test]
async fn test_repeated_bad_signatures_close_session() {
    let env = TestNode::start_with(|config| config.failure_threshold = 1).await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(1).await;

    // Validly signed, but not by the authenticated key
    let impostor = KeyPair::generate();
    let entries = chain(1);
    let forged = Envelope::update(&entries[0], &impostor);
    peer.send(&forged).await;
    peer.send(&forged).await;

    peer.expect_closed().await;
    assert_eq!(env.node.store().tail_sequence(), 0);

    env.stop().await;
}

#[tokio::test]
async fn test_undecodable_frame_is_dropped() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::connect(&env.node.url()).await;

    peer.ws.send(Message::Text("not an envelope".to_string())).await.unwrap();
    peer.send_update(&chain(1)[0]).await;

    env.wait_for_tail(1).await;
    assert_eq!(env.node.sessions().len(), 1);

    env.stop().await;
}

#[tokio::test]
async fn test_submit_replicates_between_nodes() {
    let a = TestNode::start().await;
    let a_url = a.node.url();
    let b = TestNode::start_with(|config| config.peers = vec![a_url]).await;
    a.wait_for_sessions(1).await;
    b.wait_for_sessions(1).await;

    let entry = a.node.submit(b"hello".to_vec()).await.unwrap();
    assert_eq!(entry.sequence, 1);

    b.wait_for_tail(1).await;
    let replicated = b.node.store().get(1).unwrap();
    assert!(replicated.same_update(&entry));
    assert_eq!(b.node.store().tail_hash(), a.node.store().tail_hash());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_late_joiner_catches_up_from_peer() {
    let a = TestNode::start().await;
    for i in 0..3u8 {
        a.node.submit(vec![i]).await.unwrap();
    }

    let a_url = a.node.url();
    let b = TestNode::start_with(|config| config.peers = vec![a_url]).await;
    a.wait_for_sessions(1).await;

    // The next update exposes the gap to the joiner
    a.node.submit(vec![3]).await.unwrap();

    b.wait_for_tail(4).await;
    let report = verify_chain(b.node.store(), 1, 4).unwrap();
    assert_eq!(report.tail_hash, a.node.store().tail_hash());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_restart_recovers_tail() {
    let temp = TempDir::new().unwrap();

    let node = Node::start(test_config(temp.path())).await.unwrap();
    let key = node.public_key();
    for i in 0..3u8 {
        node.submit(vec![i]).await.unwrap();
    }
    let tail_hash = node.store().tail_hash();
    node.shutdown().await.unwrap();

    let node = Node::start(test_config(temp.path())).await.unwrap();
    assert_eq!(node.public_key(), key);
    assert_eq!(node.store().tail_sequence(), 3);
    assert_eq!(node.store().tail_hash(), tail_hash);

    let next = node.submit(vec![3]).await.unwrap();
    assert_eq!(next.sequence, 4);
    assert_eq!(next.predecessor_hash, tail_hash);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_message_closes_transport() {
    let env = TestNode::start_with(|config| config.max_frame_size = 1024).await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(1).await;

    // Well past the encoded limit for a 1 KiB payload
    let oversized = "x".repeat(64 * 1024);
    peer.ws.send(Message::Text(oversized)).await.unwrap();

    peer.expect_closed().await;
    env.wait_for_sessions(0).await;

    env.stop().await;
}

#[tokio::test]
async fn test_inbound_flood_does_not_starve_outbound() {
    let env = TestNode::start_with(|config| {
        config.session_queue_capacity = 8;
        config.catchup_batch_size = 4;
    })
    .await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(1).await;

    env.node.submit(b"seed".to_vec()).await.unwrap();
    let first = peer.recv().await;
    assert_eq!(first.sequence, 1);
    let duplicate = Envelope::signed(
        EnvelopeKind::Update,
        1,
        first.payload.clone(),
        first.predecessor_hash,
        &peer.keypair,
    );
    let frame = codec::encode_text(&duplicate);

    let (mut sink, mut stream) = peer.ws.split();
    let flood = tokio::spawn(async move {
        loop {
            if sink.send(Message::Text(frame.clone())).await.is_err() {
                return;
            }
        }
    });

    for n in 2..=51u64 {
        env.node.submit(format!("update-{}", n).into_bytes()).await.unwrap();
    }

    let mut next = 2u64;
    while next <= 51 {
        let frame = timeout(TEST_TIMEOUT, stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        let envelope = match frame {
            Message::Text(text) => codec::decode(text.as_bytes(), MAX_FRAME).unwrap(),
            _ => continue,
        };
        assert_eq!(envelope.kind, EnvelopeKind::Update);
        assert_eq!(envelope.sequence, next);
        next += 1;
    }

    let peers = env.node.sessions().active_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].state, SessionState::Active);

    flood.abort();
    env.stop().await;
}

#[tokio::test]
async fn test_peer_that_ignores_pings_is_closed_as_idle() {
    let env = TestNode::start_with(|config| {
        config.idle_timeout_ms = 400;
        config.ping_interval_ms = 100;
    })
    .await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(1).await;

    // Never read, so pings go unanswered
    let started = Instant::now();
    env.wait_for_sessions(0).await;
    assert!(started.elapsed() >= Duration::from_millis(300));

    peer.expect_closed().await;
    env.stop().await;
}

#[tokio::test]
async fn test_shutdown_flushes_queue_before_close_frame() {
    let env = TestNode::start().await;
    let mut peer = TestPeer::connect(&env.node.url()).await;
    env.wait_for_sessions(1).await;

    let origin = KeyPair::generate();
    let entries = chain(3);
    let sessions = env.node.sessions();
    for entry in &entries {
        assert_eq!(sessions.broadcast(&Envelope::update(entry, &origin), None), 1);
    }
    assert_eq!(sessions.close_all(CloseReason::Shutdown), 1);

    for entry in &entries {
        let update = peer.recv().await;
        assert_eq!(update.sequence, entry.sequence);
        assert_eq!(update.payload, entry.payload);
    }

    loop {
        let frame = timeout(TEST_TIMEOUT, peer.ws.next())
            .await
            .expect("timed out waiting for the close frame")
            .expect("connection dropped without a close frame")
            .unwrap();
        match frame {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame after drain: {:?}", other),
        }
    }
    env.wait_for_sessions(0).await;

    env.stop().await;
}
