//! Handshake and dispatch scenarios driven over in-memory streams.
//!
//! Each test plays the remote side of the connection by hand: it reads the
//! node's frames off one end of a duplex pipe and writes scripted replies.

use glacier::{
    now, AppVersion, Builder, HandshakeError, Id, IpPort, Message, NakCode, NetConfig, Network,
    NodeId, NoopRouter, Op, Peer, Router,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, timeout};

const NETWORK_ID: u32 = 7;
const NODE_ID: u32 = 42;

fn test_config() -> NetConfig {
    NetConfig {
        network_id: NETWORK_ID,
        node_id: NODE_ID,
        ip: IpPort::from_socket_addr("198.51.100.1:9650".parse().unwrap()),
        version: AppVersion::new("glacier", 1, 0, 4),
        allow_private_ips: true,
        ..NetConfig::default()
    }
}

fn test_network() -> Arc<Network> {
    Network::new(test_config(), Arc::new(NoopRouter))
}

fn ip(addr: &str) -> IpPort {
    IpPort::from_socket_addr(addr.parse().unwrap())
}

async fn write_msg(remote: &mut DuplexStream, payload: &[u8]) {
    remote
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    remote.write_all(payload).await.unwrap();
}

async fn read_msg(remote: &mut DuplexStream) -> Message {
    let read = async {
        let mut len = [0u8; 4];
        remote.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        remote.read_exact(&mut payload).await.unwrap();
        Builder.parse(&payload).unwrap()
    };
    timeout(Duration::from_secs(5), read).await.unwrap()
}

/// Skip over unrelated traffic (pings, gossip requests) until `op` shows up.
async fn read_until(remote: &mut DuplexStream, op: Op) -> Message {
    let scan = async {
        loop {
            let msg = read_msg(remote).await;
            if msg.op() == op {
                return msg;
            }
        }
    };
    timeout(Duration::from_secs(5), scan).await.unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Play a legacy remote: answer the node's opening Version with an old-style
/// Version carrying `session_id`, then (optionally) a PeerList to complete
/// the handshake.
async fn legacy_remote(remote: &mut DuplexStream, session_id: u32, send_peer_list: bool) {
    let b = Builder;
    let first = read_msg(remote).await;
    assert!(matches!(first, Message::Version { .. }));

    let version = b.version(
        NETWORK_ID,
        99,
        session_id,
        now(),
        IpPort::zero(),
        "glacier/1.0.3",
    );
    write_msg(remote, &version.bytes).await;
    if send_peer_list {
        write_msg(remote, &b.peer_list(&[]).bytes).await;
    }
}

// =============================================================================
// MODERN HANDSHAKE
// =============================================================================

#[tokio::test]
async fn modern_handshake_success() {
    let net = test_network();
    net.add_validator_ip(ip("203.0.113.200:9650")).await;

    let id = NodeId::from_addr("203.0.113.5:9650");
    let peer = Peer::new(net.clone(), id, None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let opening = read_msg(&mut remote).await;
    match opening {
        Message::Version {
            network_id,
            node_id,
            session_id,
            ..
        } => {
            assert_eq!(network_id, NETWORK_ID);
            assert_eq!(node_id, NODE_ID);
            assert_eq!(session_id, 0);
        }
        other => panic!("expected Version, got {:?}", other),
    }

    let version = b.version(
        NETWORK_ID,
        99,
        1,
        now(),
        ip("203.0.113.5:9650"),
        "glacier/1.0.4",
    );
    write_msg(&mut remote, &version.bytes).await;

    // the node is unpeered, so it answers Success with its validator list
    match read_msg(&mut remote).await {
        Message::VersionNak {
            code: NakCode::Success,
            peers,
        } => assert_eq!(peers, vec![ip("203.0.113.200:9650")]),
        other => panic!("expected VersionNak, got {:?}", other),
    }

    let gossiped = [ip("192.0.2.10:9650"), ip("192.0.2.11:9650")];
    let reply = b.version_nak(NakCode::Success, &gossiped);
    write_msg(&mut remote, &reply.bytes).await;

    started.await.unwrap().unwrap();
    assert!(peer.is_connected());
    assert!(peer.got_version());
    assert!(peer.got_peer_list());
    assert!(net.is_peered(&id).await);

    // the returned addresses become dial candidates
    let mut tracked = false;
    for _ in 0..500 {
        let stats = net.stats().await;
        if stats.tracked_ips.contains(&"192.0.2.10:9650".to_string())
            && stats.tracked_ips.contains(&"192.0.2.11:9650".to_string())
        {
            tracked = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(tracked, "gossiped addresses were not tracked");
}

#[tokio::test]
async fn modern_handshake_rejects_self() {
    let net = test_network();

    // a peer whose asserted id is our own
    let peer = Peer::new(net.clone(), net.local_id(), None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let _ = read_msg(&mut remote).await;
    let version = b.version(
        NETWORK_ID,
        99,
        1,
        now(),
        IpPort::zero(),
        "glacier/1.0.4",
    );
    write_msg(&mut remote, &version.bytes).await;

    match read_msg(&mut remote).await {
        Message::VersionNak {
            code: NakCode::SelfPeered,
            ..
        } => {}
        other => panic!("expected SelfPeered nak, got {:?}", other),
    }

    let err = started.await.unwrap().unwrap_err();
    assert!(matches!(err, HandshakeError::PeerIsMyself));
    assert!(!net.is_peered(&peer.id).await);
}

#[tokio::test]
async fn modern_handshake_rejects_already_peered() {
    let net = test_network();
    let id = NodeId::from_addr("203.0.113.5:9650");

    // first connection completes the legacy way
    let first = Peer::new(net.clone(), id, None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(first.clone().start(local));
    legacy_remote(&mut remote, 1, true).await;
    started.await.unwrap().unwrap();
    wait_until(|| first.is_connected()).await;

    // a second modern connection asserting the same id is refused
    let second = Peer::new(net.clone(), id, None);
    let (local2, mut remote2) = duplex(1 << 16);
    let started2 = tokio::spawn(second.clone().start(local2));

    let b = Builder;
    let _ = read_msg(&mut remote2).await;
    let version = b.version(
        NETWORK_ID,
        99,
        9,
        now(),
        IpPort::zero(),
        "glacier/1.0.4",
    );
    write_msg(&mut remote2, &version.bytes).await;

    match read_msg(&mut remote2).await {
        Message::VersionNak {
            code: NakCode::AlreadyPeered,
            ..
        } => {}
        other => panic!("expected AlreadyPeered nak, got {:?}", other),
    }
    let err = started2.await.unwrap().unwrap_err();
    assert!(matches!(err, HandshakeError::AlreadyPeered));
    assert!(first.is_connected());
}

// =============================================================================
// LEGACY (REACTIVE) HANDSHAKE
// =============================================================================

#[tokio::test]
async fn legacy_handshake_completes() {
    let net = test_network();
    let id = NodeId::from_addr("203.0.113.5:9650");
    let peer = Peer::new(net.clone(), id, None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    legacy_remote(&mut remote, 5, true).await;
    started.await.unwrap().unwrap();

    wait_until(|| peer.is_connected()).await;
    assert!(net.is_peered(&id).await);

    // accepting the version also answers with our address book
    read_until(&mut remote, Op::PeerList).await;
}

#[tokio::test]
async fn legacy_first_op_peer_list_requests_version() {
    let net = test_network();
    let peer = Peer::new(net.clone(), NodeId::from_addr("203.0.113.5:9650"), None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let _ = read_msg(&mut remote).await;
    write_msg(&mut remote, &b.peer_list(&[]).bytes).await;
    started.await.unwrap().unwrap();

    // not connected yet: the node received an address book but no version
    assert!(!peer.is_connected());
    assert!(peer.got_peer_list());
    read_until(&mut remote, Op::GetVersion).await;
}

#[tokio::test]
async fn unexpected_first_op_fails_the_handshake() {
    let net = test_network();
    let peer = Peer::new(net.clone(), NodeId::from_addr("203.0.113.5:9650"), None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let _ = read_msg(&mut remote).await;
    write_msg(&mut remote, &b.ping().bytes).await;

    let err = started.await.unwrap().unwrap_err();
    assert!(matches!(err, HandshakeError::VersionExpected));
}

#[tokio::test]
async fn mismatched_network_id_discards_the_peer() {
    let net = test_network();
    let id = NodeId::from_addr("203.0.113.5:9650");
    let peer = Peer::new(net.clone(), id, None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let _ = read_msg(&mut remote).await;
    let version = b.version(
        NETWORK_ID + 1,
        99,
        0,
        now(),
        IpPort::zero(),
        "glacier/1.0.3",
    );
    write_msg(&mut remote, &version.bytes).await;
    started.await.unwrap().unwrap();

    wait_until(|| peer.is_closed()).await;
    assert!(!net.is_peered(&id).await);
}

#[tokio::test]
async fn matching_node_id_records_own_address() {
    let net = test_network();
    let id = NodeId::from_addr("203.0.113.9:9650");
    let peer = Peer::new(net.clone(), id, None);
    peer.set_ip(ip("203.0.113.9:9650"));

    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let _ = read_msg(&mut remote).await;
    // the remote echoes our own process nonce: we dialed ourselves
    let version = b.version(
        NETWORK_ID,
        NODE_ID,
        0,
        now(),
        IpPort::zero(),
        "glacier/1.0.3",
    );
    write_msg(&mut remote, &version.bytes).await;
    started.await.unwrap().unwrap();

    wait_until(|| peer.is_closed()).await;
    let stats = net.stats().await;
    assert!(stats.my_ips.contains(&"203.0.113.9:9650".to_string()));
    assert!(!stats.tracked_ips.contains(&"203.0.113.9:9650".to_string()));
}

#[tokio::test]
async fn excessive_clock_skew_discards_the_peer() {
    let net = test_network();
    let id = NodeId::from_addr("203.0.113.5:9650");
    let peer = Peer::new(net.clone(), id, None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    let b = Builder;
    let _ = read_msg(&mut remote).await;
    // two minutes ahead against a one minute allowance
    let version = b.version(
        NETWORK_ID,
        99,
        0,
        now() + 120,
        IpPort::zero(),
        "glacier/1.0.3",
    );
    write_msg(&mut remote, &version.bytes).await;
    started.await.unwrap().unwrap();

    wait_until(|| peer.is_closed()).await;
    assert!(!net.is_peered(&id).await);
}

// =============================================================================
// SESSION ARBITRATION
// =============================================================================

#[tokio::test]
async fn reconnect_arbitration() {
    let net = test_network();
    let id = NodeId::from_addr("203.0.113.7:9650");

    // session 5 connects and pushes the next expected session to 6
    let first = Peer::new(net.clone(), id, None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(first.clone().start(local));
    legacy_remote(&mut remote, 5, true).await;
    started.await.unwrap().unwrap();
    wait_until(|| first.is_connected()).await;

    // a stale session is dropped without touching the registry
    let stale = Peer::new(net.clone(), id, None);
    let (local2, mut remote2) = duplex(1 << 16);
    let started2 = tokio::spawn(stale.clone().start(local2));
    legacy_remote(&mut remote2, 3, false).await;
    started2.await.unwrap().unwrap();
    wait_until(|| stale.is_closed()).await;
    assert!(first.is_connected());
    assert!(!first.is_closed());

    // a newer session supplants the live connection; next expected becomes 8
    let newer = Peer::new(net.clone(), id, None);
    let (local3, mut remote3) = duplex(1 << 16);
    let started3 = tokio::spawn(newer.clone().start(local3));
    legacy_remote(&mut remote3, 7, true).await;
    started3.await.unwrap().unwrap();
    wait_until(|| newer.is_connected()).await;
    wait_until(|| first.is_closed()).await;

    // session 7 is now stale, which proves the counter advanced past it
    let replay = Peer::new(net.clone(), id, None);
    let (local4, mut remote4) = duplex(1 << 16);
    let started4 = tokio::spawn(replay.clone().start(local4));
    legacy_remote(&mut remote4, 7, false).await;
    started4.await.unwrap().unwrap();
    wait_until(|| replay.is_closed()).await;
    assert!(newer.is_connected());

    // session 0 always wins: the peer restarted
    let restarted = Peer::new(net.clone(), id, None);
    let (local5, mut remote5) = duplex(1 << 16);
    let started5 = tokio::spawn(restarted.clone().start(local5));
    legacy_remote(&mut remote5, 0, true).await;
    started5.await.unwrap().unwrap();
    wait_until(|| restarted.is_connected()).await;
    wait_until(|| newer.is_closed()).await;
}

// =============================================================================
// LIVE TRAFFIC
// =============================================================================

async fn connected_peer(net: &Arc<Network>, addr: &str) -> (Arc<Peer>, DuplexStream) {
    let peer = Peer::new(net.clone(), NodeId::from_addr(addr), None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));
    legacy_remote(&mut remote, 1, true).await;
    started.await.unwrap().unwrap();
    wait_until(|| peer.is_connected()).await;
    (peer, remote)
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let net = test_network();
    let (_peer, mut remote) = connected_peer(&net, "203.0.113.5:9650").await;

    write_msg(&mut remote, &Builder.ping().bytes).await;
    read_until(&mut remote, Op::Pong).await;
}

#[tokio::test]
async fn get_version_is_answered_with_version() {
    let net = test_network();
    let (_peer, mut remote) = connected_peer(&net, "203.0.113.5:9650").await;

    write_msg(&mut remote, &Builder.get_version().bytes).await;
    match read_until(&mut remote, Op::Version).await {
        Message::Version {
            network_id,
            session_id,
            ..
        } => {
            assert_eq!(network_id, NETWORK_ID);
            // the advertised session comes from the arbitration counter
            assert!(session_id > 0);
        }
        _ => unreachable!(),
    }
}

#[derive(Default)]
struct RecordingRouter {
    chits: Mutex<Vec<(NodeId, Id, u32, Vec<Id>)>>,
    puts: Mutex<Vec<(NodeId, Id, u32, Id, Vec<u8>)>>,
}

impl Router for RecordingRouter {
    fn get_accepted_frontier(&self, _: NodeId, _: Id, _: u32, _: u64) {}
    fn accepted_frontier(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
    fn get_accepted(&self, _: NodeId, _: Id, _: u32, _: u64, _: Vec<Id>) {}
    fn accepted(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
    fn get(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn get_ancestors(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn put(&self, peer: NodeId, chain_id: Id, request_id: u32, container_id: Id, container: Vec<u8>) {
        self.puts
            .lock()
            .unwrap()
            .push((peer, chain_id, request_id, container_id, container));
    }
    fn multi_put(&self, _: NodeId, _: Id, _: u32, _: Vec<Vec<u8>>) {}
    fn push_query(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id, _: Vec<u8>) {}
    fn pull_query(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn chits(&self, peer: NodeId, chain_id: Id, request_id: u32, container_ids: Vec<Id>) {
        self.chits
            .lock()
            .unwrap()
            .push((peer, chain_id, request_id, container_ids));
    }
}

#[tokio::test]
async fn consensus_traffic_reaches_the_router() {
    let router = Arc::new(RecordingRouter::default());
    let net = Network::new(test_config(), router.clone());
    let (peer, mut remote) = connected_peer(&net, "203.0.113.5:9650").await;

    let chain = Id::with_prefix(9);
    let votes = vec![Id::with_prefix(1), Id::with_prefix(2)];
    write_msg(&mut remote, &Builder.chits(chain, 77, &votes).bytes).await;

    let r = router.clone();
    wait_until(move || !r.chits.lock().unwrap().is_empty()).await;
    let recorded = router.chits.lock().unwrap().clone();
    assert_eq!(recorded, vec![(peer.id, chain, 77, votes)]);

    write_msg(
        &mut remote,
        &Builder.put(chain, 78, Id::with_prefix(3), &[4, 5]).bytes,
    )
    .await;
    let r = router.clone();
    wait_until(move || !r.puts.lock().unwrap().is_empty()).await;
    let puts = router.puts.lock().unwrap().clone();
    assert_eq!(puts, vec![(peer.id, chain, 78, Id::with_prefix(3), vec![4, 5])]);
}

#[tokio::test]
async fn consensus_traffic_is_dropped_before_connected() {
    let router = Arc::new(RecordingRouter::default());
    let net = Network::new(test_config(), router.clone());

    let peer = Peer::new(net.clone(), NodeId::from_addr("203.0.113.5:9650"), None);
    let (local, mut remote) = duplex(1 << 16);
    let started = tokio::spawn(peer.clone().start(local));

    // version only: the handshake is half done
    legacy_remote(&mut remote, 1, false).await;
    started.await.unwrap().unwrap();
    wait_until(|| peer.got_version()).await;

    write_msg(
        &mut remote,
        &Builder.chits(Id::with_prefix(9), 77, &[Id::with_prefix(1)]).bytes,
    )
    .await;

    // the node nudges the handshake instead of routing
    read_until(&mut remote, Op::GetPeerList).await;
    assert!(router.chits.lock().unwrap().is_empty());

    // completing the handshake unblocks routing
    write_msg(&mut remote, &Builder.peer_list(&[]).bytes).await;
    wait_until(|| peer.is_connected()).await;
    write_msg(
        &mut remote,
        &Builder.chits(Id::with_prefix(9), 78, &[Id::with_prefix(1)]).bytes,
    )
    .await;
    let r = router.clone();
    wait_until(move || !r.chits.lock().unwrap().is_empty()).await;
}

// =============================================================================
// WIRE SAFETY
// =============================================================================

#[tokio::test]
async fn oversize_frame_closes_the_peer() {
    let net = test_network();
    let (peer, mut remote) = connected_peer(&net, "203.0.113.5:9650").await;
    let max = net.config().max_message_size;

    // length prefix alone is enough to kill the connection
    remote
        .write_all(&(max + 1).to_be_bytes())
        .await
        .unwrap();

    wait_until(|| peer.is_closed()).await;
    assert!(!net.is_peered(&peer.id).await);
    assert_eq!(net.pending_send_bytes(), 0);
}

#[tokio::test]
async fn garbage_frame_closes_the_peer() {
    let net = test_network();
    let (peer, mut remote) = connected_peer(&net, "203.0.113.5:9650").await;

    write_msg(&mut remote, &[250, 0, 0]).await;
    wait_until(|| peer.is_closed()).await;
}

#[tokio::test]
async fn remote_hangup_closes_the_peer() {
    let net = test_network();
    let (peer, remote) = connected_peer(&net, "203.0.113.5:9650").await;

    drop(remote);
    wait_until(|| peer.is_closed()).await;
    assert!(!net.is_peered(&peer.id).await);
}
