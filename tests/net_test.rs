//! End-to-end tests over real sockets: two networks on localhost find each
//! other, complete the handshake on both sides, and carry consensus traffic.

use glacier::{
    AppVersion, Builder, Id, IpPort, NetConfig, Network, NodeId, NoopRouter, Router,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn node_config(port: u16) -> NetConfig {
    NetConfig {
        network_id: 7,
        // distinct per node so self-connection detection stays out of the way
        node_id: port as u32,
        ip: IpPort::from_socket_addr(format!("127.0.0.1:{}", port).parse().unwrap()),
        version: AppVersion::new("glacier", 1, 0, 4),
        allow_private_ips: true,
        ..NetConfig::default()
    }
}

async fn wait_for_peers(net: &Arc<Network>, count: usize) {
    for _ in 0..500 {
        if net.peer_count().await == count {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} peers, have {}",
        count,
        net.peer_count().await
    );
}

#[derive(Default)]
struct ChitsRouter {
    chits: Mutex<Vec<(NodeId, Id, u32, Vec<Id>)>>,
}

impl Router for ChitsRouter {
    fn get_accepted_frontier(&self, _: NodeId, _: Id, _: u32, _: u64) {}
    fn accepted_frontier(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
    fn get_accepted(&self, _: NodeId, _: Id, _: u32, _: u64, _: Vec<Id>) {}
    fn accepted(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
    fn get(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn get_ancestors(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn put(&self, _: NodeId, _: Id, _: u32, _: Id, _: Vec<u8>) {}
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
async fn two_nodes_connect_and_exchange_votes() {
    let port_a = 19710;
    let port_b = 19711;

    let router_b = Arc::new(ChitsRouter::default());
    let node_a = Network::new(node_config(port_a), Arc::new(NoopRouter));
    let node_b = Network::new(node_config(port_b), router_b.clone());

    node_a.start(port_a).await.unwrap();
    node_b.start(port_b).await.unwrap();

    // seed A with B's address; the modern handshake connects both sides
    let b_addr = IpPort::from_socket_addr(format!("127.0.0.1:{}", port_b).parse().unwrap());
    node_a.track_ip(b_addr).await;

    wait_for_peers(&node_a, 1).await;
    wait_for_peers(&node_b, 1).await;

    // A addresses B by the id it dialed
    let b_id = NodeId::from_addr(&b_addr.to_string());
    assert!(node_a.is_peered(&b_id).await);

    let chain = Id::with_prefix(9);
    let votes = vec![Id::with_prefix(1)];
    assert!(node_a.send(&b_id, Builder.chits(chain, 5, &votes)).await);

    for _ in 0..500 {
        if !router_b.chits.lock().unwrap().is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let recorded = router_b.chits.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].1, chain);
    assert_eq!(recorded[0].2, 5);
    assert_eq!(recorded[0].3, votes);

    node_a.shutdown().await;
    node_b.shutdown().await;
    wait_for_peers(&node_a, 0).await;
    wait_for_peers(&node_b, 0).await;
}

#[tokio::test]
async fn shutdown_closes_peers_and_send_fails() {
    let port_a = 19720;
    let port_b = 19721;

    let node_a = Network::new(node_config(port_a), Arc::new(NoopRouter));
    let node_b = Network::new(node_config(port_b), Arc::new(NoopRouter));
    node_a.start(port_a).await.unwrap();
    node_b.start(port_b).await.unwrap();

    let b_addr = IpPort::from_socket_addr(format!("127.0.0.1:{}", port_b).parse().unwrap());
    node_a.track_ip(b_addr).await;
    wait_for_peers(&node_a, 1).await;

    let b_id = NodeId::from_addr(&b_addr.to_string());
    node_a.shutdown().await;
    wait_for_peers(&node_a, 0).await;
    assert!(!node_a.send(&b_id, Builder.ping()).await);
    assert_eq!(node_a.pending_send_bytes(), 0);

    node_b.shutdown().await;
}
