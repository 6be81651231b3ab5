//! Core network manager
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │    Consensus     │
//!                  └────────┬─────────┘
//!                           │ Router (trait)
//!                  ┌────────▼─────────┐
//!                  │     Network      │ ◄── this module
//!                  └────────┬─────────┘
//!                           │ one per connection
//!                  ┌────────▼─────────┐
//!                  │      Peer        │  reader / writer / tickers
//!                  └──────────────────┘
//! ```
//!
//! The `Network` owns the single state lock: the id → peer registry, the
//! per-peer next-session-id map used to arbitrate reconnects, the
//! disconnected-IP retry set, the set of addresses known to be our own, and
//! the gossiped validator IP list. Peers call back into it through
//! `track` / `on_peer_connected` / `disconnected`, each of which takes (or is
//! handed) that lock itself.
//!
//! # Key Invariants
//!
//! 1. `peers` holds at most one live peer per id; a supplanting connection
//!    closes the old peer before storing itself.
//! 2. `next_session_id[id]` never decreases and advances past every session
//!    id accepted from or advertised to that peer.
//! 3. `pending_bytes` equals the sum of all per-peer send queue bytes.

use super::builder::Builder;
use super::message::OutboundMessage;
use super::packer::WireError;
use super::peer::Peer;
use super::router::Router;
use super::types::*;
use super::metrics::NetMetrics;
use crate::types::NodeId;
use crate::version::{AppVersion, VersionError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, trace};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("already peered")]
    AlreadyPeered,
    #[error("peer is myself")]
    PeerIsMyself,
    #[error("expected a version message")]
    VersionExpected,
    #[error("expected a version nak message")]
    VersionNakExpected,
    #[error("handshake read timed out")]
    Timeout,
    #[error("connection closed during handshake")]
    Eof,
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time view of the network state, for status reporting and tests.
#[derive(Debug, Clone)]
pub struct NetStats {
    pub peers: usize,
    pub tracked_ips: Vec<String>,
    pub my_ips: Vec<String>,
    pub pending_send_bytes: i64,
}

/// Network configuration. Every knob the connection layer consults.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Network we belong to; peers on other networks are rejected.
    pub network_id: u32,
    /// Random per-process nonce for self-connection detection.
    pub node_id: u32,
    /// Our advertised reachable address.
    pub ip: IpPort,
    /// Our application version, exchanged in the handshake.
    pub version: AppVersion,
    pub read_buffer_size: usize,
    pub max_message_size: u32,
    pub send_queue_size: usize,
    pub read_peer_version_timeout: std::time::Duration,
    pub get_version_timeout: std::time::Duration,
    pub ping_frequency: std::time::Duration,
    pub ping_pong_timeout: std::time::Duration,
    pub max_clock_difference: std::time::Duration,
    pub max_network_pending_send_bytes: i64,
    pub network_pending_send_bytes_to_rate_limit: i64,
    pub allow_private_ips: bool,
    /// Operator-designated peers that get relaxed version treatment.
    pub beacons: HashSet<NodeId>,
    pub dial_timeout: std::time::Duration,
    pub redial_frequency: std::time::Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            node_id: rand::random(),
            ip: IpPort::zero(),
            version: AppVersion::new("glacier", 1, 0, 4),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            read_peer_version_timeout: std::time::Duration::from_secs(
                DEFAULT_READ_PEER_VERSION_TIMEOUT_SECS,
            ),
            get_version_timeout: std::time::Duration::from_secs(DEFAULT_GET_VERSION_TIMEOUT_SECS),
            ping_frequency: std::time::Duration::from_secs(DEFAULT_PING_FREQUENCY_SECS),
            ping_pong_timeout: std::time::Duration::from_secs(DEFAULT_PING_PONG_TIMEOUT_SECS),
            max_clock_difference: std::time::Duration::from_secs(
                DEFAULT_MAX_CLOCK_DIFFERENCE_SECS,
            ),
            max_network_pending_send_bytes: DEFAULT_MAX_NETWORK_PENDING_SEND_BYTES,
            network_pending_send_bytes_to_rate_limit:
                DEFAULT_NETWORK_PENDING_SEND_BYTES_TO_RATE_LIMIT,
            allow_private_ips: false,
            beacons: HashSet::new(),
            dial_timeout: std::time::Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            redial_frequency: std::time::Duration::from_secs(DEFAULT_REDIAL_FREQUENCY_SECS),
        }
    }
}

/// Everything guarded by the network's single state lock.
#[derive(Default)]
pub(crate) struct NetState {
    pub peers: HashMap<NodeId, Arc<Peer>>,
    pub next_session_id: HashMap<NodeId, u32>,
    /// Addresses we know about but are not connected to; the redial sweep
    /// retries these. `discard_ip` removes an address to stop the retries.
    pub disconnected_ips: HashSet<String>,
    /// Addresses observed to be our own (self-connection detection).
    pub my_ips: HashSet<String>,
    /// Dials currently in flight, to avoid doubling up.
    pub connecting: HashSet<String>,
    /// Current validator addresses, gossiped in PeerList / VersionNak.
    pub validator_ips: Vec<IpPort>,
}

/// Process-wide registry of live peers and shared backpressure counters.
pub struct Network {
    pub(crate) config: NetConfig,
    /// Our own short id, derived from the advertised address. The handshake
    /// compares asserted peer ids against this.
    pub(crate) local_id: NodeId,
    pub(crate) version_peer_nak: AppVersion,
    pub(crate) builder: Builder,
    pub(crate) state: Mutex<NetState>,
    /// Total bytes enqueued across all peers.
    pub(crate) pending_bytes: AtomicI64,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) metrics: NetMetrics,
    shutdown: AtomicBool,
}

impl Network {
    pub fn new(config: NetConfig, router: Arc<dyn Router>) -> Arc<Self> {
        let local_id = NodeId::from_addr(&config.ip.to_string());
        let version_peer_nak = version_peer_nak(&config.version.app);
        Arc::new(Self {
            config,
            local_id,
            version_peer_nak,
            builder: Builder,
            state: Mutex::new(NetState::default()),
            pending_bytes: AtomicI64::new(0),
            router,
            metrics: NetMetrics::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn metrics(&self) -> &NetMetrics {
        &self.metrics
    }

    pub fn pending_send_bytes(&self) -> i64 {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    /// Bind the listener and start the accept and redial loops.
    pub async fn start(self: &Arc<Self>, listen_port: u16) -> Result<(), NetError> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        info!(port = listen_port, "listening for peers");

        let net = self.clone();
        tokio::spawn(async move {
            net.listener_loop(listener).await;
        });

        let net = self.clone();
        tokio::spawn(async move {
            net.redial_loop().await;
        });

        Ok(())
    }

    async fn listener_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    let remote = IpPort::from_socket_addr(addr);
                    debug!(%remote, "incoming connection");
                    let id = NodeId::from_addr(&remote.to_string());
                    let net = self.clone();
                    tokio::spawn(async move {
                        let peer = Peer::new(net, id, Some(remote));
                        if let Err(e) = peer.clone().start(stream).await {
                            debug!(%remote, "inbound handshake failed: {}", e);
                            peer.close().await;
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    /// Periodically re-track every address still in the retry set.
    async fn redial_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.redial_frequency);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let retry: Vec<String> = {
                let state = self.state.lock().await;
                state.disconnected_ips.iter().cloned().collect()
            };
            for addr in retry {
                if let Ok(sa) = addr.parse::<std::net::SocketAddr>() {
                    let ip = IpPort::from_socket_addr(sa);
                    let mut state = self.state.lock().await;
                    self.track(&mut state, ip);
                }
            }
        }
    }

    /// Record an address and, unless it is already being handled, dial it.
    /// Must be called with the state lock held (it is passed in).
    pub(crate) fn track(self: &Arc<Self>, state: &mut NetState, ip: IpPort) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if ip.is_zero() || ip.same_addr(&self.config.ip) {
            return;
        }
        let key = ip.to_string();
        if state.my_ips.contains(&key) {
            return;
        }
        // already connected to this address; nothing left to retry
        if state
            .peers
            .values()
            .any(|p| p.get_ip().is_some_and(|pip| pip.same_addr(&ip)))
        {
            state.disconnected_ips.remove(&key);
            return;
        }
        if !state.connecting.insert(key.clone()) {
            return;
        }
        state.disconnected_ips.insert(key);

        let net = self.clone();
        tokio::spawn(async move {
            net.dial(ip).await;
        });
    }

    /// Public entry point for seeding addresses.
    pub async fn track_ip(self: &Arc<Self>, ip: IpPort) {
        let mut state = self.state.lock().await;
        self.track(&mut state, ip);
    }

    async fn dial(self: Arc<Self>, ip: IpPort) {
        let key = ip.to_string();
        debug!(%ip, "dialing");

        let connect = timeout(
            self.config.dial_timeout,
            TcpStream::connect(ip.socket_addr()),
        )
        .await;

        match connect {
            Ok(Ok(stream)) => {
                let remote = stream
                    .peer_addr()
                    .ok()
                    .map(IpPort::from_socket_addr)
                    .unwrap_or(ip);
                let id = NodeId::from_addr(&key);
                let peer = Peer::new(self.clone(), id, Some(remote));
                peer.set_ip(ip);
                if let Err(e) = peer.clone().start(stream).await {
                    debug!(%ip, "handshake failed: {}", e);
                    peer.close().await;
                }
            }
            Ok(Err(e)) => {
                debug!(%ip, "connect failed: {}", e);
            }
            Err(_) => {
                debug!(%ip, "connect timed out");
            }
        }

        let mut state = self.state.lock().await;
        state.connecting.remove(&key);
    }

    pub async fn stats(&self) -> NetStats {
        let state = self.state.lock().await;
        NetStats {
            peers: state.peers.len(),
            tracked_ips: state.disconnected_ips.iter().cloned().collect(),
            my_ips: state.my_ips.iter().cloned().collect(),
            pending_send_bytes: self.pending_bytes.load(Ordering::SeqCst),
        }
    }

    pub async fn is_peered(&self, id: &NodeId) -> bool {
        self.state.lock().await.peers.contains_key(id)
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn validator_ips(&self) -> Vec<IpPort> {
        self.state.lock().await.validator_ips.clone()
    }

    pub async fn add_validator_ip(&self, ip: IpPort) {
        let mut state = self.state.lock().await;
        if !state.validator_ips.contains(&ip) {
            state.validator_ips.push(ip);
        }
    }

    pub async fn remove_validator_ip(&self, ip: &IpPort) {
        let mut state = self.state.lock().await;
        state.validator_ips.retain(|v| v != ip);
    }

    /// Send a message to a connected peer. Returns false when the peer is
    /// unknown or its queue refused the message.
    pub async fn send(&self, id: &NodeId, msg: OutboundMessage) -> bool {
        let peer = self.state.lock().await.peers.get(id).cloned();
        match peer {
            Some(peer) => peer.send(msg),
            None => false,
        }
    }

    /// Send a message to every connected peer, returning how many queues
    /// accepted it.
    pub async fn broadcast(&self, msg: OutboundMessage) -> usize {
        let peers: Vec<Arc<Peer>> = self.state.lock().await.peers.values().cloned().collect();
        peers.iter().filter(|p| p.send(msg.clone())).count()
    }

    /// Called by `try_mark_connected` with the state lock held, right after
    /// the peer registered itself.
    pub(crate) fn on_peer_connected(&self, state: &mut NetState, peer: &Arc<Peer>) {
        if let Some(ip) = peer.get_ip() {
            state.disconnected_ips.remove(&ip.to_string());
            info!(peer = %peer.id, %ip, "connected");
        } else {
            info!(peer = %peer.id, "connected");
        }
    }

    /// Final step of a peer's close sequence.
    pub(crate) async fn disconnected(self: &Arc<Self>, peer: &Arc<Peer>) {
        let mut state = self.state.lock().await;

        let was_registered = match state.peers.get(&peer.id) {
            Some(existing) => Arc::ptr_eq(existing, peer),
            None => false,
        };
        if was_registered {
            state.peers.remove(&peer.id);
            self.metrics
                .num_peers
                .store(state.peers.len(), Ordering::SeqCst);
            info!(peer = %peer.id, "disconnected");
        } else {
            trace!(peer = %peer.id, "connection closed");
        }

        // a discarded IP was already cleared and stays forgotten; anything
        // else goes back into the retry set
        if let Some(ip) = peer.get_ip() {
            self.track(&mut state, ip);
        }
    }

    /// Stop accepting and dialing, and close every live peer.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::SeqCst);
        let peers: Vec<Arc<Peer>> = {
            let state = self.state.lock().await;
            state.peers.values().cloned().collect()
        };
        for peer in peers {
            peer.close().await;
        }
        info!("network shut down");
    }
}
