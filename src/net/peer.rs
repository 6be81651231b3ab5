//! Per-connection peer state machine
//!
//! One `Peer` owns one byte stream. A fresh connection first runs a short
//! synchronous exchange (send `Version`, read one frame) that decides between
//! two counterparty generations: a legacy peer that completes the handshake
//! reactively through the dispatcher, and a modern peer that finishes a
//! `Version`/`VersionNak` round trip before regular traffic begins. After the
//! synchronous phase, three cooperating tasks run per connection: a reader, a
//! writer draining the bounded send queue, and a ping ticker (plus a
//! handshake-completion ticker until the peer is connected).
//!
//! Shutdown has exactly one path, `close`, and it is idempotent: it flips the
//! ticker-closer, marks the peer closed, drops the send queue's producer so
//! the writer terminates, and notifies the network. All tasks observe one of
//! those signals and exit within one select round.

use super::message::{Message, NakCode, OutboundMessage};
use super::packer::Framer;
use super::protocol::{HandshakeError, Network};
use super::types::IpPort;
use crate::types::{now, NodeId};
use crate::version::AppVersion;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

pub struct Peer {
    net: Arc<Network>,

    /// Asserted identity of the remote node, set at construction.
    pub id: NodeId,

    /// Address of the other end of the socket, when known. Used to sanity
    /// check a self-reported IP before accepting it.
    remote: Option<IpPort>,

    // Handshake flags. Written by the connection's reader task (or the
    // synchronous handshake running before it); read anywhere.
    got_version: AtomicBool,
    got_peer_list: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,

    // Guards the do-once close sequence.
    close_started: AtomicBool,

    /// Bytes currently sitting in the send queue.
    pending_bytes: AtomicI64,

    /// Producer side of the send queue. Enqueue happens under this lock
    /// after observing `!closed`; `close` takes the lock after setting
    /// `closed` and drops the producer, so no send can race the close.
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Consumer side, taken once by the writer task.
    sender_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,

    /// Advertised reachable address. May be cleared ("discarded").
    ip: RwLock<Option<IpPort>>,

    /// The peer's version once a valid `Version` has been received.
    version: RwLock<Option<AppVersion>>,

    last_sent: AtomicI64,
    last_received: AtomicI64,

    /// Session id carried in the peer's `Version` message.
    incoming_session_id: AtomicU32,

    /// Flipped true exactly once, by `close`. Terminates the tickers and
    /// unblocks the reader and writer.
    ticker_closer: watch::Sender<bool>,
}

impl Peer {
    pub fn new(net: Arc<Network>, id: NodeId, remote: Option<IpPort>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(net.config.send_queue_size);
        let (closer, _) = watch::channel(false);
        Arc::new(Self {
            net,
            id,
            remote,
            got_version: AtomicBool::new(false),
            got_peer_list: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            pending_bytes: AtomicI64::new(0),
            sender: Mutex::new(Some(tx)),
            sender_rx: Mutex::new(Some(rx)),
            ip: RwLock::new(None),
            version: RwLock::new(None),
            last_sent: AtomicI64::new(0),
            last_received: AtomicI64::new(0),
            incoming_session_id: AtomicU32::new(0),
            ticker_closer: closer,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn got_version(&self) -> bool {
        self.got_version.load(Ordering::SeqCst)
    }

    pub fn got_peer_list(&self) -> bool {
        self.got_peer_list.load(Ordering::SeqCst)
    }

    pub fn pending_bytes(&self) -> i64 {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    pub fn last_sent(&self) -> i64 {
        self.last_sent.load(Ordering::SeqCst)
    }

    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::SeqCst)
    }

    pub fn get_ip(&self) -> Option<IpPort> {
        *self.ip.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_ip(&self, ip: IpPort) {
        *self.ip.write().unwrap_or_else(|e| e.into_inner()) = Some(ip);
    }

    /// Clear the stored IP, returning it if it was set and nonzero.
    fn take_ip(&self) -> Option<IpPort> {
        let mut guard = self.ip.write().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(ip) if !ip.is_zero() => Some(ip),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<AppVersion> {
        self.version.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // =========================================================================
    // SYNCHRONOUS HANDSHAKE
    // =========================================================================

    /// Run the initial handshake exchange on a fresh stream, then hand the
    /// stream halves over to the background tasks. Both ends of a new
    /// connection run this.
    pub async fn start<S>(self: Arc<Self>, stream: S) -> Result<(), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut framer = Framer::new(self.net.config.max_message_size);
        let deadline = Instant::now() + self.net.config.read_peer_version_timeout;

        // advertise ourselves, then read the counterparty's opening frame
        let version = self.build_version().await;
        write_frame(&mut writer, &version.bytes).await?;

        let first = match self.read_frame(&mut reader, &mut framer, deadline).await {
            Ok(payload) => payload,
            Err(HandshakeError::Eof) => {
                // the remote probably hung up because it already has a live
                // connection to us
                if self.net.is_peered(&self.id).await {
                    return Err(HandshakeError::AlreadyPeered);
                }
                return Err(HandshakeError::Eof);
            }
            Err(e) => return Err(e),
        };

        let msg = self.net.builder.parse(&first)?;
        match msg {
            Message::PeerList { .. } => {
                // a legacy peer that opened with its address book
                if self.id == self.net.local_id {
                    return Err(HandshakeError::PeerIsMyself);
                }
                self.handle(msg).await;
                self.spawn_tasks(reader, writer, framer, true);
                self.send_get_version();
                Ok(())
            }
            Message::Version {
                session_id,
                ip,
                ref version_str,
                ..
            } => {
                let peer_version = AppVersion::parse(version_str)?;
                if peer_version.before(&self.net.version_peer_nak) {
                    // legacy peer: process the version reactively and finish
                    // the handshake through the dispatcher
                    if self.id == self.net.local_id {
                        return Err(HandshakeError::PeerIsMyself);
                    }
                    self.handle(msg).await;
                    self.spawn_tasks(reader, writer, framer, true);
                    self.send_get_peer_list();
                    Ok(())
                } else {
                    self.set_ip(ip);
                    *self.version.write().unwrap_or_else(|e| e.into_inner()) =
                        Some(peer_version);
                    self.incoming_session_id.store(session_id, Ordering::SeqCst);
                    self.process_version_nak(reader, writer, framer, deadline)
                        .await
                }
            }
            other => {
                debug!(peer = %self.id, op = %other.op(), "expected a version message");
                Err(HandshakeError::VersionExpected)
            }
        }
    }

    /// Modern arbitration: reply with a `VersionNak` verdict and, on success,
    /// read the counterparty's verdict before going live.
    async fn process_version_nak<R, W>(
        self: Arc<Self>,
        mut reader: R,
        mut writer: W,
        mut framer: Framer,
        deadline: Instant,
    ) -> Result<(), HandshakeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.id == self.net.local_id {
            let nak = self.net.builder.version_nak(NakCode::SelfPeered, &[]);
            if let Err(e) = write_frame(&mut writer, &nak.bytes).await {
                trace!(peer = %self.id, "unable to send version nak: {}", e);
            }
            return Err(HandshakeError::PeerIsMyself);
        }

        if self.net.is_peered(&self.id).await {
            let nak = self.net.builder.version_nak(NakCode::AlreadyPeered, &[]);
            if let Err(e) = write_frame(&mut writer, &nak.bytes).await {
                trace!(peer = %self.id, "unable to send version nak: {}", e);
            }
            return Err(HandshakeError::AlreadyPeered);
        }

        let ips = self.net.validator_ips().await;
        let nak = self.net.builder.version_nak(NakCode::Success, &ips);
        write_frame(&mut writer, &nak.bytes).await?;

        let reply = self.read_frame(&mut reader, &mut framer, deadline).await?;
        let (code, peers) = match self.net.builder.parse(&reply)? {
            Message::VersionNak { code, peers } => (code, peers),
            other => {
                debug!(peer = %self.id, op = %other.op(), "expected a version nak");
                return Err(HandshakeError::VersionNakExpected);
            }
        };

        match code {
            NakCode::AlreadyPeered => return Err(HandshakeError::AlreadyPeered),
            NakCode::SelfPeered => return Err(HandshakeError::PeerIsMyself),
            NakCode::Success => {}
        }

        // we now have the version and the peer list in one round trip
        self.got_version.store(true, Ordering::SeqCst);
        self.got_peer_list.store(true, Ordering::SeqCst);
        self.try_mark_connected().await;

        self.spawn_tasks(reader, writer, framer, false);

        let peer = self.clone();
        tokio::spawn(async move {
            peer.track_ips(peers).await;
        });

        Ok(())
    }

    /// Read one complete frame before `deadline`, feeding the framer from the
    /// stream as needed. Residual bytes stay buffered for the reader task.
    async fn read_frame<R>(
        &self,
        reader: &mut R,
        framer: &mut Framer,
        deadline: Instant,
    ) -> Result<Vec<u8>, HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.net.config.read_buffer_size];
        loop {
            if let Some(payload) = framer.next_frame()? {
                return Ok(payload);
            }
            let read = timeout_at(deadline, reader.read(&mut buf))
                .await
                .map_err(|_| HandshakeError::Timeout)??;
            if read == 0 {
                return Err(HandshakeError::Eof);
            }
            framer.feed(&buf[..read]);
        }
    }

    fn spawn_tasks<R, W>(self: &Arc<Self>, reader: R, writer: W, framer: Framer, handshaking: bool)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = self.clone();
        tokio::spawn(async move {
            peer.read_messages(reader, framer).await;
        });

        let peer = self.clone();
        tokio::spawn(async move {
            peer.write_messages(writer).await;
        });

        let peer = self.clone();
        tokio::spawn(async move {
            peer.send_pings().await;
        });

        if handshaking {
            let peer = self.clone();
            tokio::spawn(async move {
                peer.request_finish_handshake().await;
            });
        }
    }

    // =========================================================================
    // READER TASK
    // =========================================================================

    async fn read_messages<R>(self: Arc<Self>, mut reader: R, mut framer: Framer)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut closer = self.ticker_closer.subscribe();
        let mut buf = vec![0u8; self.net.config.read_buffer_size];
        let mut deadline = Instant::now() + self.net.config.ping_pong_timeout;

        loop {
            // drain whatever frames are already buffered (including residue
            // from the synchronous handshake reads)
            loop {
                match framer.next_frame() {
                    Ok(Some(payload)) => {
                        if !self.dispatch_frame(&payload, &mut deadline).await {
                            self.close().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        trace!(peer = %self.id, "terminating connection: {}", e);
                        self.close().await;
                        return;
                    }
                }
            }

            let read = tokio::select! {
                _ = closer.wait_for(|closed| *closed) => return,
                r = timeout_at(deadline, reader.read(&mut buf)) => r,
            };

            match read {
                Err(_) => {
                    trace!(peer = %self.id, "read deadline expired");
                    self.close().await;
                    return;
                }
                Ok(Err(e)) => {
                    trace!(peer = %self.id, "error on connection read: {}", e);
                    self.close().await;
                    return;
                }
                Ok(Ok(0)) => {
                    trace!(peer = %self.id, "connection closed by remote");
                    self.close().await;
                    return;
                }
                Ok(Ok(n)) => framer.feed(&buf[..n]),
            }
        }
    }

    /// Parse and dispatch one frame. Returns false when the connection must
    /// be terminated.
    async fn dispatch_frame(self: &Arc<Self>, payload: &[u8], deadline: &mut Instant) -> bool {
        let msg = match self.net.builder.parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %self.id, "failed to parse message: {}", e);
                return false;
            }
        };

        *deadline = Instant::now() + self.net.config.ping_pong_timeout;
        self.handle(msg).await;
        true
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    async fn handle(self: &Arc<Self>, msg: Message) {
        self.last_received.store(now() as i64, Ordering::SeqCst);
        self.net.metrics.received(msg.op());

        match msg {
            Message::GetVersion => self.send_version().await,
            Message::Version {
                network_id,
                node_id,
                session_id,
                my_time,
                ip,
                version_str,
            } => {
                self.on_version(network_id, node_id, session_id, my_time, ip, &version_str)
                    .await
            }
            Message::GetPeerList => {
                if self.got_version.load(Ordering::SeqCst) {
                    self.send_peer_list().await;
                }
            }
            Message::PeerList { peers } => self.on_peer_list(peers).await,
            Message::Ping => {
                self.send_pong();
            }
            Message::Pong => {}
            Message::VersionNak { .. } => {
                // only meaningful during the synchronous exchange
                debug!(peer = %self.id, "unexpected version nak");
            }
            consensus => {
                if !self.connected.load(Ordering::SeqCst) {
                    debug!(
                        peer = %self.id,
                        op = %consensus.op(),
                        "dropping message: connection not yet established"
                    );
                    // nudge the handshake along
                    if !self.got_version.load(Ordering::SeqCst) {
                        self.send_get_version();
                    }
                    if !self.got_peer_list.load(Ordering::SeqCst) {
                        self.send_get_peer_list();
                    }
                    return;
                }
                self.route(consensus);
            }
        }
    }

    fn route(&self, msg: Message) {
        let router = &self.net.router;
        match msg {
            Message::GetAcceptedFrontier {
                chain_id,
                request_id,
                deadline,
            } => router.get_accepted_frontier(self.id, chain_id, request_id, deadline),
            Message::AcceptedFrontier {
                chain_id,
                request_id,
                container_ids,
            } => router.accepted_frontier(self.id, chain_id, request_id, container_ids),
            Message::GetAccepted {
                chain_id,
                request_id,
                deadline,
                container_ids,
            } => router.get_accepted(self.id, chain_id, request_id, deadline, container_ids),
            Message::Accepted {
                chain_id,
                request_id,
                container_ids,
            } => router.accepted(self.id, chain_id, request_id, container_ids),
            Message::Get {
                chain_id,
                request_id,
                deadline,
                container_id,
            } => router.get(self.id, chain_id, request_id, deadline, container_id),
            Message::GetAncestors {
                chain_id,
                request_id,
                deadline,
                container_id,
            } => router.get_ancestors(self.id, chain_id, request_id, deadline, container_id),
            Message::Put {
                chain_id,
                request_id,
                container_id,
                container,
            } => router.put(self.id, chain_id, request_id, container_id, container),
            Message::MultiPut {
                chain_id,
                request_id,
                containers,
            } => router.multi_put(self.id, chain_id, request_id, containers),
            Message::PushQuery {
                chain_id,
                request_id,
                deadline,
                container_id,
                container,
            } => router.push_query(
                self.id,
                chain_id,
                request_id,
                deadline,
                container_id,
                container,
            ),
            Message::PullQuery {
                chain_id,
                request_id,
                deadline,
                container_id,
            } => router.pull_query(self.id, chain_id, request_id, deadline, container_id),
            Message::Chits {
                chain_id,
                request_id,
                container_ids,
            } => router.chits(self.id, chain_id, request_id, container_ids),
            _ => {}
        }
    }

    // =========================================================================
    // HANDSHAKE HANDLERS (reactive path)
    // =========================================================================

    async fn on_version(
        self: &Arc<Self>,
        network_id: u32,
        node_id: u32,
        session_id: u32,
        my_time: u64,
        ip: IpPort,
        version_str: &str,
    ) {
        if self.got_version.load(Ordering::SeqCst) {
            trace!(peer = %self.id, "dropping duplicated version message");
            return;
        }

        if network_id != self.net.config.network_id {
            debug!(
                peer = %self.id,
                theirs = network_id,
                ours = self.net.config.network_id,
                "network id mismatch"
            );
            self.discard_ip().await;
            return;
        }

        if node_id == self.net.config.node_id {
            debug!(peer = %self.id, "peer's node id matches ours");
            self.discard_my_ip().await;
            return;
        }

        let our_time = now();
        let skew = our_time.abs_diff(my_time);
        if skew > self.net.config.max_clock_difference.as_secs() {
            if self.net.config.beacons.contains(&self.id) {
                warn!(
                    peer = %self.id,
                    theirs = my_time,
                    ours = our_time,
                    "beacon's clock is too far out of sync with ours"
                );
            } else {
                debug!(
                    peer = %self.id,
                    theirs = my_time,
                    ours = our_time,
                    "peer's clock is too far out of sync with ours"
                );
            }
            self.discard_ip().await;
            return;
        }

        let peer_version = match AppVersion::parse(version_str) {
            Ok(v) => v,
            Err(e) => {
                debug!(peer = %self.id, "could not parse peer version: {}", e);
                self.discard_ip().await;
                return;
            }
        };

        if self.net.config.version.before(&peer_version) {
            if self.net.config.beacons.contains(&self.id) {
                info!(
                    peer = %self.id,
                    version = %peer_version,
                    "beacon is running a newer version; consider updating"
                );
            } else {
                debug!(
                    peer = %self.id,
                    version = %peer_version,
                    "peer is running a newer version; consider updating"
                );
            }
        }

        if let Err(e) = self.net.config.version.compatible(&peer_version) {
            if !self.net.config.beacons.contains(&self.id) {
                debug!(peer = %self.id, "peer version not compatible: {}", e);
                self.discard_ip().await;
                return;
            }
            info!(
                peer = %self.id,
                version = %peer_version,
                "allowing beacon to connect with an incompatible version"
            );
        }

        // Reconnect arbitration: an established registry entry is supplanted
        // only by a fresh session (id 0 means the peer restarted) or a newer
        // one. A stale id is a leftover dial racing a live connection.
        let (next_session, is_connected) = {
            let state = self.net.state.lock().await;
            (
                state.next_session_id.get(&self.id).copied().unwrap_or(0),
                state.peers.contains_key(&self.id),
            )
        };
        if is_connected && session_id != 0 && session_id < next_session {
            debug!(
                peer = %self.id,
                incoming = session_id,
                ours = next_session,
                "dropping stale reconnect"
            );
            self.discard_ip().await;
            return;
        }

        if self.get_ip().is_none() {
            // accept a self-reported address only when it matches the
            // address the connection actually comes from
            if let Some(remote) = self.remote {
                if ip.as_v6() == remote.as_v6() {
                    self.set_ip(ip);
                }
            }
        }

        self.send_peer_list().await;

        *self.version.write().unwrap_or_else(|e| e.into_inner()) = Some(peer_version);
        self.got_version.store(true, Ordering::SeqCst);
        self.incoming_session_id.store(session_id, Ordering::SeqCst);
        self.try_mark_connected().await;
    }

    async fn on_peer_list(self: &Arc<Self>, peers: Vec<IpPort>) {
        self.got_peer_list.store(true, Ordering::SeqCst);
        self.try_mark_connected().await;
        self.track_ips(peers).await;
    }

    /// Hand gossiped addresses to the network, filtered by the own-IP, zero
    /// and private-address policies. The state lock is taken per address.
    async fn track_ips(self: &Arc<Self>, ips: Vec<IpPort>) {
        for ip in ips {
            if ip.is_zero()
                || ip.same_addr(&self.net.config.ip)
                || (!self.net.config.allow_private_ips && ip.is_private())
            {
                continue;
            }
            let mut state = self.net.state.lock().await;
            self.net.track(&mut state, ip);
        }
    }

    /// Promote this peer to connected once both handshake messages are in,
    /// supplanting any previous connection registered under the same id.
    pub(crate) async fn try_mark_connected(self: &Arc<Self>) {
        if self.connected.load(Ordering::SeqCst)
            || !self.got_version.load(Ordering::SeqCst)
            || !self.got_peer_list.load(Ordering::SeqCst)
        {
            return;
        }

        let mut state = self.net.state.lock().await;
        if self.closed.load(Ordering::SeqCst) || self.connected.load(Ordering::SeqCst) {
            return;
        }

        if let Some(old) = state.peers.get(&self.id).cloned() {
            if !Arc::ptr_eq(&old, self) {
                // closing the old peer re-enters the network state through
                // its disconnected hook, so the lock is released around it
                drop(state);
                old.close().await;
                state = self.net.state.lock().await;
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
            }
        }

        self.connected.store(true, Ordering::SeqCst);

        // the next connection with this peer must present a newer session
        let entry = state.next_session_id.entry(self.id).or_insert(0);
        let incoming = self.incoming_session_id.load(Ordering::SeqCst);
        if incoming > *entry {
            *entry = incoming;
        }
        *entry = entry.wrapping_add(1);

        state.peers.insert(self.id, self.clone());
        self.net
            .metrics
            .num_peers
            .store(state.peers.len(), Ordering::SeqCst);
        self.net.on_peer_connected(&mut state, self);
    }

    // =========================================================================
    // WRITER TASK
    // =========================================================================

    async fn write_messages<W>(self: Arc<Self>, mut writer: W)
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut closer = self.ticker_closer.subscribe();
        let rx = self.sender_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut rx) = rx else { return };

        loop {
            let msg = tokio::select! {
                _ = closer.wait_for(|closed| *closed) => break,
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };

            // the bytes leave the queue now, whatever the write outcome
            let len = msg.len() as i64;
            self.pending_bytes.fetch_sub(len, Ordering::SeqCst);
            self.net.pending_bytes.fetch_sub(len, Ordering::SeqCst);

            let written = tokio::select! {
                _ = closer.wait_for(|closed| *closed) => break,
                r = write_frame(&mut writer, &msg) => r,
            };
            if let Err(e) = written {
                trace!(peer = %self.id, "error writing to peer: {}", e);
                break;
            }
            self.last_sent.store(now() as i64, Ordering::SeqCst);
        }

        self.close().await;

        // close dropped the queue's producer; balance the counters for
        // anything that never reached the wire
        while let Ok(msg) = rx.try_recv() {
            let len = msg.len() as i64;
            self.pending_bytes.fetch_sub(len, Ordering::SeqCst);
            self.net.pending_bytes.fetch_sub(len, Ordering::SeqCst);
        }
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Enqueue a message for sending. Never blocks on the queue: a closed
    /// peer, an over-budget connection or a full queue drop the message and
    /// return false.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        let op = msg.op;
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());

        if self.closed.load(Ordering::SeqCst) {
            debug!(peer = %self.id, "dropping message to a closed connection");
            self.net.metrics.failed(op);
            return false;
        }

        if self.drop_message_peer() {
            debug!(peer = %self.id, "dropping message: send queue over budget");
            self.net.metrics.failed(op);
            return false;
        }

        let len = msg.bytes.len() as i64;

        // assume the send will succeed and charge the network up front; the
        // charge is reverted on any drop below
        let new_network_pending = self.net.pending_bytes.fetch_add(len, Ordering::SeqCst) + len;
        let new_conn_pending = self.pending_bytes.load(Ordering::SeqCst) + len;

        if drop_message(
            self.pending_bytes.load(Ordering::SeqCst),
            new_conn_pending,
            new_network_pending,
            self.net.config.max_message_size as i64,
            self.net.config.max_network_pending_send_bytes,
            self.net.config.network_pending_send_bytes_to_rate_limit,
        ) {
            self.net.pending_bytes.fetch_sub(len, Ordering::SeqCst);
            debug!(peer = %self.id, "dropping message: network send backlog over budget");
            self.net.metrics.failed(op);
            return false;
        }

        let sent = match guard.as_ref() {
            Some(tx) => tx.try_send(msg.bytes).is_ok(),
            None => false,
        };
        if sent {
            self.pending_bytes.fetch_add(len, Ordering::SeqCst);
            self.net.metrics.sent(op);
            true
        } else {
            self.net.pending_bytes.fetch_sub(len, Ordering::SeqCst);
            debug!(peer = %self.id, "dropping message: send queue full");
            self.net.metrics.failed(op);
            false
        }
    }

    fn drop_message_peer(&self) -> bool {
        self.pending_bytes.load(Ordering::SeqCst) > self.net.config.max_message_size as i64
    }

    // =========================================================================
    // TICKERS
    // =========================================================================

    async fn send_pings(self: Arc<Self>) {
        let mut closer = self.ticker_closer.subscribe();
        let period = self.net.config.ping_frequency;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    self.send_ping();
                }
                _ = closer.wait_for(|closed| *closed) => return,
            }
        }
    }

    /// Re-request whatever handshake message is still missing until the peer
    /// is connected or gone.
    async fn request_finish_handshake(self: Arc<Self>) {
        let mut closer = self.ticker_closer.subscribe();
        let period = self.net.config.get_version_timeout;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.connected.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if !self.got_version.load(Ordering::SeqCst) {
                        self.send_get_version();
                    }
                    if !self.got_peer_list.load(Ordering::SeqCst) {
                        self.send_get_peer_list();
                    }
                }
                _ = closer.wait_for(|closed| *closed) => return,
            }
        }
    }

    // =========================================================================
    // OUTBOUND MESSAGES
    // =========================================================================

    async fn build_version(&self) -> OutboundMessage {
        let session_id = {
            let state = self.net.state.lock().await;
            state.next_session_id.get(&self.id).copied().unwrap_or(0)
        };
        self.net.builder.version(
            self.net.config.network_id,
            self.net.config.node_id,
            session_id,
            now(),
            self.net.config.ip,
            &self.net.config.version.to_string(),
        )
    }

    pub(crate) async fn send_version(&self) {
        let msg = self.build_version().await;
        self.send(msg);
    }

    pub(crate) fn send_get_version(&self) {
        self.send(self.net.builder.get_version());
    }

    pub(crate) fn send_get_peer_list(&self) {
        self.send(self.net.builder.get_peer_list());
    }

    pub(crate) async fn send_peer_list(&self) {
        let ips = self.net.validator_ips().await;
        self.send(self.net.builder.peer_list(&ips));
    }

    fn send_ping(&self) {
        self.send(self.net.builder.ping());
    }

    fn send_pong(&self) {
        self.send(self.net.builder.pong());
    }

    // =========================================================================
    // CLOSE AND IP HYGIENE
    // =========================================================================

    /// Tear the connection down. Idempotent; this is the only shutdown path.
    pub async fn close(self: &Arc<Self>) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }

        // stop the tickers and unblock the reader and writer; the tasks drop
        // the stream halves as they exit, which closes the connection
        let _ = self.ticker_closer.send(true);

        self.closed.store(true, Ordering::SeqCst);

        {
            // the lock guarantees no sender observes the channel mid-close
            let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }

        self.net.disconnected(self).await;
    }

    /// Clear the stored IP so the network will not redial it, then close.
    pub async fn discard_ip(self: &Arc<Self>) {
        if let Some(ip) = self.take_ip() {
            let mut state = self.net.state.lock().await;
            state.disconnected_ips.remove(&ip.to_string());
        }
        self.close().await;
    }

    /// Like `discard_ip`, but also remember the address as our own.
    pub async fn discard_my_ip(self: &Arc<Self>) {
        if let Some(ip) = self.take_ip() {
            let key = ip.to_string();
            let mut state = self.net.state.lock().await;
            state.my_ips.insert(key.clone());
            state.disconnected_ips.remove(&key);
        }
        self.close().await;
    }
}

/// The two-tier admission rule. Rate limiting only engages once the
/// process-wide backlog passes `rate_limit_threshold`; under pressure a
/// connection is dropped when its queue is already over its own budget and
/// either the network ceiling would be breached or the connection would hold
/// more than its fair slice (a twentieth of the ceiling).
pub(crate) fn drop_message(
    conn_pending_now: i64,
    conn_pending_new: i64,
    network_pending_new: i64,
    max_message_size: i64,
    max_network_pending: i64,
    rate_limit_threshold: i64,
) -> bool {
    network_pending_new > rate_limit_threshold
        && conn_pending_now > max_message_size
        && (network_pending_new > max_network_pending
            || conn_pending_new > max_network_pending / 20)
}

async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await
}
