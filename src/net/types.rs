//! Network constants and address types
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every frame is length-checked before its
//!    payload is buffered further, and outbound queues are capped both per
//!    peer and process-wide.
//!
//! 2. **Graceful degradation** — when the process-wide send backlog crosses
//!    the rate-limit threshold, chatty connections are throttled first; an
//!    uncongested system never drops.

use crate::version::AppVersion;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// PROTOCOL DEFAULTS
// =============================================================================

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 9650;

/// Maximum payload size of a single frame (2 MiB).
/// A frame declaring more than this terminates the connection.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1 << 21;

/// Size of the reader task's per-read buffer (2 MiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1 << 21;

/// Capacity of a peer's outbound frame queue.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1 << 10;

/// Process-wide ceiling on bytes queued for sending (512 MiB).
pub const DEFAULT_MAX_NETWORK_PENDING_SEND_BYTES: i64 = 1 << 29;

/// Backlog level at which per-connection fairness kicks in.
pub const DEFAULT_NETWORK_PENDING_SEND_BYTES_TO_RATE_LIMIT: i64 =
    DEFAULT_MAX_NETWORK_PENDING_SEND_BYTES / 4;

/// How long to wait for the first frame of the synchronous handshake.
pub const DEFAULT_READ_PEER_VERSION_TIMEOUT_SECS: u64 = 15;

/// Period of the handshake-completion ticker.
pub const DEFAULT_GET_VERSION_TIMEOUT_SECS: u64 = 2;

/// Read deadline between messages once the handshake phase is over.
pub const DEFAULT_PING_PONG_TIMEOUT_SECS: u64 = 60;

/// Ping period. Three quarters of the ping/pong timeout so a healthy peer
/// always refreshes the deadline in time.
pub const DEFAULT_PING_FREQUENCY_SECS: u64 = DEFAULT_PING_PONG_TIMEOUT_SECS * 3 / 4;

/// Maximum tolerated clock skew against a peer's advertised time.
pub const DEFAULT_MAX_CLOCK_DIFFERENCE_SECS: u64 = 60;

/// Timeout for an outbound TCP connect attempt.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 30;

/// Period of the redial sweep over the disconnected-IP set.
pub const DEFAULT_REDIAL_FREQUENCY_SECS: u64 = 30;

/// First handshake generation that completes the Version / VersionNak
/// round trip synchronously. Older peers take the reactive path.
pub fn version_peer_nak(app: &str) -> AppVersion {
    AppVersion::new(app, 1, 0, 4)
}

// =============================================================================
// ADDRESSES
// =============================================================================

/// An `ip:port` pair as carried in Version, VersionNak and PeerList messages.
///
/// The zero value (unspecified address, port 0) means "unknown" and is never
/// tracked or gossiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpPort {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub const fn zero() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.port == 0 && self.ip.is_unspecified()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Compare by address value, treating an IPv4-mapped IPv6 address as
    /// equal to its IPv4 form (the wire format is always 16 bytes).
    pub fn same_addr(&self, other: &IpPort) -> bool {
        self.as_v6() == other.as_v6() && self.port == other.port
    }

    pub fn as_v6(&self) -> Ipv6Addr {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        }
    }

    /// Private, loopback or link-local — not tracked unless the node is
    /// configured to allow private IPs.
    pub fn is_private(&self) -> bool {
        match self.ip {
            IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
            IpAddr::V6(ip) => {
                if ip.is_loopback() {
                    return true;
                }
                let segments = ip.segments();
                // fc00::/7 unique local
                if (segments[0] & 0xfe00) == 0xfc00 {
                    return true;
                }
                // fe80::/10 link local
                if (segments[0] & 0xffc0) == 0xfe80 {
                    return true;
                }
                if let Some(v4) = ip.to_ipv4_mapped() {
                    return v4.is_private() || v4.is_loopback() || v4.is_link_local();
                }
                false
            }
        }
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}
