//! Core identifier types shared across the node

use sha3::{Digest, Sha3_256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Short 20-byte node identifier.
///
/// Identity is asserted during the handshake, not proven — the id of a peer
/// we dial (or accept) is derived from its address until the network layer
/// learns otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const LEN: usize = 20;

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    /// Derive a node id from a canonical `ip:port` string.
    /// First 20 bytes of SHA3-256.
    pub fn from_addr(addr: &str) -> Self {
        let digest = Sha3_256::digest(addr.as_bytes());
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(&digest[..Self::LEN]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 32-byte identifier for chains and containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; 32]);

impl Id {
    pub const LEN: usize = 32;

    pub const fn empty() -> Self {
        Self([0u8; Self::LEN])
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    /// Deterministic test/tooling helper: empty id with the first byte set
    pub fn with_prefix(prefix: u8) -> Self {
        let mut id = [0u8; Self::LEN];
        id[0] = prefix;
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
