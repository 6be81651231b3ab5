pub mod net;
pub mod types;
pub mod version;

pub use net::{
    Builder, HandshakeError, IpPort, Message, NakCode, NetConfig, NetError, NetStats, Network,
    NoopRouter, Op, OutboundMessage, Peer, Router, WireError,
};
pub use types::{now, Id, NodeId};
pub use version::{AppVersion, VersionError};
