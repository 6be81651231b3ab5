//! P2P networking layer

pub mod builder;
pub mod message;
pub mod metrics;
pub mod packer;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod types;

// Re-exports
pub use builder::Builder;
pub use message::{Message, NakCode, Op, OutboundMessage};
pub use metrics::{MsgMetrics, NetMetrics};
pub use packer::{frame, Framer, Packer, Unpacker, WireError};
pub use peer::Peer;
pub use protocol::{HandshakeError, NetConfig, NetError, NetStats, Network};
pub use router::{NoopRouter, Router};
pub use types::*;
