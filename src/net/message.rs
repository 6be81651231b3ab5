//! P2P message ops and parsed message values

use super::types::IpPort;
use crate::types::Id;

/// On-wire operation codes. The handshake ops come first, consensus ops
/// after; `VersionNak` was appended when the synchronous handshake round
/// trip was introduced, so its code sits at the end of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    GetVersion = 0,
    Version = 1,
    GetPeerList = 2,
    PeerList = 3,
    Ping = 4,
    Pong = 5,
    GetAcceptedFrontier = 6,
    AcceptedFrontier = 7,
    GetAccepted = 8,
    Accepted = 9,
    Get = 10,
    Put = 11,
    PushQuery = 12,
    PullQuery = 13,
    Chits = 14,
    GetAncestors = 15,
    MultiPut = 16,
    VersionNak = 17,
}

impl Op {
    pub fn from_u8(v: u8) -> Option<Op> {
        Some(match v {
            0 => Op::GetVersion,
            1 => Op::Version,
            2 => Op::GetPeerList,
            3 => Op::PeerList,
            4 => Op::Ping,
            5 => Op::Pong,
            6 => Op::GetAcceptedFrontier,
            7 => Op::AcceptedFrontier,
            8 => Op::GetAccepted,
            9 => Op::Accepted,
            10 => Op::Get,
            11 => Op::Put,
            12 => Op::PushQuery,
            13 => Op::PullQuery,
            14 => Op::Chits,
            15 => Op::GetAncestors,
            16 => Op::MultiPut,
            17 => Op::VersionNak,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::GetVersion => "get_version",
            Op::Version => "version",
            Op::GetPeerList => "get_peer_list",
            Op::PeerList => "peer_list",
            Op::Ping => "ping",
            Op::Pong => "pong",
            Op::GetAcceptedFrontier => "get_accepted_frontier",
            Op::AcceptedFrontier => "accepted_frontier",
            Op::GetAccepted => "get_accepted",
            Op::Accepted => "accepted",
            Op::Get => "get",
            Op::Put => "put",
            Op::PushQuery => "push_query",
            Op::PullQuery => "pull_query",
            Op::Chits => "chits",
            Op::GetAncestors => "get_ancestors",
            Op::MultiPut => "multi_put",
            Op::VersionNak => "version_nak",
        }
    }

    /// All ops, for metrics table construction.
    pub const ALL: [Op; 18] = [
        Op::GetVersion,
        Op::Version,
        Op::GetPeerList,
        Op::PeerList,
        Op::Ping,
        Op::Pong,
        Op::GetAcceptedFrontier,
        Op::AcceptedFrontier,
        Op::GetAccepted,
        Op::Accepted,
        Op::Get,
        Op::Put,
        Op::PushQuery,
        Op::PullQuery,
        Op::Chits,
        Op::GetAncestors,
        Op::MultiPut,
        Op::VersionNak,
    ];
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome carried in a `VersionNak` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NakCode {
    Success = 0,
    AlreadyPeered = 1,
    SelfPeered = 2,
}

impl NakCode {
    pub fn from_u32(v: u32) -> Option<NakCode> {
        Some(match v {
            0 => NakCode::Success,
            1 => NakCode::AlreadyPeered,
            2 => NakCode::SelfPeered,
            _ => return None,
        })
    }
}

/// A fully parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GetVersion,
    Version {
        network_id: u32,
        node_id: u32,
        session_id: u32,
        my_time: u64,
        ip: IpPort,
        version_str: String,
    },
    VersionNak {
        code: NakCode,
        peers: Vec<IpPort>,
    },
    GetPeerList,
    PeerList {
        peers: Vec<IpPort>,
    },
    Ping,
    Pong,
    GetAcceptedFrontier {
        chain_id: Id,
        request_id: u32,
        deadline: u64,
    },
    AcceptedFrontier {
        chain_id: Id,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    GetAccepted {
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_ids: Vec<Id>,
    },
    Accepted {
        chain_id: Id,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    Get {
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    },
    GetAncestors {
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    },
    Put {
        chain_id: Id,
        request_id: u32,
        container_id: Id,
        container: Vec<u8>,
    },
    MultiPut {
        chain_id: Id,
        request_id: u32,
        containers: Vec<Vec<u8>>,
    },
    PushQuery {
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
        container: Vec<u8>,
    },
    PullQuery {
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    },
    Chits {
        chain_id: Id,
        request_id: u32,
        container_ids: Vec<Id>,
    },
}

impl Message {
    pub fn op(&self) -> Op {
        match self {
            Message::GetVersion => Op::GetVersion,
            Message::Version { .. } => Op::Version,
            Message::VersionNak { .. } => Op::VersionNak,
            Message::GetPeerList => Op::GetPeerList,
            Message::PeerList { .. } => Op::PeerList,
            Message::Ping => Op::Ping,
            Message::Pong => Op::Pong,
            Message::GetAcceptedFrontier { .. } => Op::GetAcceptedFrontier,
            Message::AcceptedFrontier { .. } => Op::AcceptedFrontier,
            Message::GetAccepted { .. } => Op::GetAccepted,
            Message::Accepted { .. } => Op::Accepted,
            Message::Get { .. } => Op::Get,
            Message::GetAncestors { .. } => Op::GetAncestors,
            Message::Put { .. } => Op::Put,
            Message::MultiPut { .. } => Op::MultiPut,
            Message::PushQuery { .. } => Op::PushQuery,
            Message::PullQuery { .. } => Op::PullQuery,
            Message::Chits { .. } => Op::Chits,
        }
    }
}

/// An already-serialized outbound message: the payload that goes inside one
/// frame, tagged with its op for metrics.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub op: Op,
    pub bytes: Vec<u8>,
}

impl OutboundMessage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
