//! Wire message construction and parsing
//!
//! Constructors return the serialized payload for one frame; `parse` is the
//! inverse. Round trip: `parse(build(..)) == build's inputs` for every op.

use super::message::{Message, NakCode, Op, OutboundMessage};
use super::packer::{Packer, Unpacker, WireError};
use super::types::IpPort;
use crate::types::Id;

/// Builds and parses wire messages.
///
/// Stateless; exists as a type so the op surface is one coherent contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct Builder;

impl Builder {
    fn empty(op: Op) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(op as u8);
        OutboundMessage {
            op,
            bytes: p.take(),
        }
    }

    pub fn get_version(&self) -> OutboundMessage {
        Self::empty(Op::GetVersion)
    }

    pub fn version(
        &self,
        network_id: u32,
        node_id: u32,
        session_id: u32,
        my_time: u64,
        ip: IpPort,
        version_str: &str,
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::Version as u8);
        p.pack_u32(network_id);
        p.pack_u32(node_id);
        p.pack_u32(session_id);
        p.pack_u64(my_time);
        p.pack_ip(&ip);
        p.pack_str(version_str);
        OutboundMessage {
            op: Op::Version,
            bytes: p.take(),
        }
    }

    pub fn version_nak(&self, code: NakCode, peers: &[IpPort]) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::VersionNak as u8);
        p.pack_u32(code as u32);
        p.pack_ip_list(peers);
        OutboundMessage {
            op: Op::VersionNak,
            bytes: p.take(),
        }
    }

    pub fn get_peer_list(&self) -> OutboundMessage {
        Self::empty(Op::GetPeerList)
    }

    pub fn peer_list(&self, peers: &[IpPort]) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::PeerList as u8);
        p.pack_ip_list(peers);
        OutboundMessage {
            op: Op::PeerList,
            bytes: p.take(),
        }
    }

    pub fn ping(&self) -> OutboundMessage {
        Self::empty(Op::Ping)
    }

    pub fn pong(&self) -> OutboundMessage {
        Self::empty(Op::Pong)
    }

    pub fn get_accepted_frontier(
        &self,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::GetAcceptedFrontier as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_u64(deadline);
        OutboundMessage {
            op: Op::GetAcceptedFrontier,
            bytes: p.take(),
        }
    }

    pub fn accepted_frontier(
        &self,
        chain_id: Id,
        request_id: u32,
        container_ids: &[Id],
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::AcceptedFrontier as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        pack_id_list(&mut p, container_ids);
        OutboundMessage {
            op: Op::AcceptedFrontier,
            bytes: p.take(),
        }
    }

    pub fn get_accepted(
        &self,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_ids: &[Id],
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::GetAccepted as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_u64(deadline);
        pack_id_list(&mut p, container_ids);
        OutboundMessage {
            op: Op::GetAccepted,
            bytes: p.take(),
        }
    }

    pub fn accepted(&self, chain_id: Id, request_id: u32, container_ids: &[Id]) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::Accepted as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        pack_id_list(&mut p, container_ids);
        OutboundMessage {
            op: Op::Accepted,
            bytes: p.take(),
        }
    }

    pub fn get(
        &self,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::Get as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_u64(deadline);
        p.pack_bytes(container_id.as_bytes());
        OutboundMessage {
            op: Op::Get,
            bytes: p.take(),
        }
    }

    pub fn get_ancestors(
        &self,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::GetAncestors as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_u64(deadline);
        p.pack_bytes(container_id.as_bytes());
        OutboundMessage {
            op: Op::GetAncestors,
            bytes: p.take(),
        }
    }

    pub fn put(
        &self,
        chain_id: Id,
        request_id: u32,
        container_id: Id,
        container: &[u8],
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::Put as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_bytes(container_id.as_bytes());
        p.pack_bytes(container);
        OutboundMessage {
            op: Op::Put,
            bytes: p.take(),
        }
    }

    pub fn multi_put(
        &self,
        chain_id: Id,
        request_id: u32,
        containers: &[Vec<u8>],
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::MultiPut as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_bytes_list(containers);
        OutboundMessage {
            op: Op::MultiPut,
            bytes: p.take(),
        }
    }

    pub fn push_query(
        &self,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
        container: &[u8],
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::PushQuery as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_u64(deadline);
        p.pack_bytes(container_id.as_bytes());
        p.pack_bytes(container);
        OutboundMessage {
            op: Op::PushQuery,
            bytes: p.take(),
        }
    }

    pub fn pull_query(
        &self,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    ) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::PullQuery as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        p.pack_u64(deadline);
        p.pack_bytes(container_id.as_bytes());
        OutboundMessage {
            op: Op::PullQuery,
            bytes: p.take(),
        }
    }

    pub fn chits(&self, chain_id: Id, request_id: u32, container_ids: &[Id]) -> OutboundMessage {
        let mut p = Packer::new();
        p.pack_u8(Op::Chits as u8);
        p.pack_bytes(chain_id.as_bytes());
        p.pack_u32(request_id);
        pack_id_list(&mut p, container_ids);
        OutboundMessage {
            op: Op::Chits,
            bytes: p.take(),
        }
    }

    /// Parse one frame payload into a message value. The whole payload must
    /// be consumed; trailing bytes are an error.
    pub fn parse(&self, bytes: &[u8]) -> Result<Message, WireError> {
        let mut u = Unpacker::new(bytes);
        let op = Op::from_u8(u.unpack_u8()?).ok_or_else(|| WireError::UnknownOp(bytes[0]))?;

        let msg = match op {
            Op::GetVersion => Message::GetVersion,
            Op::Version => Message::Version {
                network_id: u.unpack_u32()?,
                node_id: u.unpack_u32()?,
                session_id: u.unpack_u32()?,
                my_time: u.unpack_u64()?,
                ip: u.unpack_ip()?,
                version_str: u.unpack_str()?,
            },
            Op::VersionNak => {
                let raw = u.unpack_u32()?;
                let code = NakCode::from_u32(raw).ok_or(WireError::UnknownNakCode(raw))?;
                Message::VersionNak {
                    code,
                    peers: u.unpack_ip_list()?,
                }
            }
            Op::GetPeerList => Message::GetPeerList,
            Op::PeerList => Message::PeerList {
                peers: u.unpack_ip_list()?,
            },
            Op::Ping => Message::Ping,
            Op::Pong => Message::Pong,
            Op::GetAcceptedFrontier => Message::GetAcceptedFrontier {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                deadline: u.unpack_u64()?,
            },
            Op::AcceptedFrontier => Message::AcceptedFrontier {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                container_ids: unpack_id_list(&mut u)?,
            },
            Op::GetAccepted => Message::GetAccepted {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                deadline: u.unpack_u64()?,
                container_ids: unpack_id_list(&mut u)?,
            },
            Op::Accepted => Message::Accepted {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                container_ids: unpack_id_list(&mut u)?,
            },
            Op::Get => Message::Get {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                deadline: u.unpack_u64()?,
                container_id: unpack_id(&mut u)?,
            },
            Op::GetAncestors => Message::GetAncestors {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                deadline: u.unpack_u64()?,
                container_id: unpack_id(&mut u)?,
            },
            Op::Put => Message::Put {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                container_id: unpack_id(&mut u)?,
                container: u.unpack_bytes()?,
            },
            Op::MultiPut => Message::MultiPut {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                containers: u.unpack_bytes_list()?,
            },
            Op::PushQuery => Message::PushQuery {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                deadline: u.unpack_u64()?,
                container_id: unpack_id(&mut u)?,
                container: u.unpack_bytes()?,
            },
            Op::PullQuery => Message::PullQuery {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                deadline: u.unpack_u64()?,
                container_id: unpack_id(&mut u)?,
            },
            Op::Chits => Message::Chits {
                chain_id: unpack_id(&mut u)?,
                request_id: u.unpack_u32()?,
                container_ids: unpack_id_list(&mut u)?,
            },
        };

        u.finish()?;
        Ok(msg)
    }
}

fn pack_id_list(p: &mut Packer, ids: &[Id]) {
    p.pack_u32(ids.len() as u32);
    for id in ids {
        p.pack_bytes(id.as_bytes());
    }
}

fn unpack_id(u: &mut Unpacker<'_>) -> Result<Id, WireError> {
    let bytes = u.unpack_bytes()?;
    Id::from_slice(&bytes).ok_or(WireError::InvalidIdLength(bytes.len()))
}

fn unpack_id_list(u: &mut Unpacker<'_>) -> Result<Vec<Id>, WireError> {
    let count = u.unpack_u32()? as usize;
    if count > u.remaining() / 4 {
        return Err(WireError::Truncated);
    }
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(unpack_id(u)?);
    }
    Ok(ids)
}
