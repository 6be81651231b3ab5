//! Big-endian wire packing and length-prefixed framing
//!
//! Every message payload is a flat sequence of big-endian fields; on the wire
//! each payload is preceded by a 4-byte big-endian length. The `Framer`
//! reassembles payloads from arbitrarily chunked reads.

use super::types::IpPort;
use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of buffer")]
    Truncated,
    #[error("frame length {0} exceeds maximum {1}")]
    OversizeFrame(u32, u32),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("unknown op code {0}")]
    UnknownOp(u8),
    #[error("invalid utf-8 in string field")]
    InvalidString,
    #[error("invalid id length {0}")]
    InvalidIdLength(usize),
    #[error("unknown version nak code {0}")]
    UnknownNakCode(u32),
}

/// Serializer for message payloads.
#[derive(Default)]
pub struct Packer {
    bytes: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn pack_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    /// u32 length followed by the raw bytes.
    pub fn pack_bytes(&mut self, v: &[u8]) {
        self.pack_u32(v.len() as u32);
        self.bytes.extend_from_slice(v);
    }

    /// u16 length followed by UTF-8 bytes.
    pub fn pack_str(&mut self, v: &str) {
        self.pack_u16(v.len() as u16);
        self.bytes.extend_from_slice(v.as_bytes());
    }

    /// 16 address bytes (IPv4 mapped into IPv6) followed by the u16 port.
    pub fn pack_ip(&mut self, v: &IpPort) {
        self.bytes.extend_from_slice(&v.as_v6().octets());
        self.pack_u16(v.port);
    }

    pub fn pack_ip_list(&mut self, ips: &[IpPort]) {
        self.pack_u32(ips.len() as u32);
        for ip in ips {
            self.pack_ip(ip);
        }
    }

    /// u32 count followed by length-prefixed byte arrays.
    pub fn pack_bytes_list(&mut self, items: &[Vec<u8>]) {
        self.pack_u32(items.len() as u32);
        for item in items {
            self.pack_bytes(item);
        }
    }

    pub fn take(self) -> Vec<u8> {
        self.bytes
    }
}

/// Deserializer over a message payload.
pub struct Unpacker<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.bytes.len() - self.offset < n {
            return Err(WireError::Truncated);
        }
        let out = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read(1)?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, WireError> {
        let b = self.read(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, WireError> {
        let b = self.read(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, WireError> {
        let b = self.read(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.unpack_u32()? as usize;
        Ok(self.read(len)?.to_vec())
    }

    pub fn unpack_str(&mut self) -> Result<String, WireError> {
        let len = self.unpack_u16()? as usize;
        let bytes = self.read(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidString)
    }

    pub fn unpack_ip(&mut self) -> Result<IpPort, WireError> {
        let b = self.read(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(b);
        let v6 = Ipv6Addr::from(octets);
        let port = self.unpack_u16()?;
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Ok(IpPort::new(ip, port))
    }

    pub fn unpack_ip_list(&mut self) -> Result<Vec<IpPort>, WireError> {
        let count = self.unpack_u32()? as usize;
        // worst case 18 bytes per entry; reject counts the buffer cannot hold
        if count > self.remaining() / 18 {
            return Err(WireError::Truncated);
        }
        let mut ips = Vec::with_capacity(count);
        for _ in 0..count {
            ips.push(self.unpack_ip()?);
        }
        Ok(ips)
    }

    pub fn unpack_bytes_list(&mut self) -> Result<Vec<Vec<u8>>, WireError> {
        let count = self.unpack_u32()? as usize;
        // each entry carries at least its 4-byte length
        if count > self.remaining() / 4 {
            return Err(WireError::Truncated);
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.unpack_bytes()?);
        }
        Ok(items)
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Every parser must consume the whole payload.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Prefix a payload with its 4-byte big-endian length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental frame reassembly over a chunked byte stream.
///
/// Residual bytes past a consumed frame carry over to the next call, so any
/// partition of a frame sequence into read chunks yields the same frames.
pub struct Framer {
    pending: Vec<u8>,
    max_frame: u32,
}

impl Framer {
    pub fn new(max_frame: u32) -> Self {
        Self {
            pending: Vec::new(),
            max_frame,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pop the next complete payload, if one is buffered.
    ///
    /// The declared length is validated as soon as the prefix is readable,
    /// before any payload-sized allocation happens.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.pending.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]);
        if len > self.max_frame {
            return Err(WireError::OversizeFrame(len, self.max_frame));
        }
        let total = 4 + len as usize;
        if self.pending.len() < total {
            return Ok(None);
        }
        let payload = self.pending[4..total].to_vec();
        self.pending.drain(..total);
        Ok(Some(payload))
    }
}
