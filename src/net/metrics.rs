//! Message and peer counters
//!
//! Plain atomics; a metrics registry is out of scope, so these are the whole
//! observable surface besides logs.

use super::message::Op;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct MsgMetrics {
    pub num_sent: AtomicU64,
    pub num_received: AtomicU64,
    /// Sends dropped by admission control or a closed/full queue.
    pub num_failed: AtomicU64,
}

#[derive(Debug)]
pub struct NetMetrics {
    pub num_peers: AtomicUsize,
    msgs: [MsgMetrics; Op::ALL.len()],
}

impl NetMetrics {
    pub fn new() -> Self {
        Self {
            num_peers: AtomicUsize::new(0),
            msgs: Default::default(),
        }
    }

    pub fn message(&self, op: Op) -> &MsgMetrics {
        &self.msgs[op as usize]
    }

    pub fn sent(&self, op: Op) {
        self.message(op).num_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self, op: Op) {
        self.message(op).num_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, op: Op) {
        self.message(op).num_failed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for NetMetrics {
    fn default() -> Self {
        Self::new()
    }
}
