//! Consensus routing target
//!
//! The peer layer parses consensus traffic and hands it to a `Router`
//! implementation. Routing is fire-and-forget: the peer layer never observes
//! an outcome, so the trait methods return nothing.

use crate::types::{Id, NodeId};

pub trait Router: Send + Sync {
    fn get_accepted_frontier(&self, peer: NodeId, chain_id: Id, request_id: u32, deadline: u64);
    fn accepted_frontier(&self, peer: NodeId, chain_id: Id, request_id: u32, container_ids: Vec<Id>);
    fn get_accepted(
        &self,
        peer: NodeId,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_ids: Vec<Id>,
    );
    fn accepted(&self, peer: NodeId, chain_id: Id, request_id: u32, container_ids: Vec<Id>);
    fn get(&self, peer: NodeId, chain_id: Id, request_id: u32, deadline: u64, container_id: Id);
    fn get_ancestors(
        &self,
        peer: NodeId,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    );
    fn put(&self, peer: NodeId, chain_id: Id, request_id: u32, container_id: Id, container: Vec<u8>);
    fn multi_put(&self, peer: NodeId, chain_id: Id, request_id: u32, containers: Vec<Vec<u8>>);
    fn push_query(
        &self,
        peer: NodeId,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
        container: Vec<u8>,
    );
    fn pull_query(
        &self,
        peer: NodeId,
        chain_id: Id,
        request_id: u32,
        deadline: u64,
        container_id: Id,
    );
    fn chits(&self, peer: NodeId, chain_id: Id, request_id: u32, container_ids: Vec<Id>);
}

/// Discards all consensus traffic. Used by the standalone binary and tests
/// that only exercise the connection layer.
#[derive(Debug, Default)]
pub struct NoopRouter;

impl Router for NoopRouter {
    fn get_accepted_frontier(&self, _: NodeId, _: Id, _: u32, _: u64) {}
    fn accepted_frontier(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
    fn get_accepted(&self, _: NodeId, _: Id, _: u32, _: u64, _: Vec<Id>) {}
    fn accepted(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
    fn get(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn get_ancestors(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn put(&self, _: NodeId, _: Id, _: u32, _: Id, _: Vec<u8>) {}
    fn multi_put(&self, _: NodeId, _: Id, _: u32, _: Vec<Vec<u8>>) {}
    fn push_query(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id, _: Vec<u8>) {}
    fn pull_query(&self, _: NodeId, _: Id, _: u32, _: u64, _: Id) {}
    fn chits(&self, _: NodeId, _: Id, _: u32, _: Vec<Id>) {}
}
