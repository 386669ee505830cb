//! # transport
//!
//! why: keep wire mechanics outside the consensus engine
//! relations: client.rs calls through RaftService; node.rs implements it for inbound rpcs
//! what: RaftService (the two rpcs), Connector (dials a peer address)

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::{AppendEntryRequest, AppendEntryResponse, VoteRequest, VoteResponse};
use crate::Result;

/// the rpc surface every raft peer exposes
#[async_trait]
pub trait RaftService: Send + Sync {
    async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entry(&self, req: AppendEntryRequest) -> Result<AppendEntryResponse>;

    /// release the underlying connection; called when a handle is replaced
    async fn close(&self) {}
}

/// opens outbound connections to peers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer_id: u64, addr: &str) -> Result<Arc<dyn RaftService>>;
}
