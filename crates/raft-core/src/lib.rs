//! # raft-core
//!
//! why: implement the raft consensus engine that backs a sharded key-value service
//! relations: persists through raft-storage, reaches peers through the transport seam
//! what: role state machine, election/heartbeat timing loop, vote and append handlers,
//! durable log and metadata, peer clients

pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod meta;
pub mod node;
pub mod timer;
pub mod transport;

pub use client::{PeerClient, PeerTable};
pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::{LogEntry, RaftLog};
pub use message::{AppendEntryRequest, AppendEntryResponse, VoteRequest, VoteResponse};
pub use meta::{MetaStore, PersistentState};
pub use node::{NodeState, NodeStatus, RaftCore, RaftCoreBuilder};
pub use timer::{ElectionDelay, FixedDelay, RandomDelay};
pub use transport::{Connector, RaftService};
