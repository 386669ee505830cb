//! # error
//!
//! why: one error type for every fallible consensus operation
//! relations: wraps raft-storage's StorageError, returned by log, meta, client and node
//! what: RaftError, Result alias

use raft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("log gap: expected index {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },

    #[error("cannot truncate log at {index}, first index is {first_index}")]
    InvalidTruncate { index: u64, first_index: u64 },

    #[error("transport error talking to peer {peer}: {reason}")]
    Transport { peer: u64, reason: String },

    #[error("rpc to peer {peer} timed out after {millis}ms")]
    Timeout { peer: u64, millis: u64 },

    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("node {0} is dead")]
    Dead(u64),
}

pub type Result<T> = std::result::Result<T, RaftError>;
