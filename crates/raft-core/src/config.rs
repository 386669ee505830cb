//! # config
//!
//! why: keep every timing knob of the consensus engine in one serde-friendly struct
//! relations: read by node.rs (timers, rpc bounds) and timer.rs (jitter range)
//! what: RaftConfig with defaults and validation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RaftError, Result};

/// timing configuration, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// period of leader heartbeats
    pub heartbeat_interval: u64,
    /// bound on a single outbound rpc
    pub rpc_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 200,
        }
    }
}

impl RaftConfig {
    /// reject configurations that would let heartbeats lose the race with elections
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {} must be positive and below election timeout {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 {
            return Err(RaftError::Config("rpc timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
