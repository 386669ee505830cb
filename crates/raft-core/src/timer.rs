//! # timer
//!
//! why: isolate the jitter source behind one function so tests can pin election delays
//! relations: consulted by node.rs every time the election timer is re-armed
//! what: ElectionDelay trait, RandomDelay, FixedDelay

use std::time::Duration;

use rand::Rng;

use crate::RaftConfig;

/// produces the delay until the next election timeout
pub trait ElectionDelay: Send + Sync {
    fn next_election_delay(&self) -> Duration;
}

/// uniform delay in `[min, max]` milliseconds, re-drawn on every reset
#[derive(Debug, Clone)]
pub struct RandomDelay {
    min_ms: u64,
    max_ms: u64,
}

impl RandomDelay {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: max_ms.max(min_ms),
        }
    }

    pub fn from_config(config: &RaftConfig) -> Self {
        Self::new(config.election_timeout_min, config.election_timeout_max)
    }
}

impl ElectionDelay for RandomDelay {
    fn next_election_delay(&self) -> Duration {
        let timeout_ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(timeout_ms)
    }
}

/// the same delay every time
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl ElectionDelay for FixedDelay {
    fn next_election_delay(&self) -> Duration {
        self.0
    }
}
