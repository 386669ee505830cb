//! # meta
//!
//! why: durable term/vote state so a restarted node cannot vote twice in a term
//! relations: owned by node.rs, written on every role transition and vote
//! what: PersistentState triple, MetaStore (one reserved engine key)

use std::sync::Arc;

use raft_storage::KvStore;
use serde::{Deserialize, Serialize};

use crate::Result;

const META_KEY: &[u8] = b"raft/meta";

/// persistent state on all servers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// latest term this node has seen, never decreases
    pub current_term: u64,
    /// candidate that received our vote in current_term, if any
    pub voted_for: Option<u64>,
    /// highest index the layer above reports as applied
    pub applied_index: u64,
}

/// reads and writes the persistent state record
pub struct MetaStore {
    engine: Arc<dyn KvStore>,
}

impl MetaStore {
    pub fn new(engine: Arc<dyn KvStore>) -> Self {
        Self { engine }
    }

    /// load the persisted state, or the zero state for a node that never saved one
    pub fn load(&self) -> Result<PersistentState> {
        match self.engine.get(META_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(PersistentState::default()),
        }
    }

    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.engine.put(META_KEY, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RaftError;
    use raft_storage::MemKvStore;

    #[test]
    fn fresh_engine_loads_zero_state() {
        let meta = MetaStore::new(Arc::new(MemKvStore::new()));
        assert_eq!(meta.load().unwrap(), PersistentState::default());
    }

    #[test]
    fn save_then_load_returns_same_state() {
        let engine: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let state = PersistentState {
            current_term: 7,
            voted_for: Some(3),
            applied_index: 12,
        };
        MetaStore::new(engine.clone()).save(&state).unwrap();

        // a second store over the same engine sees it, as after a restart
        assert_eq!(MetaStore::new(engine).load().unwrap(), state);
    }

    #[test]
    fn garbage_record_is_an_error_not_a_reset() {
        let engine: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        engine.put(META_KEY, b"{truncated").unwrap();

        let err = MetaStore::new(engine).load().unwrap_err();
        assert!(matches!(err, RaftError::Codec(_)));
    }
}
