//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, persisted into a raft-storage engine
//! what: LogEntry, RaftLog (durable index -> entry mapping plus an in-memory cache)
//!
//! layout inside the engine:
//! - `raft/log/` ++ big-endian index: one serialized entry per slot
//! - `raft/first_idx`, `raft/last_idx`: the persisted boundaries
//!
//! slot 0 holds a sentinel entry (term 0, empty command) so a fresh log still
//! satisfies `first_index <= last_index` with every slot in range present.

use std::sync::Arc;

use raft_storage::KvStore;
use serde::{Deserialize, Serialize};

use crate::{RaftError, Result};

const LOG_PREFIX: &[u8] = b"raft/log/";
const FIRST_IDX_KEY: &[u8] = b"raft/first_idx";
const LAST_IDX_KEY: &[u8] = b"raft/last_idx";

/// a single entry in the replicated log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// the term when this entry was created
    pub term: u64,
    /// the index of this entry in the log
    pub index: u64,
    /// opaque command for the state machine above the log
    pub command: Vec<u8>,
}

impl LogEntry {
    /// create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// stand-in for a slot whose persisted bytes are missing or unreadable
    pub fn placeholder(index: u64) -> Self {
        Self {
            term: 0,
            index,
            command: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn entry_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOG_PREFIX.len() + 8);
    key.extend_from_slice(LOG_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// durable raft log
///
/// the engine is authoritative; `entries` is a write-through cache that is
/// always re-derived from the engine on load, never the reverse.
pub struct RaftLog {
    engine: Arc<dyn KvStore>,
    first_index: u64,
    last_index: u64,
    /// entries[i] holds index first_index + i
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// open the log stored in `engine`, initialising it on first use
    pub fn open(engine: Arc<dyn KvStore>) -> Result<Self> {
        let mut log = Self {
            engine,
            first_index: 0,
            last_index: 0,
            entries: Vec::new(),
        };

        let fresh = log.engine.get(LAST_IDX_KEY)?.is_none()
            && log.engine.get(&entry_key(0))?.is_none();
        if fresh {
            log.engine
                .put(&entry_key(0), &LogEntry::placeholder(0).encode()?)?;
            log.engine.put(FIRST_IDX_KEY, &0u64.to_be_bytes())?;
            log.engine.put(LAST_IDX_KEY, &0u64.to_be_bytes())?;
        }

        log.load_persistent_log()?;
        Ok(log)
    }

    /// rebuild the in-memory cache from the engine
    ///
    /// missing boundaries default to 0; a missing or undecodable slot becomes a
    /// placeholder instead of failing recovery.
    pub fn load_persistent_log(&mut self) -> Result<()> {
        let first = self.read_boundary(FIRST_IDX_KEY)?.unwrap_or(0);
        let last = self.read_boundary(LAST_IDX_KEY)?.unwrap_or(0);
        if first > last {
            return Err(RaftError::CorruptLog(format!(
                "first index {first} is past last index {last}"
            )));
        }

        // every append writes its slot before moving last_idx onto it
        let highest = self.engine.seek_prefix_id_max(LOG_PREFIX)?;
        if last > highest {
            return Err(RaftError::CorruptLog(format!(
                "last index {last} is past the highest stored entry {highest}"
            )));
        }

        let mut entries = Vec::with_capacity((last - first + 1) as usize);
        for index in first..=last {
            entries.push(self.read_slot(index)?);
        }

        self.first_index = first;
        self.last_index = last;
        self.entries = entries;
        tracing::debug!(first, last, "loaded persistent log");
        Ok(())
    }

    fn read_boundary(&self, key: &[u8]) -> Result<Option<u64>> {
        match self.engine.get(key)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    RaftError::CorruptLog(format!(
                        "boundary {} holds {} bytes",
                        String::from_utf8_lossy(key),
                        bytes.len()
                    ))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
        }
    }

    /// read one slot through to the engine, substituting a placeholder when unusable
    fn read_slot(&self, index: u64) -> Result<LogEntry> {
        let entry = match self.engine.get(&entry_key(index))? {
            Some(bytes) => LogEntry::decode(&bytes).unwrap_or_else(|e| {
                tracing::warn!(index, error = %e, "undecodable log entry, using placeholder");
                LogEntry::placeholder(index)
            }),
            None => {
                tracing::warn!(index, "missing log entry, using placeholder");
                LogEntry::placeholder(index)
            }
        };
        Ok(entry)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_term(&self) -> Result<u64> {
        Ok(self.term_at(self.last_index)?.unwrap_or(0))
    }

    /// the cached entries, first_index through last_index
    pub fn cached(&self) -> &[LogEntry] {
        &self.entries
    }

    /// term of the entry at `index`, or None outside the log
    pub fn term_at(&self, index: u64) -> Result<Option<u64>> {
        Ok(self.get_entry(index)?.map(|e| e.term))
    }

    /// read the entry at `index` from the engine
    pub fn get_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        if index < self.first_index || index > self.last_index {
            return Ok(None);
        }
        self.read_slot(index).map(Some)
    }

    /// read `[first, last]` from the engine, clamped to the log's bounds
    pub fn get_entries(&self, first: u64, last: u64) -> Result<Vec<LogEntry>> {
        let first = first.max(self.first_index);
        let last = last.min(self.last_index);
        if first > last {
            return Ok(Vec::new());
        }
        (first..=last).map(|index| self.read_slot(index)).collect()
    }

    /// every entry from `index` to the end of the log
    pub fn entries_from(&self, index: u64) -> Result<Vec<LogEntry>> {
        self.get_entries(index, self.last_index)
    }

    /// append entries in order
    ///
    /// each entry is written before the persisted last index moves onto it, so a
    /// crash mid-batch leaves the boundary on the last entry actually written.
    pub fn append(&mut self, new_entries: &[LogEntry]) -> Result<()> {
        for entry in new_entries {
            let expected = self.last_index + 1;
            if entry.index != expected {
                return Err(RaftError::LogGap {
                    expected,
                    got: entry.index,
                });
            }

            let index_bytes = entry.index.to_be_bytes();
            self.engine.put(&entry_key(entry.index), &entry.encode()?)?;
            self.engine.put(LAST_IDX_KEY, &index_bytes)?;

            self.entries.push(entry.clone());
            self.last_index = entry.index;
        }
        Ok(())
    }

    /// drop every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.first_index {
            return Err(RaftError::InvalidTruncate {
                index,
                first_index: self.first_index,
            });
        }
        if index > self.last_index {
            return Ok(());
        }

        // lower the boundary first: stray slots past it are overwritten by later appends
        let new_last = index - 1;
        self.engine.put(LAST_IDX_KEY, &new_last.to_be_bytes())?;
        for stale in (index..=self.last_index).rev() {
            self.engine.delete(&entry_key(stale))?;
        }

        self.entries
            .truncate((new_last - self.first_index + 1) as usize);
        tracing::debug!(from = index, old_last = self.last_index, "truncated log");
        self.last_index = new_last;
        Ok(())
    }
}
