//! # raft-storage
//!
//! why: provide the ordered byte-keyed engine that raft persists its log and metadata into
//! relations: consumed by raft-core (log.rs, meta.rs) through the `KvStore` trait
//! what: KvStore trait, MemKvStore, FileKvStore, engine factory, prefix scan helpers

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

mod file;
mod memory;

pub use file::FileKvStore;
pub use memory::MemKvStore;

/// errors raised by a storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record {record} in {path}: {reason}")]
    Corrupt {
        path: String,
        record: usize,
        reason: String,
    },

    #[error("unknown storage engine: {0}")]
    UnknownEngine(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// trait for an ordered, byte-keyed durability substrate
///
/// keys iterate in lexicographic byte order. every method takes `&self` so a
/// single engine can be shared behind an `Arc` by the log and the metadata store.
pub trait KvStore: Send + Sync {
    /// store `value` under `key`, replacing any previous value
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// read the value stored under `key`
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// remove `key`; removing an absent key is not an error
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// the smallest key starting with `prefix`, with its value
    fn seek_prefix_first(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// every pair whose key starts with `prefix`
    ///
    /// with `trim_prefix` the returned keys have the prefix stripped
    fn dump_prefix(&self, prefix: &[u8], trim_prefix: bool) -> Result<BTreeMap<Vec<u8>, Vec<u8>>>;

    /// remove every key starting with `prefix`
    fn delete_prefix(&self, prefix: &[u8]) -> Result<()>;

    /// the largest key starting with `prefix`, with its value
    fn seek_prefix_last(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// the maximum big-endian u64 suffix among keys of the form `prefix ++ [u8; 8]`
    ///
    /// returns 0 when no key matches
    fn seek_prefix_id_max(&self, prefix: &[u8]) -> Result<u64>;

    /// make all prior writes durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// open an engine by name
///
/// - `"memory"`: ephemeral `MemKvStore`, `path` is ignored
/// - `"file"`: `FileKvStore` rooted at `path`
pub fn open_engine(name: &str, path: impl AsRef<Path>) -> Result<Arc<dyn KvStore>> {
    match name {
        "memory" => Ok(Arc::new(MemKvStore::new())),
        "file" => Ok(Arc::new(FileKvStore::open(path)?)),
        other => Err(StorageError::UnknownEngine(other.to_string())),
    }
}

// -- prefix scans shared by both engines --

fn scan_prefix<'a>(
    map: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
    map.range(prefix.to_vec()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

pub(crate) fn first_with_prefix(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Option<(Vec<u8>, Vec<u8>)> {
    scan_prefix(map, prefix)
        .next()
        .map(|(k, v)| (k.clone(), v.clone()))
}

pub(crate) fn last_with_prefix(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Option<(Vec<u8>, Vec<u8>)> {
    // take_while is not reversible, so bound the range from above instead
    let found = match prefix_successor(prefix) {
        Some(end) => map.range(prefix.to_vec()..end).next_back(),
        None => map.range(prefix.to_vec()..).next_back(),
    };
    found
        .filter(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
}

pub(crate) fn dump_with_prefix(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
    trim_prefix: bool,
) -> BTreeMap<Vec<u8>, Vec<u8>> {
    scan_prefix(map, prefix)
        .map(|(k, v)| {
            let key = if trim_prefix {
                k[prefix.len()..].to_vec()
            } else {
                k.clone()
            };
            (key, v.clone())
        })
        .collect()
}

pub(crate) fn keys_with_prefix(map: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<Vec<u8>> {
    scan_prefix(map, prefix).map(|(k, _)| k.clone()).collect()
}

pub(crate) fn id_max_with_prefix(map: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> u64 {
    scan_prefix(map, prefix)
        .filter_map(|(k, _)| {
            let suffix: [u8; 8] = k[prefix.len()..].try_into().ok()?;
            Some(u64::from_be_bytes(suffix))
        })
        .max()
        .unwrap_or(0)
}

/// the smallest byte string greater than every string starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
