//! # memory
//!
//! why: an engine with no disk footprint for tests and throwaway nodes
//! relations: implements `KvStore` from lib.rs
//! what: MemKvStore backed by a BTreeMap behind a parking_lot RwLock

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{KvStore, Result};

/// in-memory engine, no persistence across restarts
#[derive(Default)]
pub struct MemKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvStore {
    /// create an empty in-memory engine
    pub fn new() -> Self {
        Self::default()
    }

    /// number of stored keys
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvStore for MemKvStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn seek_prefix_first(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(crate::first_with_prefix(&self.map.read(), prefix))
    }

    fn dump_prefix(&self, prefix: &[u8], trim_prefix: bool) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(crate::dump_with_prefix(&self.map.read(), prefix, trim_prefix))
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut map = self.map.write();
        for key in crate::keys_with_prefix(&map, prefix) {
            map.remove(&key);
        }
        Ok(())
    }

    fn seek_prefix_last(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(crate::last_with_prefix(&self.map.read(), prefix))
    }

    fn seek_prefix_id_max(&self, prefix: &[u8]) -> Result<u64> {
        Ok(crate::id_max_with_prefix(&self.map.read(), prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemKvStore::new();

        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));

        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        // deleting twice is fine
        store.delete(b"k").unwrap();
    }

    #[test]
    fn delete_prefix_leaves_neighbours() {
        let store = MemKvStore::new();
        store.put(b"shard/1", b"a").unwrap();
        store.put(b"shard/2", b"b").unwrap();
        store.put(b"shards", b"c").unwrap();

        store.delete_prefix(b"shard/").unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"shards").unwrap(), Some(b"c".to_vec()));
    }

    #[test]
    fn id_max_ignores_malformed_suffixes() {
        let store = MemKvStore::new();
        let mut key = b"id/".to_vec();
        key.extend_from_slice(&42u64.to_be_bytes());
        store.put(&key, b"").unwrap();
        store.put(b"id/not-a-number", b"").unwrap();

        assert_eq!(store.seek_prefix_id_max(b"id/").unwrap(), 42);
        assert_eq!(store.seek_prefix_id_max(b"none/").unwrap(), 0);
    }
}
