// SPDX-License-Identifier: Apache-2.0
//! Key-value substrate (component B): the single ordered byte-keyed store
//! abstraction backing event records, snapshots, capabilities, and cache
//! entries. The substrate does not interpret keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// A single write operation within a [`WriteBatch`].
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Set `key` to `value`.
    Put(Vec<u8>, Vec<u8>),
    /// Remove `key`, if present.
    Delete(Vec<u8>),
}

/// An atomic batch of puts/deletes. All operations in a batch are applied
/// together, or none are, by [`KvStore::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Queues a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Put(key.into(), value.into()));
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Delete(key.into()));
        self
    }

    /// Returns `true` if the batch has no queued operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Errors produced by a [`KvStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageFault {
    /// The underlying storage backend reported an I/O or encoding fault.
    #[error("storage fault: {0}")]
    Backend(String),
}

/// Ordered byte-keyed key-value substrate.
///
/// Every write that returns `Ok` is durable: implementations must not buffer
/// writes past the point where they report success. Keys compare byte-wise;
/// [`iter_from`](Self::iter_from) returns entries in ascending key order
/// starting at the first key `>= seek`.
pub trait KvStore: Send + Sync {
    /// Looks up `key`. Returns `None` if absent (absence is not an error).
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to read.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageFault>;

    /// Sets `key` to `value`, durably, before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to write.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageFault>;

    /// Removes `key`, if present. No-op if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to write.
    fn delete(&self, key: &[u8]) -> Result<(), StorageFault>;

    /// Returns entries in ascending key order starting at the first key
    /// `>= seek`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to read.
    fn iter_from(
        &self,
        seek: &[u8],
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>, StorageFault>;

    /// Applies every operation in `batch` atomically: all or none.
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to commit the batch.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageFault>;
}

/// In-memory [`KvStore`] backed by a `BTreeMap` behind a `parking_lot`
/// read-write lock. The default backend for tests and for callers who do
/// not need durability across process restarts.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageFault> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageFault> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageFault> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn iter_from(
        &self,
        seek: &[u8],
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>, StorageFault> {
        let guard = self.inner.read();
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = guard
            .range(seek.to_vec()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageFault> {
        let mut guard = self.inner.write();
        for op in batch.ops {
            match op {
                WriteOp::Put(k, v) => {
                    guard.insert(k, v);
                }
                WriteOp::Delete(k) => {
                    guard.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(feature = "sled-backend")]
mod sled_backend {
    use super::{KvStore, StorageFault, WriteBatch, WriteOp};

    /// [`KvStore`] backed by the embedded `sled` database, for callers who
    /// want the truth event log to survive a process restart without
    /// standing up an external database.
    pub struct SledKv {
        tree: sled::Db,
    }

    impl SledKv {
        /// Opens (or creates) a `sled` database at `path`.
        ///
        /// # Errors
        ///
        /// Returns [`StorageFault`] if `sled` fails to open the database.
        pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageFault> {
            let tree = sled::open(path).map_err(|e| StorageFault::Backend(e.to_string()))?;
            Ok(Self { tree })
        }
    }

    impl KvStore for SledKv {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageFault> {
            self.tree
                .get(key)
                .map(|maybe| maybe.map(|ivec| ivec.to_vec()))
                .map_err(|e| StorageFault::Backend(e.to_string()))
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageFault> {
            self.tree
                .insert(key, value)
                .map_err(|e| StorageFault::Backend(e.to_string()))?;
            self.tree
                .flush()
                .map_err(|e| StorageFault::Backend(e.to_string()))?;
            Ok(())
        }

        fn delete(&self, key: &[u8]) -> Result<(), StorageFault> {
            self.tree
                .remove(key)
                .map_err(|e| StorageFault::Backend(e.to_string()))?;
            self.tree
                .flush()
                .map_err(|e| StorageFault::Backend(e.to_string()))?;
            Ok(())
        }

        fn iter_from(
            &self,
            seek: &[u8],
        ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>, StorageFault> {
            let iter = self.tree.range(seek.to_vec()..).filter_map(|entry| {
                entry
                    .ok()
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
            });
            Ok(Box::new(iter))
        }

        fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageFault> {
            let mut sled_batch = sled::Batch::default();
            for op in batch.ops {
                match op {
                    WriteOp::Put(k, v) => sled_batch.insert(k, v),
                    WriteOp::Delete(k) => sled_batch.remove(k),
                }
            }
            self.tree
                .apply_batch(sled_batch)
                .map_err(|e| StorageFault::Backend(e.to_string()))?;
            self.tree
                .flush()
                .map_err(|e| StorageFault::Backend(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(feature = "sled-backend")]
pub use sled_backend::SledKv;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // ── 1. get on empty store is None, not an error ──────────────────────

    #[test]
    fn get_missing_key_is_none() {
        let store = MemoryKv::new();
        assert!(store.get(b"missing").unwrap().is_none());
    }

    // ── 2. put then get round-trips ──────────────────────────────────────

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryKv::new();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    // ── 3. delete removes the key ────────────────────────────────────────

    #[test]
    fn delete_removes_key() {
        let store = MemoryKv::new();
        store.put(b"k", b"v").unwrap();
        store.delete(b"k").unwrap();
        assert!(store.get(b"k").unwrap().is_none());
    }

    // ── 4. iter_from returns ascending byte order from the seek point ───

    #[test]
    fn iter_from_is_ascending_from_seek() {
        let store = MemoryKv::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"c", b"3").unwrap();
        store.put(b"b", b"2").unwrap();
        let got: Vec<Vec<u8>> = store
            .iter_from(b"b")
            .unwrap()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(got, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    // ── 5. write_batch applies puts and deletes atomically ───────────────

    #[test]
    fn write_batch_applies_all_ops() {
        let store = MemoryKv::new();
        store.put(b"x", b"old").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"x".to_vec(), b"new".to_vec());
        batch.put(b"y".to_vec(), b"1".to_vec());
        batch.delete(b"z".to_vec());
        store.write_batch(batch).unwrap();
        assert_eq!(store.get(b"x").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"y").unwrap(), Some(b"1".to_vec()));
    }
}
