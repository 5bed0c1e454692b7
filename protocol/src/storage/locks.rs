//! Per-record mutation locks.
//!
//! sled gives us atomic writes but not atomic read-modify-write across a
//! validation step. Every engine that reads a record, checks something and
//! writes it back takes the record's lock first. Locks are per key, so two
//! different pools (or relationships) never wait on each other.
//!
//! An entry lives only while someone holds or waits on it: the last guard
//! out removes the key, so the table stays as small as the current
//! contention rather than growing with every id ever touched.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Guard returned by [`KeyedLocks::lock`]. Dropping it releases the key.
pub struct KeyGuard<'a> {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    table: &'a KeyedLocks,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the shard lock, so a count of one
        // here means nobody is holding or queued on this key.
        self.table
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

/// A lock table keyed by record id.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `key` is held.
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        // Clone the Arc out so the shard lock is released before we block
        // on the record mutex.
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            guard: Some(lock.lock_arc()),
            table: self,
            key: key.to_string(),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
