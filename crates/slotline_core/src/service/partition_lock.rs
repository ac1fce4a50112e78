//! One writer per partition.
//!
//! # Invariants
//! - Acquisition never blocks; a held partition is reported busy.
//! - A partition is released when its guard drops.

use crate::model::partition::PartitionKey;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Non-blocking write lock keyed by partition.
pub trait PartitionLock {
    /// Returns `false` when the partition is already held.
    fn try_lock(&self, key: PartitionKey) -> bool;
    fn unlock(&self, key: PartitionKey);
}

/// Held write lock; releases the partition on drop.
pub struct PartitionGuard<'l, L: PartitionLock + ?Sized> {
    locks: &'l L,
    key: PartitionKey,
}

impl<L: PartitionLock + ?Sized> PartitionGuard<'_, L> {
    pub fn key(&self) -> PartitionKey {
        self.key
    }
}

impl<L: PartitionLock + ?Sized> Drop for PartitionGuard<'_, L> {
    fn drop(&mut self) {
        self.locks.unlock(self.key);
    }
}

/// Acquires `key` on `locks`, `None` when busy.
pub fn try_acquire<L: PartitionLock + ?Sized>(
    locks: &L,
    key: PartitionKey,
) -> Option<PartitionGuard<'_, L>> {
    locks.try_lock(key).then(|| PartitionGuard { locks, key })
}

/// Partition locks shared by the threads of one process.
#[derive(Debug, Default)]
pub struct InProcessPartitionLocks {
    held: Mutex<HashSet<PartitionKey>>,
}

impl InProcessPartitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: PartitionKey) -> bool {
        self.held().contains(&key)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<PartitionKey>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PartitionLock for InProcessPartitionLocks {
    fn try_lock(&self, key: PartitionKey) -> bool {
        self.held().insert(key)
    }

    fn unlock(&self, key: PartitionKey) {
        self.held().remove(&key);
    }
}
