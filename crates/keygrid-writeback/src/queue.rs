//! Coalescing pending-write buffer
//!
//! Per-entry state machine relative to the backing store:
//!
//! ```text
//! absent (clean) --mutation--> Dirty --batch pickup--> Flushing
//!   Flushing --success--> removed (clean)
//!   Flushing --failure--> Dirty (attempts + 1), or removed after the
//!                         retry limit
//!   Flushing --newer mutation--> stays Flushing with the new operation;
//!                         the in-flight acknowledgement re-arms it to
//!                         Dirty instead of clearing it
//! ```
//!
//! The version carried by each operation is the record store's per-key
//! mutation counter; acknowledgements only settle the exact version they
//! flushed, which is what keeps a superseding mutation safe.

use keygrid_common::{Key, StoredEntry};
use std::collections::HashMap;
use parking_lot::Mutex;

/// One buffered operation against the backing store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingOp {
    /// Persist this value (with its expiration metadata)
    Store(StoredEntry),
    /// Remove the key from the backing store
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingState {
    Dirty,
    Flushing,
}

#[derive(Debug)]
struct PendingEntry {
    op: PendingOp,
    version: u64,
    state: PendingState,
    attempts: u32,
}

/// An operation handed to the flusher
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub key: Key,
    pub op: PendingOp,
    pub version: u64,
    pub attempts: u32,
}

/// Result of acknowledging a failed flush
#[derive(Debug, PartialEq, Eq)]
pub enum Requeue {
    /// The entry went back to dirty and will be retried
    Retry,
    /// The retry limit is exhausted; the entry was dropped
    GaveUp,
    /// A newer mutation superseded the flushed one; it will flush next
    Superseded,
}

/// Coalescing buffer of pending backing-store operations
#[derive(Default)]
pub struct WriteBuffer {
    inner: Mutex<HashMap<Key, PendingEntry>>,
}

impl WriteBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a store operation, coalescing any pending one
    pub fn enqueue_store(&self, key: Key, entry: StoredEntry, version: u64) {
        self.enqueue(key, PendingOp::Store(entry), version);
    }

    /// Buffer a delete operation, coalescing any pending one
    pub fn enqueue_delete(&self, key: Key, version: u64) {
        self.enqueue(key, PendingOp::Delete, version);
    }

    fn enqueue(&self, key: Key, op: PendingOp, version: u64) {
        let mut inner = self.inner.lock();
        match inner.get_mut(&key) {
            Some(existing) => {
                // Coalesce: latest operation wins. If the previous one is
                // in flight the state stays Flushing so this key is not
                // picked up again until that flush settles.
                existing.op = op;
                existing.version = version;
                existing.attempts = 0;
            }
            None => {
                inner.insert(
                    key,
                    PendingEntry {
                        op,
                        version,
                        state: PendingState::Dirty,
                        attempts: 0,
                    },
                );
            }
        }
    }

    /// Operation currently buffered for a key, if any
    ///
    /// Read-through callers consult this before loading from the backing
    /// store: a buffered delete means the key is gone even though the
    /// store still holds it, and a buffered store is fresher than the
    /// store's copy.
    #[must_use]
    pub fn pending_op(&self, key: &Key) -> Option<PendingOp> {
        self.inner.lock().get(key).map(|e| e.op.clone())
    }

    /// Total pending entries (dirty and in flight)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of entries eligible for pickup
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|e| e.state == PendingState::Dirty)
            .count()
    }

    /// Take up to `max` dirty entries, marking them in flight
    pub fn take_batch(&self, max: usize) -> Vec<BatchItem> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::new();
        for (key, entry) in inner.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if entry.state != PendingState::Dirty {
                continue;
            }
            entry.state = PendingState::Flushing;
            batch.push(BatchItem {
                key: key.clone(),
                op: entry.op.clone(),
                version: entry.version,
                attempts: entry.attempts,
            });
        }
        batch
    }

    /// Settle a successful flush of `version`
    ///
    /// Returns true if the entry is now clean; false if a newer mutation
    /// superseded the flushed one and remains pending.
    pub fn settle_success(&self, key: &Key, version: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(key) else {
            return true;
        };
        if entry.version == version {
            let _ = inner.remove(key);
            true
        } else {
            // The flushed value is already stale; re-arm the newer one.
            entry.state = PendingState::Dirty;
            false
        }
    }

    /// Settle a failed flush of `version`
    pub fn settle_failure(&self, key: &Key, version: u64, max_retries: u32) -> Requeue {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(key) else {
            return Requeue::GaveUp;
        };
        if entry.version != version {
            entry.state = PendingState::Dirty;
            return Requeue::Superseded;
        }
        entry.attempts += 1;
        if entry.attempts > max_retries {
            let _ = inner.remove(key);
            Requeue::GaveUp
        } else {
            entry.state = PendingState::Dirty;
            Requeue::Retry
        }
    }

    /// Drop every pending entry (map destroyed)
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
