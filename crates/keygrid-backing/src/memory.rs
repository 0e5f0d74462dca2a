//! In-memory backing store
//!
//! Reference implementation of the [`ExternalStore`] contract over a
//! concurrent hash map. Doubles as the test harness for everything that
//! talks to a backing store: operations can be counted, taken offline,
//! or poisoned per key to exercise retry and partial-failure paths.
//!
//! Batch operations deliberately use the trait's naive per-key defaults,
//! so this adapter also exercises that path.

use crate::store::{BackingError, BackingResult, ExternalStore, KeyStream};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use keygrid_common::{Key, StoredEntry, epoch_millis};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Concurrent in-memory backing store with fault injection
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<Key, StoredEntry>,
    poisoned: DashSet<Key>,
    offline: AtomicBool,
    stores: AtomicU64,
    deletes: AtomicU64,
    loads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently persisted
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total `store` invocations observed
    #[must_use]
    pub fn stores_total(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Total `delete` invocations observed
    #[must_use]
    pub fn deletes_total(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Total `load` invocations observed
    #[must_use]
    pub fn loads_total(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Read an entry directly, bypassing the adapter contract
    #[must_use]
    pub fn peek(&self, key: &Key) -> Option<StoredEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Insert an entry directly, bypassing the adapter contract
    pub fn seed(&self, key: Key, entry: StoredEntry) {
        self.entries.insert(key, entry);
    }

    /// Make every operation fail with a retryable error until restored
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make mutations of one key fail with a non-retryable error
    pub fn poison(&self, key: Key) {
        let _ = self.poisoned.insert(key);
    }

    /// Undo [`Self::poison`] for one key
    pub fn heal(&self, key: &Key) {
        let _ = self.poisoned.remove(key);
    }

    fn check_online(&self) -> BackingResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackingError::retryable("store offline"));
        }
        Ok(())
    }

    fn check_key(&self, key: &Key) -> BackingResult<()> {
        if self.poisoned.contains(key) {
            return Err(BackingError::new(format!("poisoned key: {key:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &Key) -> BackingResult<Option<StoredEntry>> {
        self.check_online()?;
        let _ = self.loads.fetch_add(1, Ordering::Relaxed);
        let now = epoch_millis();
        Ok(self
            .entries
            .get(key)
            .map(|e| e.clone())
            .filter(|e| !e.is_expired(now)))
    }

    async fn load_all_keys(&self) -> BackingResult<KeyStream> {
        self.check_online()?;
        let keys: Vec<Key> = self.entries.iter().map(|e| e.key().clone()).collect();
        Ok(futures::stream::iter(keys.into_iter().map(Ok)).boxed())
    }

    async fn store(&self, key: &Key, entry: &StoredEntry) -> BackingResult<()> {
        self.check_online()?;
        self.check_key(key)?;
        let _ = self.stores.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &Key) -> BackingResult<()> {
        self.check_online()?;
        self.check_key(key)?;
        let _ = self.deletes.fetch_add(1, Ordering::Relaxed);
        self.entries.remove(key);
        Ok(())
    }
}
