//! Authoritative per-partition record store
//!
//! One record store owns the in-memory mapping for one partition: the
//! entries, the partition's digest tree, and the per-partition version
//! counter. All mutations go through the partition write lock, so
//! mutations to one partition are serial while partitions stay
//! independent, and versions assigned under the lock are monotonic per
//! key.
//!
//! Entry events are published while the lock is held, which pins event
//! order to mutation order per key.

use keygrid_common::{
    DigestTree, DigestTreeConfig, EntryRecord, Key, MapName, PartitionId, StoredEntry, Value,
    entry_digest, epoch_millis,
};
use keygrid_events::{EntryEvent, EventBus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of an upsert (put/set)
#[derive(Debug)]
pub struct UpsertOutcome {
    /// Previous live value, if the key held one
    pub previous: Option<Value>,
    /// Version assigned to the mutation
    pub version: u64,
}

/// Result of a remove/delete
#[derive(Debug)]
pub struct RemoveOutcome {
    /// Previous live value, if the key held one
    pub previous: Option<Value>,
    /// Value that was physically present but already expired
    pub expired: Option<Value>,
    /// Version assigned to the mutation
    pub version: u64,
}

/// Result of a compare-and-set
#[derive(Debug)]
pub struct CasOutcome {
    /// Whether the swap was applied
    pub swapped: bool,
    /// Version assigned to the swap (meaningful only when applied)
    pub version: u64,
}

/// One entry of a digest tree leaf, as exchanged during anti-entropy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// Entry key
    pub key: Key,
    /// Entry value
    pub value: Value,
    /// Local version of the entry
    pub version: u64,
    /// Absolute expiration time, if any
    pub expires_at: Option<u64>,
}

struct Inner {
    entries: HashMap<Key, EntryRecord>,
    tree: DigestTree,
    /// Partition-monotonic version counter; per-key monotonic follows
    next_version: u64,
}

impl Inner {
    fn assign_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Fold a physical entry transition into the digest tree
    fn digest_transition(&mut self, key: &Key, old: Option<&Value>, new: Option<&Value>) {
        let bucket = self.tree.bucket_of(key);
        let old_digest = old.map_or(0, |v| entry_digest(key, v));
        let new_digest = new.map_or(0, |v| entry_digest(key, v));
        self.tree.update(bucket, old_digest, new_digest);
    }
}

/// Authoritative in-memory store for one partition of one map
pub struct RecordStore {
    partition: PartitionId,
    map: MapName,
    events: Arc<EventBus>,
    inner: RwLock<Inner>,
}

impl RecordStore {
    /// Create an empty record store
    #[must_use]
    pub fn new(
        partition: PartitionId,
        map: MapName,
        tree_config: DigestTreeConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            partition,
            map,
            events,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                tree: DigestTree::new(tree_config),
                next_version: 0,
            }),
        }
    }

    /// Partition this store owns
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Read a live value; expired entries read as absent
    #[must_use]
    pub fn get(&self, key: &Key, now: u64) -> Option<Value> {
        let inner = self.inner.read();
        inner
            .entries
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.value.clone())
    }

    /// Read the full record, expired or not
    #[must_use]
    pub fn get_record(&self, key: &Key) -> Option<EntryRecord> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Insert or replace a value
    ///
    /// `dirty` marks the record as unconfirmed by the backing store.
    /// Publishes `Added` or `Updated`; an expired previous value reads
    /// as absent, so replacing it publishes `Added`.
    pub fn upsert(
        &self,
        key: Key,
        value: Value,
        expires_at: Option<u64>,
        dirty: bool,
    ) -> UpsertOutcome {
        let now = epoch_millis();
        let mut inner = self.inner.write();
        let version = inner.assign_version();

        let physical_old = inner.entries.get(&key).map(|r| r.value.clone());
        let previous = inner
            .entries
            .get(&key)
            .filter(|r| !r.is_expired(now))
            .map(|r| r.value.clone());

        inner.digest_transition(&key, physical_old.as_ref(), Some(&value));
        let mut record = EntryRecord::new(value.clone(), version);
        record.expires_at = expires_at;
        record.dirty = dirty;
        inner.entries.insert(key.clone(), record);
        drop_and_publish(inner, &self.events, match previous.clone() {
            Some(old) => EntryEvent::updated(self.map.clone(), key, old, value),
            None => EntryEvent::added(self.map.clone(), key, value),
        });

        UpsertOutcome { previous, version }
    }

    /// Remove a key
    ///
    /// Publishes `Removed` when a live value was present, `Expired` when
    /// only an expired one was. A version is assigned either way so the
    /// caller can order a backing-store delete.
    pub fn remove(&self, key: &Key) -> RemoveOutcome {
        let now = epoch_millis();
        let mut inner = self.inner.write();
        let version = inner.assign_version();

        let Some(record) = inner.entries.remove(key) else {
            return RemoveOutcome {
                previous: None,
                expired: None,
                version,
            };
        };

        inner.digest_transition(key, Some(&record.value), None);
        if record.is_expired(now) {
            drop_and_publish(
                inner,
                &self.events,
                EntryEvent::expired(self.map.clone(), key.clone(), record.value.clone()),
            );
            RemoveOutcome {
                previous: None,
                expired: Some(record.value),
                version,
            }
        } else {
            drop_and_publish(
                inner,
                &self.events,
                EntryEvent::removed(self.map.clone(), key.clone(), Some(record.value.clone())),
            );
            RemoveOutcome {
                previous: Some(record.value),
                expired: None,
                version,
            }
        }
    }

    /// Atomically replace the value if it currently equals `expected`
    ///
    /// Evaluated entirely under the partition lock: two concurrent swaps
    /// with the same expectation can never both succeed.
    pub fn compare_and_set(
        &self,
        key: &Key,
        expected: &Value,
        new: Value,
        dirty: bool,
    ) -> CasOutcome {
        let now = epoch_millis();
        let mut inner = self.inner.write();

        let matches = inner
            .entries
            .get(key)
            .filter(|r| !r.is_expired(now))
            .is_some_and(|r| r.value == *expected);
        if !matches {
            return CasOutcome {
                swapped: false,
                version: 0,
            };
        }

        let version = inner.assign_version();
        let old = inner.entries.get(key).map(|r| r.value.clone());
        inner.digest_transition(key, old.as_ref(), Some(&new));
        let expires_at = inner.entries.get(key).and_then(|r| r.expires_at);
        let mut record = EntryRecord::new(new.clone(), version);
        record.expires_at = expires_at;
        record.dirty = dirty;
        inner.entries.insert(key.clone(), record);
        drop_and_publish(
            inner,
            &self.events,
            EntryEvent::updated(self.map.clone(), key.clone(), expected.clone(), new),
        );

        CasOutcome {
            swapped: true,
            version,
        }
    }

    /// Drop a key from memory without touching the backing store
    ///
    /// Publishes `Evicted` for a live value; an expired one is dropped
    /// silently (the sweep would have claimed it anyway).
    pub fn evict(&self, key: &Key) -> Option<Value> {
        let now = epoch_millis();
        let mut inner = self.inner.write();
        let record = inner.entries.remove(key)?;
        inner.digest_transition(key, Some(&record.value), None);
        if record.is_expired(now) {
            return None;
        }
        drop_and_publish(
            inner,
            &self.events,
            EntryEvent::evicted(self.map.clone(), key.clone(), record.value.clone()),
        );
        Some(record.value)
    }

    /// Install a clean entry loaded from the backing store
    ///
    /// No event is published. If a live entry raced in meanwhile it
    /// wins, and its value is returned.
    pub fn install_clean(&self, key: Key, stored: StoredEntry) -> Value {
        let now = epoch_millis();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.entries.get(&key)
            && !existing.is_expired(now)
        {
            return existing.value.clone();
        }

        let version = inner.assign_version();
        let physical_old = inner.entries.get(&key).map(|r| r.value.clone());
        inner.digest_transition(&key, physical_old.as_ref(), Some(&stored.value));
        let mut record = EntryRecord::new(stored.value.clone(), version);
        record.expires_at = stored.expires_at;
        inner.entries.insert(key, record);
        stored.value
    }

    /// Clear the dirty flag if the record still holds `version`
    pub fn mark_clean(&self, key: &Key, version: u64) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.entries.get_mut(key)
            && record.version == version
        {
            record.dirty = false;
        }
    }

    /// Remove every expired entry, publishing `Expired` for each
    ///
    /// Returns the number of entries swept.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<Key> = inner
            .entries
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(record) = inner.entries.remove(key) {
                inner.digest_transition(key, Some(&record.value), None);
                self.events.publish(EntryEvent::expired(
                    self.map.clone(),
                    key.clone(),
                    record.value,
                ));
            }
        }
        expired.len()
    }

    /// Drop every entry; the caller publishes the map-level event
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.tree.reset();
        count
    }

    /// Atomically take every entry for handoff, leaving the store empty
    ///
    /// The version counter survives so re-used stores keep assigning
    /// monotonic versions.
    pub fn drain(&self) -> Vec<(Key, EntryRecord)> {
        let mut inner = self.inner.write();
        inner.tree.reset();
        inner.entries.drain().collect()
    }

    /// Install entries handed off from another owner
    ///
    /// Replaces current contents; versions and dirty flags are kept, and
    /// the version counter advances past the highest installed version.
    pub fn install(&self, entries: Vec<(Key, EntryRecord)>) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.tree.reset();
        for (key, record) in entries {
            let bucket = inner.tree.bucket_of(&key);
            let digest = entry_digest(&key, &record.value);
            inner.tree.update(bucket, 0, digest);
            inner.next_version = inner.next_version.max(record.version);
            inner.entries.insert(key, record);
        }
    }

    /// Number of physically present entries (expired ones included
    /// until swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Check whether the partition holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Number of entries not yet confirmed by the backing store
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.inner
            .read()
            .entries
            .values()
            .filter(|r| r.dirty)
            .count()
    }

    /// Root digest of the partition's tree
    pub fn root_digest(&self) -> u64 {
        self.inner.write().tree.root()
    }

    /// Digest of one tree node (heap index)
    pub fn node_digest(&self, node: usize) -> Option<u64> {
        self.inner.write().tree.node(node)
    }

    /// Digest tree depth
    #[must_use]
    pub fn tree_depth(&self) -> u32 {
        self.inner.read().tree.depth()
    }

    /// Entries hashed into one leaf bucket
    ///
    /// Physical contents: expired entries still present are included,
    /// matching what the digests cover.
    #[must_use]
    pub fn leaf_entries(&self, bucket: usize) -> Vec<LeafEntry> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|(key, _)| inner.tree.bucket_of(key) == bucket)
            .map(|(key, record)| LeafEntry {
                key: key.clone(),
                value: record.value.clone(),
                version: record.version,
                expires_at: record.expires_at,
            })
            .collect()
    }
}

/// Publish while the write guard is alive, then release it
///
/// `publish` never blocks, so holding the guard across it is cheap and
/// keeps event order identical to mutation order.
fn drop_and_publish(
    guard: parking_lot::RwLockWriteGuard<'_, Inner>,
    events: &EventBus,
    event: EntryEvent,
) {
    events.publish(event);
    drop(guard);
}
