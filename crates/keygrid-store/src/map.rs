//! Map facade over the partitioned record stores
//!
//! `GridMap` routes keys to partitions by hash, wires every mutation
//! into the event bus and the configured persistence mode, and runs the
//! background expiry sweeper. With a backing store attached, reads miss
//! through to it (consulting the write-behind buffer first so buffered
//! deletes are not resurrected) and `warm_up` populates the map from the
//! store's key space.

use crate::record::{LeafEntry, RecordStore};
use futures::StreamExt;
use keygrid_backing::ExternalStore;
use keygrid_common::{
    EntryRecord, Error, GridMapConfig, Key, MapName, PartitionId, PersistenceMode, Result,
    StoredEntry, Value, epoch_millis,
};
use keygrid_events::{EntryEvent, EntryListener, EventBus, SubscriptionId};
use keygrid_writeback::{FlushOutcome, PendingOp, WriteBehindCoordinator, WriteBehindStats};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

/// Seed for hashing keys onto partitions
const PARTITION_SEED: u64 = 0x6b67_7061_7274; // "kgpart"

fn route(key: &Key, partitions: usize) -> usize {
    (xxh64(key.as_bytes(), PARTITION_SEED) % partitions as u64) as usize
}

/// Counters snapshot for one map
#[derive(Debug, Clone)]
pub struct GridMapStats {
    /// Physically present entries across all partitions
    pub entries: usize,
    /// Entries not yet confirmed by the backing store
    pub dirty_entries: usize,
    /// Events dropped because the queue was full
    pub events_dropped: u64,
    /// Write-behind counters, when that mode is active
    pub write_behind: Option<WriteBehindStats>,
}

/// One distributed in-memory map
pub struct GridMap {
    name: MapName,
    config: GridMapConfig,
    partitions: Arc<Vec<RecordStore>>,
    backing: Option<Arc<dyn ExternalStore>>,
    writeback: Option<Arc<WriteBehindCoordinator>>,
    events: Arc<EventBus>,
    destroyed: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    ack_worker: Mutex<Option<JoinHandle<()>>>,
}

impl GridMap {
    /// Create a map without a backing store
    pub fn new(name: MapName, config: GridMapConfig) -> Result<Self> {
        if config.persistence.is_enabled() {
            return Err(Error::configuration(
                "persistence is enabled but no backing store was supplied",
            ));
        }
        Self::build(name, config, None)
    }

    /// Create a map over a backing store
    pub fn with_backing(
        name: MapName,
        config: GridMapConfig,
        backing: Arc<dyn ExternalStore>,
    ) -> Result<Self> {
        Self::build(name, config, Some(backing))
    }

    fn build(
        name: MapName,
        config: GridMapConfig,
        backing: Option<Arc<dyn ExternalStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new(config.event_queue_capacity));
        let partitions: Arc<Vec<RecordStore>> = Arc::new(
            (0..config.partition_count)
                .map(|i| {
                    RecordStore::new(
                        PartitionId(i),
                        name.clone(),
                        config.digest_tree,
                        Arc::clone(&events),
                    )
                })
                .collect(),
        );

        let writeback = match (&config.persistence, &backing) {
            (PersistenceMode::WriteBehind(wb), Some(store)) => Some(Arc::new(
                WriteBehindCoordinator::new(Arc::clone(store), wb.clone()),
            )),
            _ => None,
        };

        let destroyed = Arc::new(AtomicBool::new(false));

        // Acknowledgement worker: clears dirty flags once the backing
        // store confirms a version. A give-up leaves the record dirty.
        let ack_worker = writeback.as_ref().and_then(|wb| wb.take_outcomes()).map(
            |mut outcomes| {
                let partitions = Arc::clone(&partitions);
                tokio::spawn(async move {
                    while let Some(outcome) = outcomes.recv().await {
                        match outcome {
                            FlushOutcome::Flushed { key, version } => {
                                let idx = route(&key, partitions.len());
                                partitions[idx].mark_clean(&key, version);
                            }
                            FlushOutcome::GaveUp { key, .. } => {
                                debug!("Record {:?} stays dirty after flush give-up", key);
                            }
                        }
                    }
                })
            },
        );

        let sweeper = {
            let partitions = Arc::clone(&partitions);
            let destroyed = Arc::clone(&destroyed);
            let map_name = name.clone();
            let interval = Duration::from_millis(config.expiry_sweep_interval_ms.max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if destroyed.load(Ordering::SeqCst) {
                        break;
                    }
                    let now = epoch_millis();
                    let swept: usize = partitions.iter().map(|p| p.sweep_expired(now)).sum();
                    if swept > 0 {
                        debug!("Swept {} expired entries from map '{}'", swept, map_name);
                    }
                }
            })
        };

        info!(
            "Created map '{}' with {} partitions ({} persistence)",
            name,
            config.partition_count,
            match &config.persistence {
                PersistenceMode::Disabled => "no",
                PersistenceMode::WriteThrough => "write-through",
                PersistenceMode::WriteBehind(_) => "write-behind",
            }
        );

        Ok(Self {
            name,
            config,
            partitions,
            backing,
            writeback,
            events,
            destroyed,
            sweeper: Mutex::new(Some(sweeper)),
            ack_worker: Mutex::new(ack_worker),
        })
    }

    /// Map name
    #[must_use]
    pub fn name(&self) -> &MapName {
        &self.name
    }

    /// Number of partitions
    #[must_use]
    pub fn partition_count(&self) -> u16 {
        self.config.partition_count
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::MapDestroyed(self.name.to_string()));
        }
        Ok(())
    }

    fn partition_of(&self, key: &Key) -> &RecordStore {
        &self.partitions[route(key, self.partitions.len())]
    }

    fn store_of(&self, partition: PartitionId) -> Result<&RecordStore> {
        self.partitions
            .get(partition.index())
            .ok_or_else(|| Error::internal(format!("no such partition: {partition}")))
    }

    fn persistence_dirty(&self) -> bool {
        self.config.persistence.is_enabled()
    }

    async fn persist_upsert(&self, key: &Key, stored: StoredEntry, version: u64) -> Result<()> {
        match &self.config.persistence {
            PersistenceMode::Disabled => Ok(()),
            PersistenceMode::WriteThrough => {
                let Some(backing) = &self.backing else {
                    return Err(Error::internal("write-through without a backing store"));
                };
                backing
                    .store(key, &stored)
                    .await
                    .map_err(|e| Error::backing(e.to_string()))?;
                self.partition_of(key).mark_clean(key, version);
                Ok(())
            }
            PersistenceMode::WriteBehind(_) => {
                let Some(writeback) = &self.writeback else {
                    return Err(Error::internal("write-behind without a coordinator"));
                };
                writeback.enqueue_store(key.clone(), stored, version);
                Ok(())
            }
        }
    }

    async fn persist_delete(&self, key: &Key, version: u64) -> Result<()> {
        match &self.config.persistence {
            PersistenceMode::Disabled => Ok(()),
            PersistenceMode::WriteThrough => {
                let Some(backing) = &self.backing else {
                    return Err(Error::internal("write-through without a backing store"));
                };
                backing
                    .delete(key)
                    .await
                    .map_err(|e| Error::backing(e.to_string()))
            }
            PersistenceMode::WriteBehind(_) => {
                let Some(writeback) = &self.writeback else {
                    return Err(Error::internal("write-behind without a coordinator"));
                };
                writeback.enqueue_delete(key.clone(), version);
                Ok(())
            }
        }
    }

    async fn upsert(
        &self,
        key: Key,
        value: Value,
        expires_at: Option<u64>,
    ) -> Result<Option<Value>> {
        self.ensure_live()?;
        let outcome = self.partition_of(&key).upsert(
            key.clone(),
            value.clone(),
            expires_at,
            self.persistence_dirty(),
        );
        self.persist_upsert(
            &key,
            StoredEntry { value, expires_at },
            outcome.version,
        )
        .await?;
        Ok(outcome.previous)
    }

    /// Insert or replace a value, returning the previous one
    pub async fn put(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>> {
        self.upsert(key.into(), value.into(), None).await
    }

    /// [`Self::put`] with a time-to-live
    pub async fn put_with_ttl(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        ttl_ms: u64,
    ) -> Result<Option<Value>> {
        let expires_at = epoch_millis().saturating_add(ttl_ms);
        self.upsert(key.into(), value.into(), Some(expires_at)).await
    }

    /// Insert or replace a value without reading the previous one
    ///
    /// Prefer this over [`Self::put`] when the previous value is not
    /// needed; it skips that read entirely.
    pub async fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let _ = self.upsert(key.into(), value.into(), None).await?;
        Ok(())
    }

    /// [`Self::set`] with a time-to-live
    pub async fn set_with_ttl(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        ttl_ms: u64,
    ) -> Result<()> {
        let expires_at = epoch_millis().saturating_add(ttl_ms);
        let _ = self.upsert(key.into(), value.into(), Some(expires_at)).await?;
        Ok(())
    }

    /// Remove a key, returning the value it held
    pub async fn remove(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.remove_inner(key.into()).await
    }

    /// Remove a key without reading the previous value
    ///
    /// Prefer this over [`Self::remove`] when the previous value is not
    /// needed.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let _ = self.remove_inner(key.into()).await?;
        Ok(())
    }

    async fn remove_inner(&self, key: Key) -> Result<Option<Value>> {
        self.ensure_live()?;
        let outcome = self.partition_of(&key).remove(&key);
        // The backing store may hold the key even when memory does not
        // (lazy warm-up), so the delete always goes through.
        self.persist_delete(&key, outcome.version).await?;
        Ok(outcome.previous)
    }

    /// Atomically replace the value of `key` if it equals `expected`
    pub async fn compare_and_set(
        &self,
        key: impl Into<Key>,
        expected: impl Into<Value>,
        new: impl Into<Value>,
    ) -> Result<bool> {
        self.ensure_live()?;
        let key = key.into();
        let new = new.into();
        let outcome = self.partition_of(&key).compare_and_set(
            &key,
            &expected.into(),
            new.clone(),
            self.persistence_dirty(),
        );
        if !outcome.swapped {
            return Ok(false);
        }
        let expires_at = self
            .partition_of(&key)
            .get_record(&key)
            .and_then(|r| r.expires_at);
        self.persist_upsert(
            &key,
            StoredEntry {
                value: new,
                expires_at,
            },
            outcome.version,
        )
        .await?;
        Ok(true)
    }

    /// Read a value, missing through to the backing store
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.ensure_live()?;
        let key = key.into();
        let now = epoch_millis();
        if let Some(value) = self.partition_of(&key).get(&key, now) {
            return Ok(Some(value));
        }

        let Some(backing) = &self.backing else {
            return Ok(None);
        };

        // A buffered operation is fresher than the store's copy.
        if let Some(writeback) = &self.writeback
            && let Some(op) = writeback.pending(&key)
        {
            return Ok(match op {
                PendingOp::Store(entry) if !entry.is_expired(now) => Some(entry.value),
                _ => None,
            });
        }

        match backing
            .load(&key)
            .await
            .map_err(|e| Error::backing(e.to_string()))?
        {
            Some(stored) if !stored.is_expired(now) => {
                Ok(Some(self.partition_of(&key).install_clean(key, stored)))
            }
            _ => Ok(None),
        }
    }

    /// Check whether a key has a live value (misses through like `get`)
    pub async fn contains_key(&self, key: impl Into<Key>) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Drop a key from memory without touching the backing store
    pub async fn evict(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.ensure_live()?;
        let key = key.into();
        Ok(self.partition_of(&key).evict(&key))
    }

    /// Drop every entry, publishing a single map-level `Cleared` event
    ///
    /// The backing store is untouched.
    pub async fn clear(&self) -> Result<usize> {
        self.ensure_live()?;
        let cleared: usize = self.partitions.iter().map(RecordStore::clear).sum();
        self.events.publish(EntryEvent::cleared(self.name.clone()));
        Ok(cleared)
    }

    /// Populate the map from the backing store's full key space
    ///
    /// Keys are enumerated lazily and loaded in batches; entries already
    /// live in memory win over the loaded copy. No events are published.
    /// Returns the number of entries installed.
    pub async fn warm_up(&self) -> Result<usize> {
        self.ensure_live()?;
        let Some(backing) = &self.backing else {
            return Err(Error::configuration("warm-up requires a backing store"));
        };

        let keys = backing
            .load_all_keys()
            .await
            .map_err(|e| Error::backing(e.to_string()))?;
        let mut batches = keys.chunks(self.config.warmup_batch);

        let mut installed = 0usize;
        while let Some(batch) = batches.next().await {
            let keys: std::result::Result<Vec<Key>, _> = batch.into_iter().collect();
            let keys = keys.map_err(|e| Error::backing(e.to_string()))?;
            let loaded = backing
                .load_all(&keys)
                .await
                .map_err(|e| Error::backing(e.to_string()))?;
            let now = epoch_millis();
            for (key, stored) in loaded {
                if stored.is_expired(now) {
                    continue;
                }
                let _ = self.partition_of(&key).install_clean(key, stored);
                installed += 1;
            }
        }

        info!("Warmed up map '{}' with {} entries", self.name, installed);
        Ok(installed)
    }

    /// Force-drain the write-behind buffer
    pub async fn flush(&self) -> Result<()> {
        self.ensure_live()?;
        if let Some(writeback) = &self.writeback {
            writeback.flush_now().await;
        }
        Ok(())
    }

    /// Register a listener for every event of this map
    pub fn subscribe(&self, listener: Arc<dyn EntryListener>) -> SubscriptionId {
        self.events.subscribe(self.name.clone(), listener)
    }

    /// Register a listener with a predicate
    pub fn subscribe_filtered(
        &self,
        predicate: impl Fn(&EntryEvent) -> bool + Send + Sync + 'static,
        listener: Arc<dyn EntryListener>,
    ) -> SubscriptionId {
        self.events
            .subscribe_filtered(self.name.clone(), predicate, listener)
    }

    /// Remove a listener registration
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Total physically present entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.iter().map(RecordStore::len).sum()
    }

    /// Check whether the map holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(RecordStore::is_empty)
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> GridMapStats {
        GridMapStats {
            entries: self.len(),
            dirty_entries: self.partitions.iter().map(RecordStore::dirty_len).sum(),
            events_dropped: self.events.dropped_total(),
            write_behind: self.writeback.as_ref().map(|wb| wb.stats()),
        }
    }

    /// Tear the map down: stops workers, drops pending flushes and
    /// all in-memory entries
    ///
    /// Every subsequent operation fails with a destroyed-map error.
    /// Anti-entropy runs in flight observe the flag and abort; repairs
    /// they already applied stand.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        if let Some(writeback) = &self.writeback {
            writeback.abort().await;
        }
        if let Some(ack_worker) = self.ack_worker.lock().take() {
            ack_worker.abort();
        }
        self.events.close().await;
        for partition in self.partitions.iter() {
            let _ = partition.clear();
        }
        info!("Destroyed map '{}'", self.name);
    }

    // ---- Partition-level surface (anti-entropy, rebalancing) ----

    /// Root digest of one partition's tree
    pub fn digest_root(&self, partition: PartitionId) -> Result<u64> {
        self.ensure_live()?;
        Ok(self.store_of(partition)?.root_digest())
    }

    /// Digest of one node (heap index) of one partition's tree
    pub fn digest_node(&self, partition: PartitionId, node: usize) -> Result<Option<u64>> {
        self.ensure_live()?;
        Ok(self.store_of(partition)?.node_digest(node))
    }

    /// Digest tree depth (identical across partitions)
    #[must_use]
    pub fn tree_depth(&self) -> u32 {
        self.config.digest_tree.depth
    }

    /// Entries of one leaf bucket of one partition
    pub fn leaf_entries(&self, partition: PartitionId, bucket: usize) -> Result<Vec<LeafEntry>> {
        self.ensure_live()?;
        Ok(self.store_of(partition)?.leaf_entries(bucket))
    }

    /// Apply an authoritative value from a replica
    ///
    /// Flows through the normal mutation path: events fire and the
    /// value is persisted per the configured mode. Reapplying the same
    /// value is harmless, which keeps repairs idempotent.
    pub async fn apply_repair(
        &self,
        key: Key,
        value: Value,
        expires_at: Option<u64>,
    ) -> Result<()> {
        let _ = self.upsert(key, value, expires_at).await?;
        Ok(())
    }

    /// Remove a key on behalf of a replica repair
    pub async fn apply_repair_remove(&self, key: Key) -> Result<()> {
        let _ = self.remove_inner(key).await?;
        Ok(())
    }

    /// Atomically take one partition's entries for handoff
    pub fn drain_partition(&self, partition: PartitionId) -> Result<Vec<(Key, EntryRecord)>> {
        self.ensure_live()?;
        Ok(self.store_of(partition)?.drain())
    }

    /// Install entries handed off from another owner of the partition
    pub fn install_partition(
        &self,
        partition: PartitionId,
        entries: Vec<(Key, EntryRecord)>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.store_of(partition)?.install(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_backing::MemoryStore;
    use keygrid_common::{DigestTreeConfig, WriteBehindConfig};
    use keygrid_events::{EventKind, ListenerError};
    use tokio::sync::mpsc;

    fn name(n: &str) -> MapName {
        MapName::new_unchecked(n)
    }

    fn base_config() -> GridMapConfig {
        GridMapConfig {
            partition_count: 4,
            digest_tree: DigestTreeConfig { depth: 6 },
            // Long interval: tests drive flushing and sweeping explicitly
            // unless stated otherwise.
            expiry_sweep_interval_ms: 60_000,
            ..GridMapConfig::default()
        }
    }

    fn write_behind_config() -> GridMapConfig {
        GridMapConfig {
            persistence: PersistenceMode::WriteBehind(WriteBehindConfig {
                flush_interval_ms: 60_000,
                flush_threshold: 10_000,
                ..WriteBehindConfig::default()
            }),
            ..base_config()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    struct Recording {
        notify: mpsc::UnboundedSender<(EventKind, Option<Key>)>,
    }

    impl EntryListener for Recording {
        fn on_event(&self, event: &EntryEvent) -> std::result::Result<(), ListenerError> {
            let _ = self.notify.send((event.kind, event.key.clone()));
            Ok(())
        }
    }

    fn recording() -> (Arc<Recording>, mpsc::UnboundedReceiver<(EventKind, Option<Key>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recording { notify: tx }), rx)
    }

    #[tokio::test]
    async fn test_set_get_remove_scenario() {
        let map = GridMap::new(name("capitals"), base_config()).unwrap();

        map.set("France", "Paris").await.unwrap();
        assert_eq!(map.get("France").await.unwrap(), Some(Value::from("Paris")));

        assert_eq!(
            map.remove("France").await.unwrap(),
            Some(Value::from("Paris"))
        );
        assert_eq!(map.get("France").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_set_scenario() {
        let map = GridMap::new(name("capitals"), base_config()).unwrap();

        map.set("Germany", "Munich").await.unwrap();
        assert!(map.compare_and_set("Germany", "Munich", "Berlin").await.unwrap());
        assert_eq!(
            map.get("Germany").await.unwrap(),
            Some(Value::from("Berlin"))
        );
        assert!(!map.compare_and_set("Germany", "Munich", "Berlin").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_returns_previous_value() {
        let map = GridMap::new(name("m"), base_config()).unwrap();

        assert_eq!(map.put("k", "1").await.unwrap(), None);
        assert_eq!(map.put("k", "2").await.unwrap(), Some(Value::from("1")));
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_through_installs_loaded_entry() {
        let backing = Arc::new(MemoryStore::new());
        backing.seed(Key::from("France"), StoredEntry::new(Value::from("Paris")));
        let map = GridMap::with_backing(name("m"), base_config(), backing.clone()).unwrap();

        assert_eq!(map.get("France").await.unwrap(), Some(Value::from("Paris")));
        assert_eq!(backing.loads_total(), 1);

        // Second read is memory-local.
        assert_eq!(map.get("France").await.unwrap(), Some(Value::from("Paris")));
        assert_eq!(backing.loads_total(), 1);
    }

    #[tokio::test]
    async fn test_write_through_blocks_until_confirmed() {
        let backing = Arc::new(MemoryStore::new());
        let config = GridMapConfig {
            persistence: PersistenceMode::WriteThrough,
            ..base_config()
        };
        let map = GridMap::with_backing(name("m"), config, backing.clone()).unwrap();

        map.set("k", "v").await.unwrap();
        assert_eq!(
            backing.peek(&Key::from("k")),
            Some(StoredEntry::new(Value::from("v")))
        );
        assert_eq!(map.stats().dirty_entries, 0);

        map.delete("k").await.unwrap();
        assert_eq!(backing.peek(&Key::from("k")), None);
    }

    #[tokio::test]
    async fn test_write_through_failure_surfaces_and_leaves_dirty() {
        let backing = Arc::new(MemoryStore::new());
        let config = GridMapConfig {
            persistence: PersistenceMode::WriteThrough,
            ..base_config()
        };
        let map = GridMap::with_backing(name("m"), config, backing.clone()).unwrap();

        backing.set_offline(true);
        assert!(map.set("k", "v").await.is_err());
        // The in-memory value stands, flagged as unconfirmed.
        assert_eq!(map.get("k").await.unwrap(), Some(Value::from("v")));
        assert_eq!(map.stats().dirty_entries, 1);
    }

    #[tokio::test]
    async fn test_write_behind_coalesces_to_one_store_write() {
        let backing = Arc::new(MemoryStore::new());
        let map = GridMap::with_backing(name("m"), write_behind_config(), backing.clone()).unwrap();

        map.put("k", "1").await.unwrap();
        map.put("k", "2").await.unwrap();
        map.put("k", "3").await.unwrap();
        assert_eq!(backing.stores_total(), 0);
        assert_eq!(map.stats().dirty_entries, 1);

        map.flush().await.unwrap();
        assert_eq!(backing.stores_total(), 1);
        assert_eq!(
            backing.peek(&Key::from("k")),
            Some(StoredEntry::new(Value::from("3")))
        );

        // The acknowledgement clears the dirty flag shortly after.
        wait_until(|| map.stats().dirty_entries == 0).await;
    }

    #[tokio::test]
    async fn test_buffered_delete_not_resurrected_by_read_through() {
        let backing = Arc::new(MemoryStore::new());
        backing.seed(Key::from("k"), StoredEntry::new(Value::from("stale")));
        let map = GridMap::with_backing(name("m"), write_behind_config(), backing.clone()).unwrap();

        map.delete("k").await.unwrap();
        // The delete is still buffered; the store copy must not win.
        assert_eq!(map.get("k").await.unwrap(), None);

        map.flush().await.unwrap();
        assert_eq!(backing.peek(&Key::from("k")), None);
    }

    #[tokio::test]
    async fn test_buffered_store_wins_over_store_copy() {
        let backing = Arc::new(MemoryStore::new());
        backing.seed(Key::from("k"), StoredEntry::new(Value::from("stale")));
        let map = GridMap::with_backing(name("m"), write_behind_config(), backing.clone()).unwrap();

        map.set("k", "fresh").await.unwrap();
        let _ = map.evict("k").await.unwrap();
        // Entry gone from memory, flush still pending: the buffered
        // value is the truth.
        assert_eq!(map.get("k").await.unwrap(), Some(Value::from("fresh")));
    }

    #[tokio::test]
    async fn test_warm_up_loads_full_key_space() {
        let backing = Arc::new(MemoryStore::new());
        for i in 0..600 {
            backing.seed(
                Key::from(format!("k{i}")),
                StoredEntry::new(Value::from(format!("v{i}"))),
            );
        }
        let map = GridMap::with_backing(name("m"), base_config(), backing.clone()).unwrap();

        let installed = map.warm_up().await.unwrap();
        assert_eq!(installed, 600);
        assert_eq!(map.len(), 600);
        assert_eq!(
            map.get("k123").await.unwrap(),
            Some(Value::from("v123"))
        );
    }

    #[tokio::test]
    async fn test_expired_entries_swept_with_event() {
        let config = GridMapConfig {
            expiry_sweep_interval_ms: 10,
            ..base_config()
        };
        let map = GridMap::new(name("m"), config).unwrap();
        let (listener, mut events) = recording();
        let _ = map.subscribe(listener);

        map.put_with_ttl("session", "data", 20).await.unwrap();
        assert_eq!(
            map.get("session").await.unwrap(),
            Some(Value::from("data"))
        );

        wait_until(|| map.len() == 0).await;
        assert_eq!(map.get("session").await.unwrap(), None);

        // Added, then Expired.
        let (kind, _) = events.recv().await.unwrap();
        assert_eq!(kind, EventKind::Added);
        let (kind, key) = events.recv().await.unwrap();
        assert_eq!(kind, EventKind::Expired);
        assert_eq!(key, Some(Key::from("session")));
    }

    #[tokio::test]
    async fn test_clear_publishes_single_event_without_keys() {
        let map = GridMap::new(name("m"), base_config()).unwrap();
        let (listener, mut events) = recording();
        let _ = map.subscribe_filtered(|e| e.kind == EventKind::Cleared, listener);

        map.set("a", "1").await.unwrap();
        map.set("b", "2").await.unwrap();
        assert_eq!(map.clear().await.unwrap(), 2);
        assert!(map.is_empty());

        let (kind, key) = events.recv().await.unwrap();
        assert_eq!(kind, EventKind::Cleared);
        assert_eq!(key, None);
    }

    #[tokio::test]
    async fn test_evict_publishes_evicted_and_keeps_backing() {
        let backing = Arc::new(MemoryStore::new());
        let config = GridMapConfig {
            persistence: PersistenceMode::WriteThrough,
            ..base_config()
        };
        let map = GridMap::with_backing(name("m"), config, backing.clone()).unwrap();
        let (listener, mut events) = recording();
        let _ = map.subscribe_filtered(|e| e.kind == EventKind::Evicted, listener);

        map.set("k", "v").await.unwrap();
        assert_eq!(map.evict("k").await.unwrap(), Some(Value::from("v")));

        let (kind, _) = events.recv().await.unwrap();
        assert_eq!(kind, EventKind::Evicted);

        // Still in the backing store; read-through brings it back.
        assert_eq!(map.get("k").await.unwrap(), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn test_destroyed_map_rejects_operations() {
        let map = GridMap::new(name("m"), base_config()).unwrap();
        map.set("k", "v").await.unwrap();
        map.destroy().await;

        assert!(matches!(
            map.get("k").await,
            Err(Error::MapDestroyed(_))
        ));
        assert!(matches!(
            map.set("k", "v").await,
            Err(Error::MapDestroyed(_))
        ));
    }

    #[tokio::test]
    async fn test_partition_handoff_between_maps() {
        let source = GridMap::new(name("m"), base_config()).unwrap();
        let target = GridMap::new(name("m"), base_config()).unwrap();

        for i in 0..50 {
            source.set(format!("k{i}"), format!("v{i}")).await.unwrap();
        }
        let digests_before: Vec<u64> = (0..source.partition_count())
            .map(|p| source.digest_root(PartitionId(p)).unwrap())
            .collect();

        for p in 0..source.partition_count() {
            let entries = source.drain_partition(PartitionId(p)).unwrap();
            target.install_partition(PartitionId(p), entries).unwrap();
        }

        assert!(source.is_empty());
        assert_eq!(target.len(), 50);
        assert_eq!(
            target.get("k17").await.unwrap(),
            Some(Value::from("v17"))
        );
        // The handoff preserved contents: digests match partition by
        // partition.
        for p in 0..target.partition_count() {
            assert_eq!(
                target.digest_root(PartitionId(p)).unwrap(),
                digests_before[p as usize]
            );
        }
    }

    #[tokio::test]
    async fn test_write_through_over_embedded_store() {
        use keygrid_backing::RedbStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cities.redb");
        let config = GridMapConfig {
            persistence: PersistenceMode::WriteThrough,
            ..base_config()
        };

        {
            let backing = Arc::new(RedbStore::open(&path).unwrap());
            let map = GridMap::with_backing(name("m"), config.clone(), backing).unwrap();
            map.set("France", "Paris").await.unwrap();
            map.set("Japan", "Tokyo").await.unwrap();
            map.delete("Japan").await.unwrap();
            map.destroy().await;
        }

        // A fresh map over the same file sees the persisted state.
        let backing = Arc::new(RedbStore::open(&path).unwrap());
        let map = GridMap::with_backing(name("m"), config, backing).unwrap();
        assert_eq!(map.len(), 0);
        assert_eq!(
            map.get("France").await.unwrap(),
            Some(Value::from("Paris"))
        );
        assert_eq!(map.get("Japan").await.unwrap(), None);
        assert_eq!(map.warm_up().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persistence_without_backing_rejected() {
        let config = GridMapConfig {
            persistence: PersistenceMode::WriteThrough,
            ..base_config()
        };
        assert!(GridMap::new(name("m"), config).is_err());
    }
}
