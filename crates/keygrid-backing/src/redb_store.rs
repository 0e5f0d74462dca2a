//! Embedded backing store over redb
//!
//! Persists stored entries in a single redb table, bincode-encoded.
//! Batches override the trait defaults with genuine transactions: a
//! `store_all`/`delete_all` commits atomically, so a failed batch
//! reports every key as failed rather than an arbitrary prefix.
//!
//! redb permits one write transaction at a time; the adapter serializes
//! writers behind its own lock so concurrent partition workers queue
//! here instead of erroring.

use crate::store::{BackingError, BackingResult, BatchError, ExternalStore, KeyStream};
use async_trait::async_trait;
use futures::StreamExt;
use keygrid_common::{Key, StoredEntry, epoch_millis};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

/// Keys fetched per read transaction while streaming the key space
const KEY_CHUNK: usize = 128;

fn redb_err(context: &str, err: impl fmt::Display) -> BackingError {
    BackingError::new(format!("{context}: {err}"))
}

/// Backing store over an embedded redb database
pub struct RedbStore {
    db: Arc<Database>,
    /// Serializes write transactions; redb allows a single writer
    write_lock: Mutex<()>,
}

impl RedbStore {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> BackingResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| redb_err("failed to create backing dir", e))?;
        }
        let db = Database::create(path).map_err(|e| redb_err("failed to open database", e))?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db
            .begin_write()
            .map_err(|e| redb_err("failed to begin txn", e))?;
        {
            let _t = write_txn
                .open_table(ENTRIES)
                .map_err(|e| redb_err("failed to open table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| redb_err("failed to commit", e))?;

        info!("Opened redb backing store at {:?}", path);

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn decode(bytes: &[u8]) -> BackingResult<StoredEntry> {
        bincode::deserialize(bytes).map_err(|e| redb_err("failed to decode entry", e))
    }

    fn encode(entry: &StoredEntry) -> BackingResult<Vec<u8>> {
        bincode::serialize(entry).map_err(|e| redb_err("failed to encode entry", e))
    }

    fn write_batch(
        &self,
        stores: &[(Key, StoredEntry)],
        deletes: &[Key],
    ) -> BackingResult<()> {
        let _guard = self.write_lock.lock();
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| redb_err("failed to begin txn", e))?;
        {
            let mut table = write_txn
                .open_table(ENTRIES)
                .map_err(|e| redb_err("failed to open table", e))?;
            for (key, entry) in stores {
                let bytes = Self::encode(entry)?;
                let _ = table
                    .insert(key.as_bytes(), bytes.as_slice())
                    .map_err(|e| redb_err("failed to insert", e))?;
            }
            for key in deletes {
                let _ = table
                    .remove(key.as_bytes())
                    .map_err(|e| redb_err("failed to remove", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| redb_err("failed to commit", e))
    }

    fn keys_after(db: &Database, after: Option<&Key>) -> BackingResult<Vec<Key>> {
        let read_txn = db
            .begin_read()
            .map_err(|e| redb_err("failed to begin read txn", e))?;
        let table = read_txn
            .open_table(ENTRIES)
            .map_err(|e| redb_err("failed to open table", e))?;

        let lower = match after {
            Some(key) => Bound::Excluded(key.as_bytes()),
            None => Bound::Unbounded,
        };
        let range = table
            .range::<&[u8]>((lower, Bound::Unbounded))
            .map_err(|e| redb_err("failed to range", e))?;

        let mut keys = Vec::with_capacity(KEY_CHUNK);
        for item in range.take(KEY_CHUNK) {
            let (key, _) = item.map_err(|e| redb_err("failed to iterate", e))?;
            keys.push(Key::from(key.value().to_vec()));
        }
        Ok(keys)
    }
}

struct KeyScan {
    db: Arc<Database>,
    buffered: VecDeque<Key>,
    last: Option<Key>,
    done: bool,
}

#[async_trait]
impl ExternalStore for RedbStore {
    fn name(&self) -> &str {
        "redb"
    }

    async fn load(&self, key: &Key) -> BackingResult<Option<StoredEntry>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| redb_err("failed to begin read txn", e))?;
        let table = read_txn
            .open_table(ENTRIES)
            .map_err(|e| redb_err("failed to open table", e))?;

        let Some(guard) = table
            .get(key.as_bytes())
            .map_err(|e| redb_err("failed to get", e))?
        else {
            return Ok(None);
        };

        let entry = Self::decode(guard.value())?;
        if entry.is_expired(epoch_millis()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn load_all(&self, keys: &[Key]) -> BackingResult<Vec<(Key, StoredEntry)>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| redb_err("failed to begin read txn", e))?;
        let table = read_txn
            .open_table(ENTRIES)
            .map_err(|e| redb_err("failed to open table", e))?;

        let now = epoch_millis();
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(guard) = table
                .get(key.as_bytes())
                .map_err(|e| redb_err("failed to get", e))?
            else {
                continue;
            };
            let entry = Self::decode(guard.value())?;
            if !entry.is_expired(now) {
                loaded.push((key.clone(), entry));
            }
        }
        Ok(loaded)
    }

    async fn load_all_keys(&self) -> BackingResult<KeyStream> {
        let scan = KeyScan {
            db: Arc::clone(&self.db),
            buffered: VecDeque::new(),
            last: None,
            done: false,
        };

        let stream = futures::stream::unfold(scan, |mut scan| async move {
            if let Some(key) = scan.buffered.pop_front() {
                return Some((Ok(key), scan));
            }
            if scan.done {
                return None;
            }
            match RedbStore::keys_after(&scan.db, scan.last.as_ref()) {
                Ok(chunk) => {
                    if chunk.len() < KEY_CHUNK {
                        scan.done = true;
                    }
                    scan.last = chunk.last().cloned();
                    scan.buffered.extend(chunk);
                    scan.buffered
                        .pop_front()
                        .map(|key| (Ok(key), scan))
                }
                Err(err) => {
                    scan.done = true;
                    Some((Err(err), scan))
                }
            }
        })
        .boxed();

        Ok(stream)
    }

    async fn store(&self, key: &Key, entry: &StoredEntry) -> BackingResult<()> {
        self.write_batch(std::slice::from_ref(&(key.clone(), entry.clone())), &[])
    }

    async fn store_all(&self, entries: &[(Key, StoredEntry)]) -> Result<(), BatchError> {
        // One transaction: the batch lands atomically or not at all.
        self.write_batch(entries, &[]).map_err(|err| {
            BatchError::new(
                entries.len(),
                entries
                    .iter()
                    .map(|(key, _)| (key.clone(), err.clone()))
                    .collect(),
            )
        })
    }

    async fn delete(&self, key: &Key) -> BackingResult<()> {
        self.write_batch(&[], std::slice::from_ref(key))
    }

    async fn delete_all(&self, keys: &[Key]) -> Result<(), BatchError> {
        self.write_batch(&[], keys).map_err(|err| {
            BatchError::new(
                keys.len(),
                keys.iter().map(|key| (key.clone(), err.clone())).collect(),
            )
        })
    }
}
