//! Deterministic state machine behind the CP map
//!
//! `apply` is pure of I/O and deterministic: replicas applying the same
//! commands at the same indices hold identical state. Compare-and-set
//! is a single command evaluated at apply time, never a read followed
//! by a separate proposal.

use keygrid_common::{Key, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One proposed operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpCommand {
    /// Linearizable read
    Get { key: Key },
    /// Insert or replace, returning the previous value
    Put { key: Key, value: Value },
    /// Insert or replace without reading the previous value
    Set { key: Key, value: Value },
    /// Remove, returning the previous value
    Remove { key: Key },
    /// Remove without reading the previous value
    Delete { key: Key },
    /// Replace the value if it currently equals `expected`
    CompareAndSet {
        key: Key,
        expected: Value,
        new: Value,
    },
    /// Number of entries
    Size,
    /// Tear the map down for the whole group
    Destroy,
}

/// Response produced when a command is applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpResponse {
    /// Read result
    Value(Option<Value>),
    /// Previous value of a put/remove
    Previous(Option<Value>),
    /// Fire-and-forget acknowledgement
    Done,
    /// Whether a compare-and-set applied
    Swapped(bool),
    /// Entry count
    Size(usize),
    /// The map was destroyed before this command applied
    Destroyed,
}

/// One entry of the CP state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusEntry {
    /// Current value
    pub value: Value,
    /// Per-key mutation counter, assigned at apply time
    pub version: u64,
}

/// Replicated state of one CP map
#[derive(Default)]
pub struct CpMapState {
    entries: RwLock<HashMap<Key, ConsensusEntry>>,
    last_applied: AtomicU64,
    destroyed: AtomicBool,
}

impl CpMapState {
    /// Create an empty state machine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last applied command
    #[must_use]
    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Check whether the map has been destroyed
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Current version of a key, for inspection
    #[must_use]
    pub fn version_of(&self, key: &Key) -> Option<u64> {
        self.entries.read().get(key).map(|e| e.version)
    }

    /// Apply one committed command
    ///
    /// Called by the consensus driver in commit order, exactly once per
    /// index.
    pub fn apply(&self, index: u64, command: &CpCommand) -> CpResponse {
        self.last_applied.store(index, Ordering::SeqCst);

        if self.is_destroyed() {
            return CpResponse::Destroyed;
        }

        match command {
            CpCommand::Get { key } => {
                CpResponse::Value(self.entries.read().get(key).map(|e| e.value.clone()))
            }
            CpCommand::Put { key, value } => {
                CpResponse::Previous(self.insert(key.clone(), value.clone()))
            }
            CpCommand::Set { key, value } => {
                let _ = self.insert(key.clone(), value.clone());
                CpResponse::Done
            }
            CpCommand::Remove { key } => {
                CpResponse::Previous(self.entries.write().remove(key).map(|e| e.value))
            }
            CpCommand::Delete { key } => {
                let _ = self.entries.write().remove(key);
                CpResponse::Done
            }
            CpCommand::CompareAndSet { key, expected, new } => {
                let mut entries = self.entries.write();
                match entries.get_mut(key) {
                    Some(entry) if entry.value == *expected => {
                        entry.version += 1;
                        entry.value = new.clone();
                        CpResponse::Swapped(true)
                    }
                    _ => CpResponse::Swapped(false),
                }
            }
            CpCommand::Size => CpResponse::Size(self.entries.read().len()),
            CpCommand::Destroy => {
                self.entries.write().clear();
                self.destroyed.store(true, Ordering::SeqCst);
                CpResponse::Done
            }
        }
    }

    fn insert(&self, key: Key, value: Value) -> Option<Value> {
        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.version += 1;
                Some(std::mem::replace(&mut entry.value, value))
            }
            None => {
                entries.insert(key, ConsensusEntry { value, version: 1 });
                None
            }
        }
    }
}
