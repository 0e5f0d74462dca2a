//! Strongly consistent map facade
//!
//! Mirrors the record store contract (`get`/`put`/`set`/`remove`/
//! `delete`/`compare_and_set`) with every operation linearized through
//! the consensus log. Prefer `set` and `delete` over `put` and `remove`
//! when the previous value is not needed; they skip that read.

use crate::log::{ConsensusLog, CpError, LocalLog};
use crate::state::{CpCommand, CpMapState, CpResponse};
use keygrid_common::{Key, MapName, Value};
use std::sync::Arc;
use tracing::info;

/// Consensus-backed key-value map
pub struct CpMap {
    name: MapName,
    state: Arc<CpMapState>,
    log: Arc<dyn ConsensusLog>,
}

impl CpMap {
    /// Create a map over an existing state machine and consensus driver
    #[must_use]
    pub fn new(name: MapName, state: Arc<CpMapState>, log: Arc<dyn ConsensusLog>) -> Self {
        Self { name, state, log }
    }

    /// Create a map driven by an in-process single-node group
    #[must_use]
    pub fn local(name: MapName) -> Self {
        let state = Arc::new(CpMapState::new());
        let log = Arc::new(LocalLog::new(Arc::clone(&state)));
        info!("Created CP map '{}' with a local group", name);
        Self::new(name, state, log)
    }

    /// Map name
    #[must_use]
    pub fn name(&self) -> &MapName {
        &self.name
    }

    /// State machine, for inspection
    #[must_use]
    pub fn state(&self) -> &Arc<CpMapState> {
        &self.state
    }

    async fn propose(&self, command: CpCommand) -> Result<CpResponse, CpError> {
        let committed = self.log.propose(command).await?;
        if committed.response == CpResponse::Destroyed {
            return Err(CpError::MapDestroyed);
        }
        Ok(committed.response)
    }

    /// Linearizable read
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>, CpError> {
        match self.propose(CpCommand::Get { key: key.into() }).await? {
            CpResponse::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Insert or replace a value, returning the previous one
    pub async fn put(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, CpError> {
        let command = CpCommand::Put {
            key: key.into(),
            value: value.into(),
        };
        match self.propose(command).await? {
            CpResponse::Previous(previous) => Ok(previous),
            other => Err(unexpected(other)),
        }
    }

    /// Insert or replace a value without reading the previous one
    pub async fn set(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<(), CpError> {
        let command = CpCommand::Set {
            key: key.into(),
            value: value.into(),
        };
        match self.propose(command).await? {
            CpResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a key, returning the value it held
    pub async fn remove(&self, key: impl Into<Key>) -> Result<Option<Value>, CpError> {
        match self.propose(CpCommand::Remove { key: key.into() }).await? {
            CpResponse::Previous(previous) => Ok(previous),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a key without reading the previous value
    pub async fn delete(&self, key: impl Into<Key>) -> Result<(), CpError> {
        match self.propose(CpCommand::Delete { key: key.into() }).await? {
            CpResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Atomically replace the value of `key` if it equals `expected`
    ///
    /// A single proposed command, evaluated when it applies; two
    /// concurrent swaps with the same expectation can never both
    /// succeed.
    pub async fn compare_and_set(
        &self,
        key: impl Into<Key>,
        expected: impl Into<Value>,
        new: impl Into<Value>,
    ) -> Result<bool, CpError> {
        let command = CpCommand::CompareAndSet {
            key: key.into(),
            expected: expected.into(),
            new: new.into(),
        };
        match self.propose(command).await? {
            CpResponse::Swapped(swapped) => Ok(swapped),
            other => Err(unexpected(other)),
        }
    }

    /// Number of entries
    pub async fn size(&self) -> Result<usize, CpError> {
        match self.propose(CpCommand::Size).await? {
            CpResponse::Size(size) => Ok(size),
            other => Err(unexpected(other)),
        }
    }

    /// Tear the map down for the whole group
    pub async fn destroy(&self) -> Result<(), CpError> {
        match self.propose(CpCommand::Destroy).await? {
            CpResponse::Done => {
                info!("Destroyed CP map '{}'", self.name);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: CpResponse) -> CpError {
    CpError::Rejected(format!("unexpected response: {response:?}"))
}
