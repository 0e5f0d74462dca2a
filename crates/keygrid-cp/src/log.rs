//! Consensus log collaborator boundary
//!
//! The CP map proposes commands and waits for them to commit; how they
//! replicate is the driver's concern. A timed-out proposal is an
//! *indeterminate* outcome - it may yet commit - so it surfaces as
//! [`CpError::NotCommitted`], distinct from a definite rejection, and
//! callers are expected to re-check with a subsequent read or
//! compare-and-set.

use crate::state::{CpCommand, CpMapState, CpResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors of a CP map operation
#[derive(Debug, Error)]
pub enum CpError {
    /// The proposal did not commit within its window; the outcome is
    /// unknown and the caller must re-check
    #[error("proposal not committed: {0}")]
    NotCommitted(String),

    /// The proposal was definitely not applied
    #[error("proposal rejected: {0}")]
    Rejected(String),

    /// The map was destroyed
    #[error("map destroyed")]
    MapDestroyed,
}

/// A committed command: its log index and the state machine's response
#[derive(Debug)]
pub struct Committed {
    /// Commit index assigned by the group
    pub index: u64,
    /// Response produced when the command applied
    pub response: CpResponse,
}

/// Propose-and-wait contract against a consensus group
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Propose a command, wait for it to commit and apply, and return
    /// the applied response
    async fn propose(&self, command: CpCommand) -> Result<Committed, CpError>;
}

/// Single-group, in-process consensus driver
///
/// Commits immediately in proposal order under one lock, which makes it
/// linearizable for a group of one. Multi-node replication plugs in
/// behind the same trait.
pub struct LocalLog {
    state: Arc<CpMapState>,
    next_index: Mutex<u64>,
}

impl LocalLog {
    /// Create a driver over the given state machine
    #[must_use]
    pub fn new(state: Arc<CpMapState>) -> Self {
        Self {
            state,
            next_index: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ConsensusLog for LocalLog {
    async fn propose(&self, command: CpCommand) -> Result<Committed, CpError> {
        // One lock across assign-and-apply: commit order is proposal
        // order.
        let mut next_index = self.next_index.lock();
        *next_index += 1;
        let index = *next_index;
        let response = self.state.apply(index, &command);
        debug!("Committed command at index {}", index);
        Ok(Committed { index, response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_common::{Key, Value};

    #[tokio::test]
    async fn test_local_log_commits_in_proposal_order() {
        let state = Arc::new(CpMapState::new());
        let log = LocalLog::new(Arc::clone(&state));

        let first = log
            .propose(CpCommand::Set {
                key: Key::from("k"),
                value: Value::from("1"),
            })
            .await
            .unwrap();
        let second = log
            .propose(CpCommand::Get { key: Key::from("k") })
            .await
            .unwrap();

        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(second.response, CpResponse::Value(Some(Value::from("1"))));
        assert_eq!(state.last_applied(), 2);
    }
}
