//! KeyGrid CP - strongly consistent key-value map
//!
//! Every operation, reads included, is a single command proposed through
//! a consensus log and applied to a deterministic state machine in
//! commit order. Once an operation is acknowledged, every subsequent
//! read through the group observes it.
//!
//! The consensus protocol itself is a collaborator behind the
//! [`ConsensusLog`] trait; transport and leader election live outside
//! this crate. [`LocalLog`] drives a single in-process group, enough
//! for single-node deployments and tests.

pub mod log;
pub mod map;
pub mod state;

pub use log::{Committed, ConsensusLog, CpError, LocalLog};
pub use map::CpMap;
pub use state::{ConsensusEntry, CpCommand, CpMapState, CpResponse};
