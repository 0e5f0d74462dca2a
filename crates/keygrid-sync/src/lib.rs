//! KeyGrid Sync - anti-entropy between partition replicas
//!
//! Two replicas of a partition detect divergence in logarithmic round
//! trips by walking their digest trees top-down in lock-step: matching
//! digests prune a whole subtree, differing ones recurse, and at leaf
//! level the actual entries are exchanged and repaired according to a
//! configured policy.

pub mod peer;
pub mod synchronizer;

pub use peer::{LocalPeer, SyncPeer};
pub use synchronizer::{RepairPolicy, SyncError, SyncReport, Synchronizer};
