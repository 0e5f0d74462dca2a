//! KeyGrid Store - partitioned in-memory record store and map facade
//!
//! The record store owns the authoritative mapping for one partition of
//! one map. [`GridMap`] routes keys to partitions, wires mutations into
//! the event bus and the persistence layer (read-through, write-through
//! or write-behind), sweeps expired entries, and exposes the digest tree
//! per partition for anti-entropy comparison.
//!
//! Concurrency model: mutations for one partition are serialized behind
//! that partition's lock while different partitions proceed in parallel.
//! Backing-store I/O happens on the write-behind worker, never under a
//! partition lock, unless write-through is configured - in which case the
//! mutating call awaits the store confirmation.

pub mod map;
pub mod record;

pub use map::{GridMap, GridMapStats};
pub use record::{CasOutcome, LeafEntry, RecordStore, RemoveOutcome, UpsertOutcome};
