//! KeyGrid Backing - pluggable backing-store adapters
//!
//! A backing store is the external system of record behind a map:
//! typically a database table, here abstracted behind the
//! [`ExternalStore`] trait. The record store reads through it on miss,
//! the write-behind queue flushes to it in batches, and warm-up
//! enumerates it lazily.
//!
//! Two implementations ship with the workspace: [`MemoryStore`], a
//! concurrent in-process table used as the reference semantics and as a
//! fault-injectable test double, and [`RedbStore`], an embedded
//! single-file store with genuinely transactional batches.

pub mod memory;
pub mod redb_store;
pub mod store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use store::{BackingError, BackingResult, BatchError, ExternalStore, KeyStream};
