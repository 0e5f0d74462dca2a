//! KeyGrid Common - shared types and utilities
//!
//! This crate defines the vocabulary used across the KeyGrid workspace:
//! keys, values, entry records, map names, flat configuration structs,
//! the shared error type, and the order-independent digest tree used by
//! the anti-entropy subsystem.

pub mod config;
pub mod digest;
pub mod error;
pub mod types;

pub use config::{DigestTreeConfig, GridMapConfig, PersistenceMode, WriteBehindConfig};
pub use digest::{DigestTree, entry_digest};
pub use error::{Error, Result};
pub use types::{EntryRecord, Key, MapName, PartitionId, StoredEntry, Value, epoch_millis};
