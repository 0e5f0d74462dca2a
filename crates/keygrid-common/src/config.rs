//! Configuration types for KeyGrid
//!
//! This module defines the flat, construction-time options accepted by the
//! map facade and its subsystems. The core defines no file or network
//! format for configuration; embedding applications decide how to produce
//! these structs.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Minimum supported digest tree depth
pub const MIN_TREE_DEPTH: u32 = 2;

/// Maximum supported digest tree depth
pub const MAX_TREE_DEPTH: u32 = 27;

/// Configuration for one distributed map
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridMapConfig {
    /// Number of partitions the key space is split into
    pub partition_count: u16,
    /// Persistence mode for the backing store, if one is attached
    pub persistence: PersistenceMode,
    /// Digest tree parameters for anti-entropy comparison
    pub digest_tree: DigestTreeConfig,
    /// Interval between expiration sweeps (milliseconds)
    pub expiry_sweep_interval_ms: u64,
    /// Capacity of the entry event queue; publishes beyond it are dropped
    pub event_queue_capacity: usize,
    /// Number of keys loaded per batch during warm-up
    pub warmup_batch: usize,
}

impl Default for GridMapConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            persistence: PersistenceMode::Disabled,
            digest_tree: DigestTreeConfig::default(),
            expiry_sweep_interval_ms: 1_000,
            event_queue_capacity: 1_024,
            warmup_batch: 256,
        }
    }
}

impl GridMapConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::configuration("partition_count must be at least 1"));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::configuration(
                "event_queue_capacity must be at least 1",
            ));
        }
        if self.warmup_batch == 0 {
            return Err(Error::configuration("warmup_batch must be at least 1"));
        }
        self.digest_tree.validate()?;
        if let PersistenceMode::WriteBehind(wb) = &self.persistence {
            wb.validate()?;
        }
        Ok(())
    }
}

/// How mutations reach the backing store
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum PersistenceMode {
    /// No backing store interaction
    #[default]
    Disabled,
    /// Synchronous: the mutating call blocks until the store confirms
    WriteThrough,
    /// Asynchronous: mutations return immediately and are flushed in
    /// batches by a background worker
    WriteBehind(WriteBehindConfig),
}

impl PersistenceMode {
    /// Check whether any persistence is configured
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Write-behind flushing parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    /// Interval between background flushes (milliseconds)
    pub flush_interval_ms: u64,
    /// Pending-entry count that triggers an early flush
    pub flush_threshold: usize,
    /// Maximum entries flushed in one batch
    pub max_batch: usize,
    /// Flush attempts per entry before giving up
    pub max_retries: u32,
    /// Base retry backoff (milliseconds), doubled per consecutive failure
    pub retry_backoff_ms: u64,
    /// Upper bound on the retry backoff (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            flush_threshold: 512,
            max_batch: 128,
            max_retries: 5,
            retry_backoff_ms: 100,
            max_backoff_ms: 30_000,
        }
    }
}

impl WriteBehindConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(Error::configuration("max_batch must be at least 1"));
        }
        if self.flush_threshold == 0 {
            return Err(Error::configuration("flush_threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Digest tree parameters
///
/// The tree has fanout 2 and `2^(depth-1)` leaf buckets. Greater depth
/// narrows the key range re-transferred per divergence at the cost of
/// more tree memory and more comparison round trips for small
/// mismatches.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DigestTreeConfig {
    /// Total tree depth, root included (2..=27)
    pub depth: u32,
}

impl Default for DigestTreeConfig {
    fn default() -> Self {
        Self { depth: 12 }
    }
}

impl DigestTreeConfig {
    /// Number of leaf buckets for this depth
    #[must_use]
    pub const fn leaf_count(&self) -> usize {
        1 << (self.depth - 1)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.depth < MIN_TREE_DEPTH || self.depth > MAX_TREE_DEPTH {
            return Err(Error::configuration(format!(
                "digest tree depth must be within {MIN_TREE_DEPTH}..={MAX_TREE_DEPTH}, got {}",
                self.depth
            )));
        }
        Ok(())
    }
}
