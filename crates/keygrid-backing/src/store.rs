//! Backing-store contract and failure types
//!
//! Every backing-resource failure collapses into [`BackingError`]: the
//! grid does not distinguish connectivity problems from constraint
//! violations beyond retryability. Batch operations report per-key
//! outcomes through [`BatchError`] so callers know exactly which keys
//! still need flushing.

use async_trait::async_trait;
use futures::stream::BoxStream;
use keygrid_common::{Key, StoredEntry};
use thiserror::Error;

/// Result type for backing-store operations
pub type BackingResult<T> = Result<T, BackingError>;

/// Lazy stream of keys, produced once at warm-up
pub type KeyStream = BoxStream<'static, BackingResult<Key>>;

/// Single adapter-level failure kind for any backing-resource problem
#[derive(Debug, Clone, Error)]
#[error("backing store failure: {message}")]
pub struct BackingError {
    message: String,
    retryable: bool,
}

impl BackingError {
    /// Create a non-retryable failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a retryable failure (resource temporarily unavailable)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check whether retrying the operation may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Partial batch failure: per-key outcomes for `store_all`/`delete_all`
///
/// Keys absent from `failed` succeeded.
#[derive(Debug, Error)]
#[error("batch failed for {} of {attempted} keys", failed.len())]
pub struct BatchError {
    /// Number of keys in the attempted batch
    pub attempted: usize,
    /// Keys that failed, with the failure for each
    pub failed: Vec<(Key, BackingError)>,
}

impl BatchError {
    /// Create a batch error
    #[must_use]
    pub const fn new(attempted: usize, failed: Vec<(Key, BackingError)>) -> Self {
        Self { attempted, failed }
    }

    /// Check whether any key in the batch failed
    #[must_use]
    pub fn is_total(&self) -> bool {
        self.failed.len() == self.attempted
    }
}

/// Contract for a pluggable backing store
///
/// Implementations must be safe for concurrent invocation from multiple
/// partition workers; an adapter over a resource that is not inherently
/// thread-safe serializes access itself rather than pushing that burden
/// onto callers.
///
/// The `*_all` batch operations default to per-key iteration.
/// Implementations over resources with genuine batch primitives are
/// expected to override them for throughput.
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &str;

    /// Load one entry; absent keys yield `Ok(None)`, never an error
    async fn load(&self, key: &Key) -> BackingResult<Option<StoredEntry>>;

    /// Load a set of entries; missing keys are simply absent from the result
    async fn load_all(&self, keys: &[Key]) -> BackingResult<Vec<(Key, StoredEntry)>> {
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.load(key).await? {
                loaded.push((key.clone(), entry));
            }
        }
        Ok(loaded)
    }

    /// Enumerate every key in the backing store as a lazy stream
    ///
    /// Used once, at warm-up, to populate the map without materializing
    /// the full key space in memory.
    async fn load_all_keys(&self) -> BackingResult<KeyStream>;

    /// Persist one entry
    async fn store(&self, key: &Key, entry: &StoredEntry) -> BackingResult<()>;

    /// Persist a batch of entries, reporting per-key failures
    async fn store_all(&self, entries: &[(Key, StoredEntry)]) -> Result<(), BatchError> {
        let mut failed = Vec::new();
        for (key, entry) in entries {
            if let Err(err) = self.store(key, entry).await {
                failed.push((key.clone(), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(BatchError::new(entries.len(), failed))
        }
    }

    /// Remove one entry; removing an absent key succeeds
    async fn delete(&self, key: &Key) -> BackingResult<()>;

    /// Remove a batch of entries, reporting per-key failures
    async fn delete_all(&self, keys: &[Key]) -> Result<(), BatchError> {
        let mut failed = Vec::new();
        for key in keys {
            if let Err(err) = self.delete(key).await {
                failed.push((key.clone(), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(BatchError::new(keys.len(), failed))
        }
    }
}
