//! Core type definitions for KeyGrid
//!
//! This module defines the fundamental types used throughout the system:
//! map names, opaque key/value payloads, entry records with metadata, and
//! the stored-entry shape that round-trips through backing stores.

use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Name of a distributed map
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct MapName(String);

impl MapName {
    /// Create a new map name (validates naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, MapNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the map name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a map name: 1-255 chars, lowercase alphanumerics plus
    /// `.`, `_`, `-`, not starting with a separator.
    fn validate(name: &str) -> Result<(), MapNameError> {
        if name.is_empty() {
            return Err(MapNameError::Empty);
        }
        if name.len() > 255 {
            return Err(MapNameError::TooLong);
        }

        let first = name.chars().next().unwrap();
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return Err(MapNameError::InvalidStartChar);
        }

        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '.' && c != '_' && c != '-' {
                return Err(MapNameError::InvalidChar(c));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for MapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MapName({:?})", self.0)
    }
}

/// Errors that can occur when creating a map name
#[derive(Debug, Clone, thiserror::Error)]
pub enum MapNameError {
    #[error("map name cannot be empty")]
    Empty,
    #[error("map name must be at most 255 characters")]
    TooLong,
    #[error("map name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("map name contains invalid character: {0}")]
    InvalidChar(char),
}

/// Opaque map key
///
/// The grid never interprets key bytes; serialization of application
/// objects into keys is the caller's concern.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Get the key payload
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key payload in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the key payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(Bytes::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", String::from_utf8_lossy(&self.0))
    }
}

/// Opaque map value
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value(Bytes);

impl Value {
    /// Create a value from raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Get the value payload
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the value payload in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the value payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self(Bytes::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", String::from_utf8_lossy(&self.0))
    }
}

/// Identifier of a partition within a map
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct PartitionId(pub u16);

impl PartitionId {
    /// Get the raw partition index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionId({})", self.0)
    }
}

/// In-memory record for one entry of a map partition
///
/// `version` increases monotonically per key within a record store; the
/// write-behind acknowledgement path and the anti-entropy repair policy
/// both key off it. `dirty` is true while a mutation has not yet been
/// confirmed by the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryRecord {
    /// Current value
    pub value: Value,
    /// Per-key mutation counter
    pub version: u64,
    /// Absolute expiration time, milliseconds since the Unix epoch
    pub expires_at: Option<u64>,
    /// True until the backing store has confirmed this version
    pub dirty: bool,
}

impl EntryRecord {
    /// Create a clean record without expiration
    #[must_use]
    pub const fn new(value: Value, version: u64) -> Self {
        Self {
            value,
            version,
            expires_at: None,
            dirty: false,
        }
    }

    /// Set the absolute expiration time
    #[must_use]
    pub const fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check whether the record is expired at the given wall-clock time
    #[must_use]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }

    /// The shape of this record as persisted through a backing store
    #[must_use]
    pub fn stored(&self) -> StoredEntry {
        StoredEntry {
            value: self.value.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Value plus expiration metadata as persisted through a backing store
///
/// Expiration round-trips with the value so that entries loaded back into
/// memory keep their original lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Persisted value
    pub value: Value,
    /// Absolute expiration time, milliseconds since the Unix epoch
    pub expires_at: Option<u64>,
}

impl StoredEntry {
    /// Create a stored entry without expiration
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Set the absolute expiration time
    #[must_use]
    pub const fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check whether the entry is expired at the given wall-clock time
    #[must_use]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }
}
