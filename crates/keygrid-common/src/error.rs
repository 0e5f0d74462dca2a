//! Error types for KeyGrid
//!
//! This module defines the common error type used by the map facade and
//! record store. Subsystems with richer failure vocabularies (backing
//! stores, anti-entropy, the CP map) define their own error types and
//! convert at the boundary.

use crate::types::MapNameError;
use thiserror::Error;

/// Common result type for KeyGrid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for KeyGrid
#[derive(Debug, Error)]
pub enum Error {
    #[error("map destroyed: {0}")]
    MapDestroyed(String),

    #[error("backing store failure: {0}")]
    Backing(String),

    #[error("invalid map name: {0}")]
    InvalidMapName(#[from] MapNameError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a backing store error
    pub fn backing(msg: impl Into<String>) -> Self {
        Self::Backing(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MapName;

    #[test]
    fn test_error_display() {
        let err = Error::backing("connection refused");
        assert_eq!(err.to_string(), "backing store failure: connection refused");
    }

    #[test]
    fn test_map_name_error_converts() {
        let err: Error = MapName::new("").unwrap_err().into();
        assert!(matches!(err, Error::InvalidMapName(_)));
    }
}
