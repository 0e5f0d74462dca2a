//! Entry event types and the listener contract

use keygrid_common::{Key, MapName, Value};
use std::fmt;
use thiserror::Error;

/// Kind of an entry event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A key was inserted for the first time
    Added,
    /// An existing key received a new value
    Updated,
    /// A key was removed by a caller
    Removed,
    /// A key was dropped from memory without touching the backing store
    Evicted,
    /// A key reached its expiration time
    Expired,
    /// The whole map was cleared
    Cleared,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Removed => write!(f, "removed"),
            Self::Evicted => write!(f, "evicted"),
            Self::Expired => write!(f, "expired"),
            Self::Cleared => write!(f, "cleared"),
        }
    }
}

/// One entry-level change notification
///
/// `Updated` events carry both the old and the new value; `Cleared`
/// carries no per-key payload at all.
#[derive(Clone, Debug)]
pub struct EntryEvent {
    /// Map the event originated from
    pub map: MapName,
    /// Kind of change
    pub kind: EventKind,
    /// Affected key; `None` for `Cleared`
    pub key: Option<Key>,
    /// Value before the change, where one existed
    pub old_value: Option<Value>,
    /// Value after the change, where one exists
    pub new_value: Option<Value>,
}

impl EntryEvent {
    /// A key was inserted for the first time
    #[must_use]
    pub const fn added(map: MapName, key: Key, value: Value) -> Self {
        Self {
            map,
            kind: EventKind::Added,
            key: Some(key),
            old_value: None,
            new_value: Some(value),
        }
    }

    /// An existing key received a new value
    #[must_use]
    pub const fn updated(map: MapName, key: Key, old: Value, new: Value) -> Self {
        Self {
            map,
            kind: EventKind::Updated,
            key: Some(key),
            old_value: Some(old),
            new_value: Some(new),
        }
    }

    /// A key was removed by a caller
    #[must_use]
    pub const fn removed(map: MapName, key: Key, old: Option<Value>) -> Self {
        Self {
            map,
            kind: EventKind::Removed,
            key: Some(key),
            old_value: old,
            new_value: None,
        }
    }

    /// A key was dropped from memory only
    #[must_use]
    pub const fn evicted(map: MapName, key: Key, old: Value) -> Self {
        Self {
            map,
            kind: EventKind::Evicted,
            key: Some(key),
            old_value: Some(old),
            new_value: None,
        }
    }

    /// A key reached its expiration time
    #[must_use]
    pub const fn expired(map: MapName, key: Key, old: Value) -> Self {
        Self {
            map,
            kind: EventKind::Expired,
            key: Some(key),
            old_value: Some(old),
            new_value: None,
        }
    }

    /// The whole map was cleared
    #[must_use]
    pub const fn cleared(map: MapName) -> Self {
        Self {
            map,
            kind: EventKind::Cleared,
            key: None,
            old_value: None,
            new_value: None,
        }
    }
}

/// Failure reported by a listener invocation
///
/// Listener failures are logged and isolated; they never reach the
/// mutating caller or other listeners.
#[derive(Debug, Error)]
#[error("listener failure: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    /// Create a listener error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Callback contract for entry events
///
/// Invoked on the bus dispatcher worker, one event at a time per bus.
/// Events for the same key arrive in mutation order; there is no
/// cross-key ordering guarantee.
pub trait EntryListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &EntryEvent) -> Result<(), ListenerError>;
}
