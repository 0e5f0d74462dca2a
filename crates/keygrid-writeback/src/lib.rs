//! KeyGrid Writeback - write-behind persistence coordination
//!
//! Decouples foreground mutation latency from backing-store latency.
//! Mutations enqueue a pending operation and return; a background worker
//! flushes batches on an interval or when the buffer grows past a
//! threshold, retrying failed batches with exponential backoff.
//!
//! Guarantees:
//! - **Coalescing**: at most one pending operation per key; rapid
//!   mutations collapse into the latest one, so at most one net value
//!   reaches the backing store per coalescing window.
//! - **Per-key ordering**: at most one operation per key is in flight at
//!   any moment; a later delete can never be overtaken by an earlier
//!   buffered store.
//! - **At-least-once with bounded retries**: failed entries are requeued
//!   until `max_retries`, then reported as a give-up outcome — never
//!   silently dropped.

pub mod coordinator;
pub mod queue;

pub use coordinator::{FlushOutcome, WriteBehindCoordinator, WriteBehindStats};
pub use queue::{PendingOp, WriteBuffer};
