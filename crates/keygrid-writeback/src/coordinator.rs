//! Background flush worker over the write buffer
//!
//! One worker per coordinator drains the buffer whenever the flush
//! interval elapses or the dirty count crosses the threshold. Failed
//! batches are retried with exponential backoff; entries that exhaust
//! their retries surface as [`FlushOutcome::GaveUp`].

use crate::queue::{BatchItem, PendingOp, Requeue, WriteBuffer};
use keygrid_backing::{BackingError, ExternalStore};
use keygrid_common::{Key, StoredEntry, WriteBehindConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Terminal outcome of one buffered operation
#[derive(Debug)]
pub enum FlushOutcome {
    /// The operation reached the backing store
    Flushed {
        /// Flushed key
        key: Key,
        /// Record version the flush confirmed
        version: u64,
    },
    /// The retry limit was exhausted; the operation was dropped
    GaveUp {
        /// Affected key
        key: Key,
        /// Record version that could not be persisted
        version: u64,
        /// Last failure observed
        error: BackingError,
    },
}

/// Counters snapshot for the coordinator
#[derive(Debug, Clone, Default)]
pub struct WriteBehindStats {
    /// Entries currently buffered (dirty and in flight)
    pub pending: usize,
    /// Entries eligible for the next batch
    pub dirty: usize,
    /// Operations confirmed by the backing store
    pub flushed_total: u64,
    /// Flush attempts that were requeued
    pub retried_total: u64,
    /// Operations dropped after exhausting retries
    pub gave_up_total: u64,
    /// Batches handed to the backing store
    pub batches_total: u64,
}

struct Core {
    buffer: WriteBuffer,
    store: Arc<dyn ExternalStore>,
    config: WriteBehindConfig,
    outcomes: mpsc::UnboundedSender<FlushOutcome>,
    wake: Notify,
    shutdown: AtomicBool,
    consecutive_failures: AtomicU32,
    flushed: AtomicU64,
    retried: AtomicU64,
    gave_up: AtomicU64,
    batches: AtomicU64,
}

impl Core {
    /// Drain the buffer until it is empty or a batch fails
    async fn drain(&self) {
        loop {
            let batch = self.buffer.take_batch(self.config.max_batch);
            if batch.is_empty() {
                return;
            }
            let _ = self.batches.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Flushing {} operations to backing store '{}'",
                batch.len(),
                self.store.name()
            );
            if self.flush_batch(batch).await {
                let _ = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    /// Flush one batch; returns true if any key failed
    async fn flush_batch(&self, batch: Vec<BatchItem>) -> bool {
        let mut stores: Vec<(Key, StoredEntry)> = Vec::new();
        let mut deletes: Vec<Key> = Vec::new();
        for item in &batch {
            match &item.op {
                PendingOp::Store(entry) => stores.push((item.key.clone(), entry.clone())),
                PendingOp::Delete => deletes.push(item.key.clone()),
            }
        }

        let mut failures: HashMap<Key, BackingError> = HashMap::new();
        if !stores.is_empty()
            && let Err(err) = self.store.store_all(&stores).await
        {
            failures.extend(err.failed);
        }
        if !deletes.is_empty()
            && let Err(err) = self.store.delete_all(&deletes).await
        {
            failures.extend(err.failed);
        }

        let failed_any = !failures.is_empty();
        for item in batch {
            match failures.remove(&item.key) {
                None => {
                    if self.buffer.settle_success(&item.key, item.version) {
                        let _ = self.flushed.fetch_add(1, Ordering::Relaxed);
                        let _ = self.outcomes.send(FlushOutcome::Flushed {
                            key: item.key,
                            version: item.version,
                        });
                    }
                }
                Some(error) => {
                    match self
                        .buffer
                        .settle_failure(&item.key, item.version, self.config.max_retries)
                    {
                        Requeue::Retry => {
                            let _ = self.retried.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "Flush of {:?} (version {}) failed, will retry: {}",
                                item.key, item.version, error
                            );
                        }
                        Requeue::GaveUp => {
                            let _ = self.gave_up.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "Giving up on {:?} (version {}) after {} attempts: {}",
                                item.key,
                                item.version,
                                item.attempts + 1,
                                error
                            );
                            let _ = self.outcomes.send(FlushOutcome::GaveUp {
                                key: item.key,
                                version: item.version,
                                error,
                            });
                        }
                        Requeue::Superseded => {}
                    }
                }
            }
        }
        failed_any
    }

    fn backoff(&self) -> Option<Duration> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures == 0 {
            return None;
        }
        let exp = failures.saturating_sub(1).min(16);
        let millis = self
            .config
            .retry_backoff_ms
            .saturating_mul(1 << exp)
            .min(self.config.max_backoff_ms);
        Some(Duration::from_millis(millis))
    }
}

/// Write-behind coordinator: the buffer plus its flush worker
pub struct WriteBehindCoordinator {
    core: Arc<Core>,
    outcomes_rx: Mutex<Option<mpsc::UnboundedReceiver<FlushOutcome>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehindCoordinator {
    /// Create a coordinator and spawn its flush worker
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(store: Arc<dyn ExternalStore>, config: WriteBehindConfig) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Core {
            buffer: WriteBuffer::new(),
            store,
            config: config.clone(),
            outcomes: outcomes_tx,
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            flushed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            gave_up: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        });

        let worker_core = Arc::clone(&core);
        let worker = tokio::spawn(async move {
            let period = Duration::from_millis(config.flush_interval_ms.max(1));
            // First tick one full period out; interval() ticks immediately.
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = worker_core.wake.notified() => {}
                }
                if worker_core.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(backoff) = worker_core.backoff() {
                    tokio::time::sleep(backoff).await;
                }
                worker_core.drain().await;
            }
            // Final drain so a clean shutdown leaves nothing behind.
            worker_core.drain().await;
            if !worker_core.buffer.is_empty() {
                warn!(
                    "Write-behind worker stopping with {} entries still pending",
                    worker_core.buffer.len()
                );
            }
            debug!("Write-behind worker stopped");
        });

        Self {
            core,
            outcomes_rx: Mutex::new(Some(outcomes_rx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Buffer a store operation
    pub fn enqueue_store(&self, key: Key, entry: StoredEntry, version: u64) {
        self.core.buffer.enqueue_store(key, entry, version);
        self.maybe_wake();
    }

    /// Buffer a delete operation
    pub fn enqueue_delete(&self, key: Key, version: u64) {
        self.core.buffer.enqueue_delete(key, version);
        self.maybe_wake();
    }

    fn maybe_wake(&self) {
        if self.core.buffer.dirty_len() >= self.core.config.flush_threshold {
            self.core.wake.notify_one();
        }
    }

    /// Operation currently buffered for a key, if any
    #[must_use]
    pub fn pending(&self, key: &Key) -> Option<PendingOp> {
        self.core.buffer.pending_op(key)
    }

    /// Drain the buffer now, inline with the caller
    pub async fn flush_now(&self) {
        self.core.drain().await;
    }

    /// Take the outcome receiver; yields `None` after the first call
    pub fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<FlushOutcome>> {
        self.outcomes_rx.lock().take()
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> WriteBehindStats {
        WriteBehindStats {
            pending: self.core.buffer.len(),
            dirty: self.core.buffer.dirty_len(),
            flushed_total: self.core.flushed.load(Ordering::Relaxed),
            retried_total: self.core.retried.load(Ordering::Relaxed),
            gave_up_total: self.core.gave_up.load(Ordering::Relaxed),
            batches_total: self.core.batches.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker after a final drain
    pub async fn close(&self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.wake.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Drop all pending operations and stop the worker (map destroyed)
    pub async fn abort(&self) {
        self.core.buffer.clear();
        self.close().await;
    }
}
