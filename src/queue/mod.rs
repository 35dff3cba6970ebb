//! Bounded, concurrency-limited ingestion queue.
//!
//! Connection tasks enqueue decoded records; a single dispatch loop starts one
//! task per item while fewer than `max_concurrency` are in flight. Each task
//! stores its record and publishes a "record stored" event. Transient failures
//! are retried with linear backoff and reinserted at the front of the pending
//! list; everything else, and anything past `max_retries`, is dropped with an
//! "item failed" event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, QueueError, Result};
use crate::events::{Event, EventSink};
use crate::metrics::{IngestStats, QueueStatus};
use crate::protocol::TelemetryRecord;
use crate::storage::Storage;

/// Ingestion queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum items being stored at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Pending list length at which the oldest item is evicted.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Retries allowed after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff unit; the n-th retry waits `n * retry_backoff`.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Dispatch loop recheck interval when saturated or idle.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on one storage call.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,
}

fn default_max_concurrency() -> usize {
    16
}
fn default_max_pending() -> usize {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}
fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_pending: default_max_pending(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            poll_interval: default_poll_interval(),
            store_timeout: default_store_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "queue.max_concurrency must be at least 1".into(),
            ));
        }
        if self.max_pending == 0 {
            return Err(Error::InvalidConfig(
                "queue.max_pending must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "queue.poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Processing,
    Retry,
    Processed,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Processed | ItemState::Failed)
    }
}

/// Where an item sits in the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    /// Reinserted at the front after a transient failure.
    Retry,
}

/// One record awaiting storage.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: u64,
    pub record: TelemetryRecord,
    pub retries: u32,
    pub priority: Priority,
    pub state: ItemState,
    pub enqueued_at: Instant,
}

impl QueueItem {
    pub fn new(id: u64, record: TelemetryRecord) -> Self {
        Self {
            id,
            record,
            retries: 0,
            priority: Priority::Normal,
            state: ItemState::Queued,
            enqueued_at: Instant::now(),
        }
    }
}

/// Queue counters and occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// The ingestion queue.
pub struct IngestQueue {
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    events: Arc<dyn EventSink>,
    stats: Arc<IngestStats>,

    pending: Mutex<VecDeque<QueueItem>>,
    in_flight: AtomicUsize,
    next_id: AtomicU64,

    accepting: AtomicBool,
    closed: AtomicBool,
    /// Wakes the dispatch loop.
    wake: Notify,
    /// Wakes drain waiters when the queue may have become idle.
    idle: Notify,
}

impl IngestQueue {
    pub fn new(
        config: QueueConfig,
        storage: Arc<dyn Storage>,
        events: Arc<dyn EventSink>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            config,
            storage,
            events,
            stats,
            pending: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a record to the tail of the pending list.
    ///
    /// When the list is full the oldest pending item is evicted and counted
    /// as dropped.
    pub fn enqueue(&self, record: TelemetryRecord) -> Result<u64> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(QueueError::Closed.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let evicted = {
            let mut pending = self.pending.lock();
            let evicted = if pending.len() >= self.config.max_pending {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back(QueueItem::new(id, record));
            evicted
        };

        IngestStats::incr(&self.stats.queue_enqueued);
        if let Some(old) = evicted {
            IngestStats::incr(&self.stats.queue_dropped);
            warn!(
                item = old.id,
                identity = ?old.record.identity,
                max_pending = self.config.max_pending,
                "Pending list full, evicted oldest item"
            );
        }

        trace!(item = id, "Enqueued");
        self.wake.notify_one();
        Ok(id)
    }

    /// Dispatch loop. Returns once [`close`](Self::close) has been called.
    pub async fn run(self: Arc<Self>) {
        debug!(
            max_concurrency = self.config.max_concurrency,
            "Ingestion queue dispatcher started"
        );

        while !self.closed.load(Ordering::Acquire) {
            if self.in_flight.load(Ordering::Acquire) >= self.config.max_concurrency {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let next = {
                let mut pending = self.pending.lock();
                let item = pending.pop_front();
                if item.is_some() {
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                }
                item
            };
            match next {
                Some(mut item) => {
                    item.state = ItemState::Processing;
                    let queue = Arc::clone(&self);
                    tokio::spawn(async move {
                        queue.process(item).await;
                    });
                }
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        debug!("Ingestion queue dispatcher stopped");
    }

    /// Run one item to completion or to its next reinsertion.
    async fn process(&self, mut item: QueueItem) {
        let state = self.attempt(&mut item).await;

        if state == ItemState::Retry {
            // Slot stays held while the item backs off
            let delay = self.config.retry_backoff * item.retries;
            tokio::time::sleep(delay).await;
            item.state = ItemState::Queued;
            item.priority = Priority::Retry;
            self.pending.lock().push_front(item);
            self.wake.notify_one();
        }

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.wake.notify_one();
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// One storage attempt. Updates the item and returns its new state.
    pub async fn attempt(&self, item: &mut QueueItem) -> ItemState {
        item.state = ItemState::Processing;

        let result = match tokio::time::timeout(
            self.config.store_timeout,
            self.storage.create_record(&item.record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::StoreTimeout(self.config.store_timeout).into()),
        };

        item.state = match result {
            Ok(record_id) => {
                IngestStats::incr(&self.stats.queue_processed);
                trace!(item = item.id, record = %record_id, "Stored");
                self.events.publish(Event::RecordStored {
                    id: record_id,
                    record: Arc::new(item.record.clone()),
                });
                ItemState::Processed
            }
            Err(e) if e.is_transient() => {
                item.retries += 1;
                if item.retries <= self.config.max_retries {
                    IngestStats::incr(&self.stats.queue_retried);
                    debug!(
                        item = item.id,
                        retries = item.retries,
                        error = %e,
                        "Transient storage failure, retrying"
                    );
                    ItemState::Retry
                } else {
                    self.fail(item, &e);
                    ItemState::Failed
                }
            }
            Err(e) => {
                self.fail(item, &e);
                ItemState::Failed
            }
        };

        item.state
    }

    fn fail(&self, item: &QueueItem, error: &Error) {
        IngestStats::incr(&self.stats.queue_failed);
        let failure = QueueError::PermanentFailure {
            id: item.id,
            retries: item.retries,
            reason: error.to_string(),
        };
        warn!(identity = ?item.record.identity, "{failure}");
        self.events.publish(Event::ItemFailed {
            item: item.id,
            identity: item.record.identity.clone(),
            retries: item.retries,
            reason: error.to_string(),
        });
    }

    fn is_idle(&self) -> bool {
        // In-flight is only raised while the pending lock is held
        let pending = self.pending.lock();
        pending.is_empty() && self.in_flight.load(Ordering::Acquire) == 0
    }

    /// Stop intake and wait for pending and in-flight work to finish.
    ///
    /// Returns `true` if the queue emptied within `grace`. The dispatch loop
    /// is closed either way.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.accepting.store(false, Ordering::Release);
        info!(
            pending = self.pending_len(),
            in_flight = self.in_flight(),
            "Draining ingestion queue"
        );

        let finished = tokio::time::timeout(grace, async {
            while !self.is_idle() {
                tokio::select! {
                    _ = self.idle.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        })
        .await
        .is_ok();

        if finished {
            info!("Ingestion queue drained");
        } else {
            warn!(
                pending = self.pending_len(),
                in_flight = self.in_flight(),
                "Grace period elapsed before queue drained"
            );
        }

        self.close();
        finished
    }

    /// Stop the dispatch loop without waiting.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        let snap = self.stats.snapshot();
        QueueStats {
            pending: self.pending_len(),
            in_flight: self.in_flight(),
            enqueued: snap.queue_enqueued,
            processed: snap.queue_processed,
            retried: snap.queue_retried,
            failed: snap.queue_failed,
            dropped: snap.queue_dropped,
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.pending_len(),
            in_flight: self.in_flight(),
            max_concurrency: self.config.max_concurrency,
            accepting: self.is_accepting(),
        }
    }
}
