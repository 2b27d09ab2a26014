//! In-memory [`WorkQueue`] for tests and single-process deployments.
//!
//! Same retry and dead-letter semantics as the SQLite backend, minus
//! durability and lease expiry: an entry leased by a consumer that never
//! acks stays leased for the life of the process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, Disposition, QueueStats, RetryPolicy, WorkQueue};
use crate::error::{SyncError, SyncResult};
use crate::models::{EntryStatus, QueueEntry};

/// Upper bound on a single wait, so delayed retries become visible.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

struct Slot {
    entry: QueueEntry,
    available_at: Instant,
}

#[derive(Default)]
struct Lanes {
    /// Per queue, in push order.
    ready: HashMap<String, Vec<Slot>>,
    leased: HashMap<String, (String, QueueEntry)>,
    dead: HashMap<String, Vec<QueueEntry>>,
}

pub struct InMemoryQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    policy: RetryPolicy,
    available: bool,
}

impl InMemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            policy,
            available: true,
        }
    }

    /// A queue whose every operation fails, for exercising outage paths.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(RetryPolicy::default())
        }
    }

    /// Entries waiting in `queue`, in delivery order.
    pub fn pending(&self, queue: &str) -> Vec<QueueEntry> {
        let lanes = self.lock();
        lanes
            .ready
            .get(queue)
            .map(|slots| slots.iter().map(|s| s.entry.clone()).collect())
            .unwrap_or_default()
    }

    pub fn dead(&self, queue: &str) -> Vec<QueueEntry> {
        self.lock().dead.get(queue).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lanes> {
        // A poisoned lock only means a test panicked mid-operation.
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> SyncResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(SyncError::queue("in-memory queue marked unavailable"))
        }
    }

    fn try_lease(&self, queue: &str) -> Option<Delivery> {
        let mut lanes = self.lock();
        let now = Instant::now();
        let slots = lanes.ready.get_mut(queue)?;
        let pos = slots.iter().position(|s| s.available_at <= now)?;
        let mut entry = slots.remove(pos).entry;
        entry.attempts += 1;
        entry.status = EntryStatus::Leased;
        lanes
            .leased
            .insert(entry.id.clone(), (queue.to_string(), entry.clone()));
        Some(Delivery {
            queue: queue.to_string(),
            entry,
        })
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn push(&self, queue: &str, entry: &QueueEntry) -> SyncResult<()> {
        self.check()?;
        let mut entry = entry.clone();
        entry.status = EntryStatus::Pending;
        self.lock().ready.entry(queue.to_string()).or_default().push(Slot {
            entry,
            available_at: Instant::now(),
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> SyncResult<Option<Delivery>> {
        self.check()?;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_lease(queue) {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(MAX_WAIT_SLICE.min(deadline - now), notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SyncResult<()> {
        self.check()?;
        self.lock().leased.remove(&delivery.entry.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &SyncError) -> SyncResult<Disposition> {
        self.check()?;
        let disposition = self.policy.disposition(delivery.entry.attempts, error);
        let mut lanes = self.lock();
        let Some((queue, mut entry)) = lanes.leased.remove(&delivery.entry.id) else {
            return Ok(disposition);
        };

        match disposition {
            Disposition::Retry { delay } => {
                entry.status = EntryStatus::Pending;
                lanes.ready.entry(queue).or_default().push(Slot {
                    entry,
                    available_at: Instant::now() + delay,
                });
            }
            Disposition::DeadLettered => {
                entry.status = EntryStatus::Dead;
                lanes.dead.entry(queue).or_default().push(entry);
            }
        }
        drop(lanes);
        self.notify.notify_waiters();
        Ok(disposition)
    }

    async fn stats(&self, queue: &str) -> SyncResult<QueueStats> {
        self.check()?;
        let lanes = self.lock();
        Ok(QueueStats {
            pending: lanes.ready.get(queue).map_or(0, |v| v.len() as u64),
            leased: lanes.leased.values().filter(|(q, _)| q == queue).count() as u64,
            dead: lanes.dead.get(queue).map_or(0, |v| v.len() as u64),
        })
    }

    async fn requeue_dead(&self, queue: &str) -> SyncResult<u64> {
        self.check()?;
        let mut lanes = self.lock();
        let dead = lanes.dead.remove(queue).unwrap_or_default();
        let moved = dead.len() as u64;
        let ready = lanes.ready.entry(queue.to_string()).or_default();
        for mut entry in dead {
            entry.attempts = 0;
            entry.status = EntryStatus::Pending;
            ready.push(Slot {
                entry,
                available_at: Instant::now(),
            });
        }
        drop(lanes);
        self.notify.notify_waiters();
        Ok(moved)
    }

    async fn ping(&self) -> bool {
        self.available
    }
}
