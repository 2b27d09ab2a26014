//! Durable work queue between the gateway and the consumers.
//!
//! Each consumer role reads its own named queue; the gateway fans a
//! notification out to every role that has an interest in its
//! [`EventKind`] (see [`Routes`]). Delivery is at-least-once: a popped entry
//! is leased, and it only leaves the queue on [`WorkQueue::ack`]. A
//! [`WorkQueue::nack`] either reschedules it with exponential backoff or
//! moves it to the dead-letter state, according to [`RetryPolicy`].
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`sqlite::SqliteQueue`] | production; leases survive restarts |
//! | [`memory::InMemoryQueue`] | tests and single-process setups |

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{Config, QueueConfig};
use crate::db;
use crate::error::{SyncError, SyncResult};
use crate::models::{EventKind, QueueEntry};

/// A leased entry handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// `attempts` counts this delivery.
    pub entry: QueueEntry,
}

/// What happened to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { delay: Duration },
    DeadLettered,
}

/// Entry counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub dead: u64,
}

/// Redelivery rules shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// Decides the fate of an entry that failed on delivery number `attempts`.
    pub fn disposition(&self, attempts: u32, error: &SyncError) -> Disposition {
        if !error.is_retryable() || attempts >= self.max_attempts {
            return Disposition::DeadLettered;
        }
        let exp = attempts.saturating_sub(1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        Disposition::Retry { delay }
    }
}

/// Queue names per consumer role.
#[derive(Debug, Clone)]
pub struct Routes {
    pub content: String,
    pub access: String,
}

impl Routes {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            content: config.content_queue.clone(),
            access: config.access_queue.clone(),
        }
    }

    /// Queues that must receive an event of this kind.
    ///
    /// Unknown events go nowhere. Access for newly written files is handled
    /// by the content consumer's follow-up entry, not by fan-out here.
    pub fn targets(&self, kind: EventKind) -> Vec<&str> {
        match kind {
            EventKind::FileCreated | EventKind::FileUpdated | EventKind::FileDeleted => {
                vec![self.content.as_str()]
            }
            EventKind::AccessChanged => vec![self.access.as_str()],
            EventKind::Unknown => Vec::new(),
        }
    }
}

/// At-least-once queue with per-role named lists.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, queue: &str, entry: &QueueEntry) -> SyncResult<()>;

    /// Leases the next ready entry, waiting at most `timeout`.
    async fn pop(&self, queue: &str, timeout: Duration) -> SyncResult<Option<Delivery>>;

    /// Removes a successfully processed entry.
    async fn ack(&self, delivery: &Delivery) -> SyncResult<()>;

    /// Records a failure and reschedules or dead-letters the entry.
    async fn nack(&self, delivery: &Delivery, error: &SyncError) -> SyncResult<Disposition>;

    async fn stats(&self, queue: &str) -> SyncResult<QueueStats>;

    /// Moves dead-lettered entries back to pending with a fresh attempt count.
    async fn requeue_dead(&self, queue: &str) -> SyncResult<u64>;

    /// Whether the backend is reachable.
    async fn ping(&self) -> bool;
}

/// Opens the configured SQLite queue and ensures its schema.
pub async fn open(config: &Config) -> Result<sqlite::SqliteQueue> {
    let pool = db::connect(&config.queue.url).await?;
    crate::migrate::migrate_queue(&pool).await?;
    Ok(sqlite::SqliteQueue::new(
        pool,
        RetryPolicy::from_config(&config.queue),
        Duration::from_secs(config.queue.visibility_timeout_secs),
    ))
}

/// `rag-sync queue stats`
pub async fn run_stats(config: &Config) -> Result<()> {
    let queue = open(config).await?;
    let routes = Routes::from_config(&config.queue);
    for name in [&routes.content, &routes.access] {
        let s = queue.stats(name).await?;
        println!(
            "{:<24} pending: {:>6}  leased: {:>6}  dead: {:>6}",
            name, s.pending, s.leased, s.dead
        );
    }
    Ok(())
}

/// `rag-sync queue retry-dead`
pub async fn run_retry_dead(config: &Config) -> Result<()> {
    let queue = open(config).await?;
    let routes = Routes::from_config(&config.queue);
    for name in [&routes.content, &routes.access] {
        let moved = queue.requeue_dead(name).await?;
        println!("{}: requeued {} dead entries", name, moved);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(30),
        };
        let err = SyncError::store("locked");
        assert_eq!(
            policy.disposition(1, &err),
            Disposition::Retry { delay: Duration::from_secs(5) }
        );
        assert_eq!(
            policy.disposition(2, &err),
            Disposition::Retry { delay: Duration::from_secs(10) }
        );
        assert_eq!(
            policy.disposition(4, &err),
            Disposition::Retry { delay: Duration::from_secs(30) }
        );
    }

    #[test]
    fn dead_letters_after_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        let err = SyncError::pipeline("1", "bad pdf");
        assert!(matches!(policy.disposition(2, &err), Disposition::Retry { .. }));
        assert_eq!(policy.disposition(3, &err), Disposition::DeadLettered);
    }

    #[test]
    fn non_retryable_errors_dead_letter_immediately() {
        let policy = RetryPolicy::default();
        let err = SyncError::MalformedEvent("no id".into());
        assert_eq!(policy.disposition(1, &err), Disposition::DeadLettered);
    }

    #[test]
    fn routing_by_kind() {
        let routes = Routes { content: "c".into(), access: "a".into() };
        assert_eq!(routes.targets(EventKind::FileCreated), vec!["c"]);
        assert_eq!(routes.targets(EventKind::FileDeleted), vec!["c"]);
        assert_eq!(routes.targets(EventKind::AccessChanged), vec!["a"]);
        assert!(routes.targets(EventKind::Unknown).is_empty());
    }
}
