//! SQLite-backed [`WorkQueue`].
//!
//! Entries live in `queue_entries`. Popping is a single
//! `UPDATE ... RETURNING` that leases the oldest ready row, so concurrent
//! consumers never receive the same entry while its lease is live. A lease
//! that expires without an ack (consumer crashed) makes the entry visible
//! again, which is what gives at-least-once delivery across restarts. An
//! entry whose lease expires on its last allowed delivery is dead-lettered
//! instead, so a job that kills its consumer cannot cycle forever.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::{Delivery, Disposition, QueueStats, RetryPolicy, WorkQueue};
use crate::error::{SyncError, SyncResult};
use crate::models::{EntryStatus, QueueEntry};

/// How often `pop` re-checks an empty queue while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct SqliteQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
    visibility: Duration,
}

impl SqliteQueue {
    /// Expects the schema from [`crate::migrate::migrate_queue`].
    pub fn new(pool: SqlitePool, policy: RetryPolicy, visibility: Duration) -> Self {
        Self {
            pool,
            policy,
            visibility,
        }
    }

    /// Dead-letters entries whose lease expired on their last allowed
    /// delivery. Such a consumer crashed or hung, so no nack ever came.
    async fn expire_exhausted(&self, queue: &str, now: i64) -> SyncResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'dead', leased_until = NULL,
                last_error = 'lease expired on final delivery attempt'
            WHERE queue = ? AND status = 'leased' AND leased_until <= ? AND attempts >= ?
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(i64::from(self.policy.max_attempts))
        .execute(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        let expired = result.rows_affected();
        if expired > 0 {
            warn!(queue, expired, "dead-lettered entries whose final lease expired");
        }
        Ok(expired)
    }

    async fn try_lease(&self, queue: &str) -> SyncResult<Option<Delivery>> {
        let now = now_ms();
        let leased_until = now + self.visibility.as_millis() as i64;
        self.expire_exhausted(queue, now).await?;

        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            r#"
            UPDATE queue_entries
            SET status = 'leased', attempts = attempts + 1, leased_until = ?
            WHERE id = (
                SELECT id FROM queue_entries
                WHERE queue = ?
                  AND ((status = 'pending' AND available_at <= ?)
                    OR (status = 'leased' AND leased_until <= ? AND attempts < ?))
                ORDER BY available_at, rowid
                LIMIT 1
            )
            RETURNING id, source, payload, attempts
            "#,
        )
        .bind(leased_until)
        .bind(queue)
        .bind(now)
        .bind(now)
        .bind(i64::from(self.policy.max_attempts))
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        let Some((id, source, payload, attempts)) = row else {
            return Ok(None);
        };

        let payload = match serde_json::from_str(&payload) {
            Ok(v) => v,
            Err(e) => {
                // Only reachable if the table was edited by hand.
                warn!(entry_id = %id, error = %e, "queue entry payload is not JSON");
                serde_json::Value::Null
            }
        };

        Ok(Some(Delivery {
            queue: queue.to_string(),
            entry: QueueEntry {
                id,
                source,
                payload,
                status: EntryStatus::Leased,
                attempts: attempts.max(0) as u32,
            },
        }))
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn push(&self, queue: &str, entry: &QueueEntry) -> SyncResult<()> {
        let now = now_ms();
        let payload = serde_json::to_string(&entry.payload).map_err(SyncError::queue)?;

        sqlx::query(
            r#"
            INSERT INTO queue_entries (id, queue, source, payload, status, attempts, available_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(queue)
        .bind(&entry.source)
        .bind(&payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        debug!(queue, entry_id = %entry.id, "entry pushed");
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> SyncResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_lease(queue).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SyncResult<()> {
        sqlx::query("DELETE FROM queue_entries WHERE id = ?")
            .bind(&delivery.entry.id)
            .execute(&self.pool)
            .await
            .map_err(SyncError::queue)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &SyncError) -> SyncResult<Disposition> {
        let disposition = self.policy.disposition(delivery.entry.attempts, error);
        let message = error.to_string();

        match disposition {
            Disposition::Retry { delay } => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET status = 'pending', available_at = ?, leased_until = NULL, last_error = ?
                    WHERE id = ?
                    "#,
                )
                .bind(now_ms() + delay.as_millis() as i64)
                .bind(&message)
                .bind(&delivery.entry.id)
                .execute(&self.pool)
                .await
                .map_err(SyncError::queue)?;
            }
            Disposition::DeadLettered => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries
                    SET status = 'dead', leased_until = NULL, last_error = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&message)
                .bind(&delivery.entry.id)
                .execute(&self.pool)
                .await
                .map_err(SyncError::queue)?;
            }
        }

        Ok(disposition)
    }

    async fn stats(&self, queue: &str) -> SyncResult<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM queue_entries WHERE queue = ? GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(SyncError::queue)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "leased" => stats.leased = count,
                "dead" => stats.dead = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn requeue_dead(&self, queue: &str) -> SyncResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'pending', attempts = 0, available_at = ?, last_error = NULL
            WHERE queue = ? AND status = 'dead'
            "#,
        )
        .bind(now_ms())
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(SyncError::queue)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::migrate_queue;
    use serde_json::json;
    use tempfile::TempDir;

    async fn queue(tmp: &TempDir, policy: RetryPolicy, visibility: Duration) -> SqliteQueue {
        let url = format!("sqlite:{}", tmp.path().join("queue.sqlite").display());
        let pool = db::connect(&url).await.unwrap();
        migrate_queue(&pool).await.unwrap();
        SqliteQueue::new(pool, policy, visibility)
    }

    fn entry(n: i64) -> QueueEntry {
        QueueEntry::pending("nextcloud", json!({"event": "file.created", "file_id": n}))
    }

    #[tokio::test]
    async fn push_pop_ack() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, RetryPolicy::default(), Duration::from_secs(60)).await;

        q.push("content", &entry(1)).await.unwrap();
        let d = q.pop("content", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d.entry.payload["file_id"], 1);
        assert_eq!(d.entry.attempts, 1);
        assert_eq!(d.entry.source, "nextcloud");

        assert_eq!(q.stats("content").await.unwrap().leased, 1);
        q.ack(&d).await.unwrap();
        assert_eq!(q.stats("content").await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, RetryPolicy::default(), Duration::from_secs(60)).await;

        q.push("content", &entry(1)).await.unwrap();
        assert!(q.pop("access", Duration::from_millis(10)).await.unwrap().is_none());
        assert!(q.pop("content", Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fifo_within_a_queue() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, RetryPolicy::default(), Duration::from_secs(60)).await;

        for n in 1..=3 {
            q.push("content", &entry(n)).await.unwrap();
        }
        for n in 1..=3 {
            let d = q.pop("content", Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(d.entry.payload["file_id"], n);
            q.ack(&d).await.unwrap();
        }
    }

    #[tokio::test]
    async fn leased_entry_is_invisible_until_lease_expires() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, RetryPolicy::default(), Duration::from_millis(200)).await;

        q.push("content", &entry(1)).await.unwrap();
        let first = q.pop("content", Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(q.pop("content", Duration::from_millis(10)).await.unwrap().is_none());

        // Consumer "crashed": no ack. The entry comes back after the lease.
        let again = q.pop("content", Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.entry.id, first.entry.id);
        assert_eq!(again.entry.attempts, 2);
    }

    #[tokio::test]
    async fn unacked_entry_is_dead_lettered_after_max_deliveries() {
        let tmp = TempDir::new().unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let q = queue(&tmp, policy, Duration::from_millis(30)).await;
        q.push("content", &entry(1)).await.unwrap();

        // Consumer dies on every delivery: never acks, never nacks.
        let mut attempts = Vec::new();
        for _ in 0..6 {
            if let Some(d) = q.pop("content", Duration::from_millis(300)).await.unwrap() {
                attempts.push(d.entry.attempts);
            }
        }

        assert_eq!(attempts, vec![1, 2]);
        let stats = q.stats("content").await.unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn nack_reschedules_then_dead_letters() {
        let tmp = TempDir::new().unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(0),
            backoff_max: Duration::from_millis(0),
        };
        let q = queue(&tmp, policy, Duration::from_secs(60)).await;
        let err = SyncError::upstream("a.pdf", "HTTP 503");

        q.push("content", &entry(1)).await.unwrap();
        let d = q.pop("content", Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(matches!(q.nack(&d, &err).await.unwrap(), Disposition::Retry { .. }));

        let d = q.pop("content", Duration::from_millis(500)).await.unwrap().unwrap();
        assert_eq!(d.entry.attempts, 2);
        assert_eq!(q.nack(&d, &err).await.unwrap(), Disposition::DeadLettered);

        assert!(q.pop("content", Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(q.stats("content").await.unwrap().dead, 1);

        assert_eq!(q.requeue_dead("content").await.unwrap(), 1);
        let d = q.pop("content", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d.entry.attempts, 1);
    }

    #[tokio::test]
    async fn backoff_delays_redelivery() {
        let tmp = TempDir::new().unwrap();
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(60),
        };
        let q = queue(&tmp, policy, Duration::from_secs(60)).await;

        q.push("content", &entry(1)).await.unwrap();
        let d = q.pop("content", Duration::from_millis(10)).await.unwrap().unwrap();
        q.nack(&d, &SyncError::store("locked")).await.unwrap();

        assert!(q.pop("content", Duration::from_millis(50)).await.unwrap().is_none());
        assert_eq!(q.stats("content").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn ping_reports_reachability() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, RetryPolicy::default(), Duration::from_secs(60)).await;
        assert!(q.ping().await);
    }
}
