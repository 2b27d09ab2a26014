//! Consumer loop shared by the content and access workers.
//!
//! A [`Worker`] pops one entry at a time from its role's queue, normalises
//! the payload with the same [`Normalizer`] the gateway used for routing,
//! and hands the resulting [`Job`] to a [`JobHandler`]. The loop owns the
//! queue protocol so handlers never ack or nack themselves:
//!
//! | Outcome | Queue action |
//! |---------|--------------|
//! | handler succeeded | `ack` |
//! | handler failed or timed out | `nack` (retry with backoff, or dead-letter) |
//! | malformed payload, or a kind this role ignores | `ack` and drop |
//!
//! A failing job never stops the loop; queue outages are logged and the
//! loop backs off before polling again.

pub mod access;
pub mod content;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{SyncError, SyncResult};
use crate::event::Normalizer;
use crate::models::{EventKind, Job};
use crate::queue::{Disposition, WorkQueue};

/// Pause after the queue itself fails before polling again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Role name used in logs.
    fn role(&self) -> &'static str;

    /// Whether this role acts on jobs of `kind`.
    fn accepts(&self, kind: EventKind) -> bool;

    async fn handle(&self, job: &Job) -> SyncResult<()>;
}

/// What a single iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing arrived within the pop timeout.
    Idle,
    Processed,
    /// Acked without running the handler.
    Dropped,
    Failed(Disposition),
}

pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
    normalizer: Arc<Normalizer>,
    handler: Arc<dyn JobHandler>,
    pop_timeout: Duration,
    job_timeout: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        queue_name: impl Into<String>,
        normalizer: Arc<Normalizer>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            normalizer,
            handler,
            pop_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(900),
        }
    }

    pub fn with_timeouts(mut self, pop_timeout: Duration, job_timeout: Duration) -> Self {
        self.pop_timeout = pop_timeout;
        self.job_timeout = job_timeout;
        self
    }

    /// Runs until `cancel` fires. A job in flight is always finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        let role = self.handler.role();
        info!(role, queue = %self.queue_name, "worker started");

        while !cancel.is_cancelled() {
            if let Err(e) = self.run_once().await {
                error!(role, queue = %self.queue_name, error = %e, "queue error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                }
            }
        }

        info!(role, queue = %self.queue_name, "worker stopped");
    }

    /// Pops and processes at most one entry.
    ///
    /// Only queue failures are returned as errors; handler failures are
    /// reported to the queue and show up as [`Outcome::Failed`].
    pub async fn run_once(&self) -> SyncResult<Outcome> {
        let Some(delivery) = self.queue.pop(&self.queue_name, self.pop_timeout).await? else {
            return Ok(Outcome::Idle);
        };
        let entry = &delivery.entry;

        let job = match self.normalizer.normalize(&entry.source, &entry.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %entry.id, error = %e, "dropping malformed entry");
                self.queue.ack(&delivery).await?;
                return Ok(Outcome::Dropped);
            }
        };

        if !self.handler.accepts(job.event_kind) {
            debug!(job_id = %entry.id, kind = %job.event_kind, "event ignored by this role");
            self.queue.ack(&delivery).await?;
            return Ok(Outcome::Dropped);
        }

        let span = info_span!(
            "job",
            role = self.handler.role(),
            job_id = %entry.id,
            kind = %job.event_kind,
            file_id = %job.file_id,
            path = %job.file_path,
            attempt = entry.attempts,
        );

        async {
            let result = match tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.job_timeout)),
            };

            match result {
                Ok(()) => {
                    self.queue.ack(&delivery).await?;
                    info!("job done");
                    Ok::<_, SyncError>(Outcome::Processed)
                }
                Err(e) => {
                    let disposition = self.queue.nack(&delivery, &e).await?;
                    match disposition {
                        Disposition::Retry { delay } => {
                            warn!(error = %e, error_kind = e.kind(), retry_in = ?delay, "job failed")
                        }
                        Disposition::DeadLettered => {
                            error!(error = %e, error_kind = e.kind(), "job failed, dead-lettered")
                        }
                    }
                    Ok(Outcome::Failed(disposition))
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Token cancelled on Ctrl-C or, on Unix, SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested, finishing current job");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
