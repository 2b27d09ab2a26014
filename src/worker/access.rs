//! Access consumer: applies read permissions to indexed chunks.
//!
//! Two triggers share one code path ([`AccessConsumer::propagate`]):
//!
//! - `acl.changed` jobs from the access queue, either from the notification
//!   source or queued by the content consumer after indexing a file;
//! - a periodic reconciliation sweep over every file in the metadata store,
//!   which bounds how long a permission change without an event can go
//!   unnoticed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobHandler, Worker};
use crate::access::AccessPolicy;
use crate::config::Config;
use crate::error::SyncResult;
use crate::event::Normalizer;
use crate::filestore::{self, FileStore};
use crate::index::{self, IndexClient};
use crate::metadata::MetadataStore;
use crate::models::{AccessDescriptor, EventKind, Job};
use crate::path::ResolverChain;
use crate::queue::{self, WorkQueue};

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub files: usize,
    pub applied: usize,
    /// Recorded files the store no longer has. Left untouched.
    pub missing: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct AccessConsumer {
    files: Arc<dyn FileStore>,
    index: Arc<dyn IndexClient>,
    policy: Arc<AccessPolicy>,
    metadata: MetadataStore,
}

impl AccessConsumer {
    pub fn new(
        files: Arc<dyn FileStore>,
        index: Arc<dyn IndexClient>,
        policy: Arc<AccessPolicy>,
        metadata: MetadataStore,
    ) -> Self {
        Self {
            files,
            index,
            policy,
            metadata,
        }
    }

    /// Same consumer reading metadata through another pool.
    pub fn with_metadata(mut self, metadata: MetadataStore) -> Self {
        self.metadata = metadata;
        self
    }

    /// Fetches the current shares, derives the descriptor and applies it to
    /// every chunk of `file_id`.
    pub async fn propagate(
        &self,
        file_id: &str,
        path: &str,
        owner_hint: Option<&str>,
    ) -> SyncResult<AccessDescriptor> {
        let shares = self.files.fetch_access(path).await?;
        let descriptor = self.policy.derive(path, owner_hint, &shares);
        self.index.set_access(file_id, &descriptor).await?;
        debug!(
            file_id,
            path,
            owner = %descriptor.owner,
            users = descriptor.allowed_users.len(),
            groups = descriptor.allowed_groups.len(),
            "access applied"
        );
        Ok(descriptor)
    }

    /// Re-applies access to every file known at the start of the sweep.
    ///
    /// A failing file is logged and counted; the sweep carries on.
    pub async fn reconcile(&self) -> SyncResult<ReconcileReport> {
        self.reconcile_until(&CancellationToken::new()).await
    }

    /// [`reconcile`](Self::reconcile), stopping between files once `cancel`
    /// fires. Files not reached are in `files` but in no other count.
    pub async fn reconcile_until(
        &self,
        cancel: &CancellationToken,
    ) -> SyncResult<ReconcileReport> {
        let records = self.metadata.list_all().await?;
        let mut report = ReconcileReport {
            files: records.len(),
            ..Default::default()
        };

        for record in &records {
            if cancel.is_cancelled() {
                info!(
                    done = report.applied + report.missing + report.failed,
                    files = report.files,
                    "reconciliation sweep interrupted"
                );
                break;
            }
            let result = match self.files.exists(&record.path).await {
                Ok(false) => {
                    warn!(file_id = %record.file_id, path = %record.path, "recorded file missing from store");
                    report.missing += 1;
                    continue;
                }
                Ok(true) => {
                    self.propagate(&record.file_id, &record.path, record.owner.as_deref())
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    warn!(file_id = %record.file_id, path = %record.path, error = %e, "reconcile failed for file");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl JobHandler for AccessConsumer {
    fn role(&self) -> &'static str {
        "access"
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind == EventKind::AccessChanged
    }

    async fn handle(&self, job: &Job) -> SyncResult<()> {
        let recorded_owner = match &job.owner_hint {
            Some(_) => None,
            None => self.metadata.get(&job.file_id).await?.and_then(|r| r.owner),
        };
        let owner = job.owner_hint.as_deref().or(recorded_owner.as_deref());
        let descriptor = self.propagate(&job.file_id, &job.file_path, owner).await?;
        info!(owner = %descriptor.owner, "access propagated");
        Ok(())
    }
}

/// Runs [`AccessConsumer::reconcile`] now and then every `period` until cancelled.
pub fn spawn_reconciler(
    consumer: AccessConsumer,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match consumer.reconcile_until(&cancel).await {
                Ok(report) => info!(
                    files = report.files,
                    applied = report.applied,
                    missing = report.missing,
                    failed = report.failed,
                    "reconciliation sweep done"
                ),
                Err(e) => error!(error = %e, "reconciliation sweep failed"),
            }
        }
    })
}

async fn build_consumer(config: &Config) -> Result<AccessConsumer> {
    config.validate_filestore()?;
    let files: Arc<dyn FileStore> = Arc::new(filestore::from_config(&config.filestore)?);
    let index: Arc<dyn IndexClient> = Arc::new(index::from_config(&config.index)?);
    let policy = Arc::new(AccessPolicy::from_config(&config.access)?);
    let metadata = MetadataStore::connect(&config.metadata.url)
        .await
        .context("Failed to open metadata store")?;
    Ok(AccessConsumer::new(files, index, policy, metadata))
}

/// `rag-sync access-worker`
pub async fn run_access_worker(config: &Config) -> Result<()> {
    let consumer = build_consumer(config).await?;
    let queue: Arc<dyn WorkQueue> = Arc::new(queue::open(config).await?);
    let cancel = super::shutdown_token();

    // The sweep runs next to the dequeue loop, on its own connections.
    let sweep_metadata = MetadataStore::connect(&config.metadata.url).await?;
    let reconciler = spawn_reconciler(
        consumer.clone().with_metadata(sweep_metadata),
        config.access.reconcile_interval(),
        cancel.clone(),
    );

    let normalizer = Arc::new(Normalizer::new(Arc::new(ResolverChain::with_owner_root(
        config.paths.owner_prefix_root.clone(),
    ))));
    let worker = Worker::new(
        queue,
        config.queue.access_queue.clone(),
        normalizer,
        Arc::new(consumer),
    )
    .with_timeouts(config.queue.pop_timeout(), config.queue.job_timeout());

    worker.run(cancel).await;
    reconciler.await.context("Reconciler task panicked")?;
    Ok(())
}

/// `rag-sync reconcile`
pub async fn run_reconcile(config: &Config) -> Result<()> {
    let consumer = build_consumer(config).await?;
    let report = consumer.reconcile().await?;
    println!(
        "Reconciled {} files: {} applied, {} missing, {} failed",
        report.files, report.applied, report.missing, report.failed
    );
    Ok(())
}
