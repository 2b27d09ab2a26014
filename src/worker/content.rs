//! Content consumer: keeps indexed chunks and metadata in step with file content.
//!
//! Created and updated files are downloaded to a temporary file, run
//! through the [`ContentPipeline`], and recorded in the metadata store. A
//! follow-up `acl.changed` entry is queued ahead of the record so the access
//! consumer stamps permissions on the new chunks. Deleted files lose their chunks
//! and their metadata row.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{JobHandler, Worker};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::event::Normalizer;
use crate::filestore::{self, FileStore};
use crate::index::{self, ChunkMetadata, IndexClient};
use crate::metadata::MetadataStore;
use crate::models::{EventKind, Job, QueueEntry};
use crate::path::ResolverChain;
use crate::pipeline::{ContentPipeline, EmbeddingPipeline};
use crate::queue::{self, WorkQueue};

pub struct ContentConsumer {
    files: Arc<dyn FileStore>,
    pipeline: Arc<dyn ContentPipeline>,
    index: Arc<dyn IndexClient>,
    metadata: MetadataStore,
    queue: Arc<dyn WorkQueue>,
    access_queue: String,
}

impl ContentConsumer {
    pub fn new(
        files: Arc<dyn FileStore>,
        pipeline: Arc<dyn ContentPipeline>,
        index: Arc<dyn IndexClient>,
        metadata: MetadataStore,
        queue: Arc<dyn WorkQueue>,
        access_queue: impl Into<String>,
    ) -> Self {
        Self {
            files,
            pipeline,
            index,
            metadata,
            queue,
            access_queue: access_queue.into(),
        }
    }

    async fn index_file(&self, job: &Job) -> SyncResult<()> {
        if let Some(existing) = self.metadata.get(&job.file_id).await? {
            let unchanged = job.content_fingerprint.is_some()
                && existing.content_fingerprint == job.content_fingerprint
                && existing.path == job.file_path;
            if unchanged {
                debug!("fingerprint unchanged, skipping");
                return Ok(());
            }
        }

        // Removed on drop, whichever way this function returns.
        let temp = tempfile::Builder::new()
            .prefix("rag-sync-")
            .tempfile()
            .map_err(|e| SyncError::local_io(format!("create temp file: {}", e)))?;
        let handle = temp
            .as_file()
            .try_clone()
            .map_err(|e| SyncError::local_io(format!("open temp file: {}", e)))?;
        let mut dest = tokio::fs::File::from_std(handle);

        let bytes = self.files.download(&job.file_path, &mut dest).await?;
        drop(dest);

        let meta = ChunkMetadata {
            file_id: job.file_id.clone(),
            path: job.file_path.clone(),
            fingerprint: job.content_fingerprint.clone(),
        };
        let chunks = self.pipeline.process(temp.path(), &meta).await?;

        // Queued before the record is written: the record is what lets a
        // redelivery skip the file, so it must not exist without a follow-up.
        let follow_up = QueueEntry::pending(
            job.source.clone(),
            json!({
                "event": "acl.changed",
                "file_id": job.file_id,
                "path": job.file_path,
                "owner": job.owner_hint,
            }),
        );
        self.queue.push(&self.access_queue, &follow_up).await?;

        self.metadata
            .upsert(
                &job.file_id,
                &job.file_path,
                job.content_fingerprint.as_deref(),
                job.owner_hint.as_deref(),
            )
            .await?;

        info!(bytes, chunks, "file indexed");
        Ok(())
    }

    async fn remove_file(&self, job: &Job) -> SyncResult<()> {
        self.index.delete_file(&job.file_id).await?;
        let existed = self.metadata.mark_deleted(&job.file_id).await?;
        info!(existed, "file removed from index");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ContentConsumer {
    fn role(&self) -> &'static str {
        "content"
    }

    fn accepts(&self, kind: EventKind) -> bool {
        kind.is_content()
    }

    async fn handle(&self, job: &Job) -> SyncResult<()> {
        match job.event_kind {
            EventKind::FileCreated | EventKind::FileUpdated => self.index_file(job).await,
            EventKind::FileDeleted => self.remove_file(job).await,
            EventKind::AccessChanged | EventKind::Unknown => Ok(()),
        }
    }
}

/// `rag-sync content-worker`
pub async fn run_content_worker(config: &Config) -> Result<()> {
    config.validate_filestore()?;

    let queue: Arc<dyn WorkQueue> = Arc::new(queue::open(config).await?);
    let metadata = MetadataStore::connect(&config.metadata.url)
        .await
        .context("Failed to open metadata store")?;

    let qdrant = index::from_config(&config.index)?;
    let index: Arc<dyn IndexClient> = Arc::new(qdrant);
    let pipeline = EmbeddingPipeline::from_config(&config.pipeline, index.clone())?;
    index
        .ensure_collection(pipeline.dims())
        .await
        .context("Failed to prepare index collection")?;

    let files: Arc<dyn FileStore> = Arc::new(filestore::from_config(&config.filestore)?);
    let consumer = ContentConsumer::new(
        files,
        Arc::new(pipeline),
        index,
        metadata.clone(),
        queue.clone(),
        config.queue.access_queue.clone(),
    );

    let normalizer = Arc::new(Normalizer::new(Arc::new(ResolverChain::with_owner_root(
        config.paths.owner_prefix_root.clone(),
    ))));
    let worker = Worker::new(
        queue,
        config.queue.content_queue.clone(),
        normalizer,
        Arc::new(consumer),
    )
    .with_timeouts(config.queue.pop_timeout(), config.queue.job_timeout());

    worker.run(super::shutdown_token()).await;
    metadata.close().await;
    Ok(())
}
