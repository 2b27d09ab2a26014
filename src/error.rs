//! Error taxonomy for the ingestion pipeline.
//!
//! Every component boundary returns [`SyncError`]. The variant decides how
//! the failure is handled: authentication and parse errors terminate at the
//! gateway, everything else is surfaced to the work queue, which owns retry,
//! backoff and dead-lettering.

use std::time::Duration;

use thiserror::Error;

/// Failure raised while receiving, normalising or applying a change event.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid credential on an inbound notification.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Notification body that cannot be turned into a job.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// File store unreachable, or the file no longer exists.
    #[error("fetch of '{path}' failed: {message}")]
    UpstreamFetch { path: String, message: String },

    /// Content pipeline could not extract, embed or write the file.
    #[error("content pipeline failed for file {file_id}: {message}")]
    Pipeline { file_id: String, message: String },

    /// Metadata store or index store rejected a write.
    #[error("store write failed: {0}")]
    Store(String),

    /// Work queue backend unreachable.
    #[error("queue unavailable: {0}")]
    Queue(String),

    /// Local disk failure while staging a file, e.g. a full temp dir.
    #[error("local I/O failed: {0}")]
    LocalIo(String),

    /// A job exceeded its processing deadline.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

/// Result alias used across component boundaries.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn upstream(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::UpstreamFetch {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn pipeline(file_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Pipeline {
            file_id: file_id.into(),
            message: message.to_string(),
        }
    }

    pub fn store(message: impl std::fmt::Display) -> Self {
        SyncError::Store(message.to_string())
    }

    pub fn queue(message: impl std::fmt::Display) -> Self {
        SyncError::Queue(message.to_string())
    }

    pub fn local_io(message: impl std::fmt::Display) -> Self {
        SyncError::LocalIo(message.to_string())
    }

    /// Whether redelivering the job could succeed.
    ///
    /// Malformed events and authentication failures never improve on retry;
    /// they are dead-lettered on first failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::Unauthenticated(_) | SyncError::MalformedEvent(_)
        )
    }

    /// Short machine-readable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Unauthenticated(_) => "unauthenticated",
            SyncError::MalformedEvent(_) => "malformed_event",
            SyncError::UpstreamFetch { .. } => "upstream_fetch",
            SyncError::Pipeline { .. } => "pipeline",
            SyncError::Store(_) => "store",
            SyncError::Queue(_) => "queue",
            SyncError::LocalIo(_) => "local_io",
            SyncError::Timeout(_) => "timeout",
        }
    }
}
