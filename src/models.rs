//! Core data models that flow through the ingestion pipeline.
//!
//! A notification enters the gateway, is wrapped in a [`QueueEntry`], and is
//! normalised into a [`Job`] by whichever side needs to act on it. Consumers
//! write [`FileRecord`]s to the metadata store and apply
//! [`AccessDescriptor`]s to indexed chunks.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Canonical classification of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileCreated,
    FileUpdated,
    FileDeleted,
    AccessChanged,
    Unknown,
}

impl EventKind {
    /// Events that change file content and are handled by the content consumer.
    pub fn is_content(self) -> bool {
        matches!(
            self,
            EventKind::FileCreated | EventKind::FileUpdated | EventKind::FileDeleted
        )
    }

    pub fn is_actionable(self) -> bool {
        self != EventKind::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::FileCreated => "file_created",
            EventKind::FileUpdated => "file_updated",
            EventKind::FileDeleted => "file_deleted",
            EventKind::AccessChanged => "access_changed",
            EventKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical unit of work derived from a notification.
///
/// `file_id` is non-empty for every actionable kind, and `file_path` is
/// already service-account relative.
#[derive(Debug, Clone)]
pub struct Job {
    pub source: String,
    pub event_kind: EventKind,
    pub file_id: String,
    pub file_path: String,
    pub content_fingerprint: Option<String>,
    /// Owner extracted while resolving the path, if the notification carried one.
    pub owner_hint: Option<String>,
    pub raw_payload: Value,
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Leased,
    Dead,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Leased => "leased",
            EntryStatus::Dead => "dead",
        }
    }
}

/// Wire form of a work queue entry.
///
/// Carries the original notification body untouched; the job is derived
/// from `payload` on the consuming side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub source: String,
    pub payload: Value,
    pub status: EntryStatus,
    /// Number of times this entry has been handed to a consumer.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueEntry {
    pub fn pending(source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            payload,
            status: EntryStatus::Pending,
            attempts: 0,
        }
    }
}

/// One row of the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub path: String,
    pub content_fingerprint: Option<String>,
    /// Owner taken from the notification path, kept so reconciliation
    /// derives the same descriptor as the event that indexed the file.
    pub owner: Option<String>,
    pub last_indexed_at: DateTime<Utc>,
}

/// Read permissions applied to every chunk of a file.
///
/// Sets are ordered so the serialised payload is stable, which keeps
/// repeated propagation of unchanged permissions a no-op downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDescriptor {
    pub owner: String,
    pub allowed_users: BTreeSet<String>,
    pub allowed_groups: BTreeSet<String>,
}

impl AccessDescriptor {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            allowed_users: BTreeSet::new(),
            allowed_groups: BTreeSet::new(),
        }
    }

    /// Chunk payload fields written by the access consumer.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "owner": self.owner,
            "allowed_users": self.allowed_users,
            "allowed_groups": self.allowed_groups,
        })
    }
}
