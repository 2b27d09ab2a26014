//! Notification shapes and their normalisation into [`Job`]s.
//!
//! Two upstream shapes are accepted:
//!
//! | Shape | Discriminator | Example |
//! |-------|---------------|---------|
//! | Legacy | flat `event` string | `{"event": "file.created", "file_id": 42, "path": "Docs/a.pdf"}` |
//! | Structured | `event` object with `class` | `{"event": {"class": "OCP\\Files\\Events\\Node\\NodeCreatedEvent", "node": {...}}}` |
//!
//! Each body is detected once and parsed into a [`Notification`]; each
//! variant has its own normalisation function, and both converge on the
//! canonical [`Job`]. The gateway and the consumers share [`Normalizer`], so
//! routing and processing always agree on what a payload means.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::models::{EventKind, Job};
use crate::path::{PathResolver, ResolverChain};

/// A parsed notification, before normalisation.
#[derive(Debug, Clone)]
pub enum Notification {
    Legacy(LegacyNotification),
    Structured(StructuredNotification),
}

/// Flat notification sent by the older webhooks app.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyNotification {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub file_id: Option<Value>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Notification sent by the webhook listeners app.
#[derive(Debug, Clone, Deserialize)]
pub struct StructuredNotification {
    pub event: StructuredEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredEvent {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub node: Option<EventNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventNode {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl Notification {
    /// Detects the shape of a JSON body.
    ///
    /// An `event` object means structured; any of the flat keys means legacy.
    pub fn detect(payload: &Value) -> SyncResult<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| SyncError::MalformedEvent("body is not a JSON object".into()))?;

        match obj.get("event") {
            Some(Value::Object(_)) => serde_json::from_value(payload.clone())
                .map(Notification::Structured)
                .map_err(|e| SyncError::MalformedEvent(format!("structured event: {}", e))),
            _ if ["event", "file_id", "path"].iter().any(|k| obj.contains_key(*k)) => {
                serde_json::from_value(payload.clone())
                    .map(Notification::Legacy)
                    .map_err(|e| SyncError::MalformedEvent(format!("legacy event: {}", e)))
            }
            _ => Err(SyncError::MalformedEvent(
                "unrecognised notification shape".into(),
            )),
        }
    }
}

/// Maps a structured event class name to an [`EventKind`] by substring.
pub fn kind_from_class(class: &str) -> EventKind {
    if class.contains("CreatedEvent") {
        EventKind::FileCreated
    } else if class.contains("WrittenEvent") {
        EventKind::FileUpdated
    } else if class.contains("DeletedEvent") {
        EventKind::FileDeleted
    } else {
        EventKind::Unknown
    }
}

/// Maps a legacy event name to an [`EventKind`].
pub fn kind_from_legacy(event: &str) -> EventKind {
    match event {
        "file.created" => EventKind::FileCreated,
        "file.updated" => EventKind::FileUpdated,
        "file.deleted" => EventKind::FileDeleted,
        "acl.changed" => EventKind::AccessChanged,
        _ => EventKind::Unknown,
    }
}

/// Renders a file id that may arrive as a string or a number.
fn file_id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turns notification bodies into jobs using a configured path resolver.
pub struct Normalizer {
    resolver: Arc<dyn PathResolver>,
}

impl Normalizer {
    pub fn new(resolver: Arc<dyn PathResolver>) -> Self {
        Self { resolver }
    }

    /// Detects the shape and normalises in one step.
    pub fn normalize(&self, source: &str, payload: &Value) -> SyncResult<Job> {
        match Notification::detect(payload)? {
            Notification::Legacy(n) => self.from_legacy(source, n, payload),
            Notification::Structured(n) => self.from_structured(source, n, payload),
        }
    }

    fn from_legacy(&self, source: &str, n: LegacyNotification, raw: &Value) -> SyncResult<Job> {
        let event_kind = n
            .event
            .as_deref()
            .map(kind_from_legacy)
            .unwrap_or(EventKind::Unknown);

        finish(Job {
            source: source.to_string(),
            event_kind,
            file_id: file_id_string(n.file_id.as_ref()).unwrap_or_default(),
            file_path: n.path.unwrap_or_default(),
            content_fingerprint: n.etag,
            owner_hint: n.owner,
            raw_payload: raw.clone(),
        })
    }

    fn from_structured(
        &self,
        source: &str,
        n: StructuredNotification,
        raw: &Value,
    ) -> SyncResult<Job> {
        let event_kind = kind_from_class(&n.event.class);
        let node = n.event.node.unwrap_or_default();
        let raw_path = node.path.unwrap_or_default();

        let (file_path, owner_hint) = match self.resolver.resolve(&raw_path) {
            Some(res) => {
                if !res.resolved && event_kind.is_actionable() {
                    warn!(path = %raw_path, "notification path not resolved, using it unchanged");
                }
                (res.path, res.owner)
            }
            None => (raw_path, None),
        };

        finish(Job {
            source: source.to_string(),
            event_kind,
            file_id: file_id_string(node.id.as_ref()).unwrap_or_default(),
            file_path,
            content_fingerprint: node.etag,
            owner_hint,
            raw_payload: raw.clone(),
        })
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(ResolverChain::default()))
    }
}

/// Rejects actionable jobs that lack the fields consumers depend on.
fn finish(job: Job) -> SyncResult<Job> {
    if job.event_kind.is_actionable() {
        if job.file_id.is_empty() {
            return Err(SyncError::MalformedEvent(format!(
                "{} event without a file id",
                job.event_kind
            )));
        }
        if job.file_path.is_empty() && job.event_kind != EventKind::FileDeleted {
            return Err(SyncError::MalformedEvent(format!(
                "{} event for file {} without a path",
                job.event_kind, job.file_id
            )));
        }
    }
    Ok(job)
}
