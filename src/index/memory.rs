//! In-memory [`IndexClient`] that records what was written.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{point_id, ChunkMetadata, ChunkPoint, IndexClient};
use crate::error::{SyncError, SyncResult};
use crate::models::AccessDescriptor;

#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub file_id: String,
    pub payload: Map<String, Value>,
    pub vector: Vec<f32>,
}

#[derive(Default)]
pub struct InMemoryIndex {
    points: Mutex<BTreeMap<String, StoredPoint>>,
    set_access_calls: AtomicUsize,
    fail_file: Mutex<Option<String>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks of `file_id` ordered by chunk index.
    pub fn chunks(&self, file_id: &str) -> Vec<StoredPoint> {
        let mut out: Vec<_> = self
            .lock()
            .values()
            .filter(|p| p.file_id == file_id)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.payload.get("chunk_index").and_then(Value::as_u64));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_access_calls(&self) -> usize {
        self.set_access_calls.load(Ordering::SeqCst)
    }

    /// Makes every write touching `file_id` fail with a store error.
    pub fn fail_writes_for(&self, file_id: impl Into<String>) {
        *self.fail_file.lock().unwrap_or_else(|e| e.into_inner()) = Some(file_id.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredPoint>> {
        self.points.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, file_id: &str) -> SyncResult<()> {
        let failing = self.fail_file.lock().unwrap_or_else(|e| e.into_inner());
        if failing.as_deref() == Some(file_id) {
            return Err(SyncError::store(format!("injected failure for {}", file_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexClient for InMemoryIndex {
    async fn upsert_chunks(&self, meta: &ChunkMetadata, chunks: &[ChunkPoint]) -> SyncResult<()> {
        self.check(&meta.file_id)?;
        let mut points = self.lock();
        points.retain(|_, p| p.file_id != meta.file_id);
        for chunk in chunks {
            let payload = match chunk.payload(meta) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            points.insert(
                point_id(&meta.file_id, chunk.index).to_string(),
                StoredPoint {
                    file_id: meta.file_id.clone(),
                    payload,
                    vector: chunk.vector.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> SyncResult<()> {
        self.check(file_id)?;
        self.lock().retain(|_, p| p.file_id != file_id);
        Ok(())
    }

    async fn set_access(&self, file_id: &str, access: &AccessDescriptor) -> SyncResult<()> {
        self.check(file_id)?;
        self.set_access_calls.fetch_add(1, Ordering::SeqCst);
        let fields = match access.to_payload() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for point in self.lock().values_mut().filter(|p| p.file_id == file_id) {
            for (k, v) in &fields {
                point.payload.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> ChunkMetadata {
        ChunkMetadata {
            file_id: id.into(),
            path: format!("{}.txt", id),
            fingerprint: None,
        }
    }

    fn chunk(index: usize) -> ChunkPoint {
        ChunkPoint {
            index,
            text: format!("chunk {}", index),
            vector: vec![index as f32],
        }
    }

    #[tokio::test]
    async fn upsert_replaces_previous_chunks() {
        let index = InMemoryIndex::new();
        index.upsert_chunks(&meta("a"), &[chunk(0), chunk(1), chunk(2)]).await.unwrap();
        index.upsert_chunks(&meta("a"), &[chunk(0)]).await.unwrap();
        index.upsert_chunks(&meta("b"), &[chunk(0)]).await.unwrap();
        assert_eq!(index.chunks("a").len(), 1);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn set_access_touches_only_target_file() {
        let index = InMemoryIndex::new();
        index.upsert_chunks(&meta("a"), &[chunk(0), chunk(1)]).await.unwrap();
        index.upsert_chunks(&meta("b"), &[chunk(0)]).await.unwrap();

        index.set_access("a", &AccessDescriptor::owned_by("bob")).await.unwrap();
        assert!(index.chunks("a").iter().all(|p| p.payload["owner"] == "bob"));
        assert!(index.chunks("b")[0].payload.get("owner").is_none());
        assert_eq!(index.set_access_calls(), 1);
    }
}
