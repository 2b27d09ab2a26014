//! Downstream chunk store.
//!
//! Every point in the index belongs to exactly one file and carries its
//! `file_id` in the payload, so the three write operations are all filtered
//! bulk operations on that field:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`IndexClient::upsert_chunks`] | replace every chunk of a file |
//! | [`IndexClient::delete_file`] | drop every chunk of a file |
//! | [`IndexClient::set_access`] | overwrite the access fields of every chunk of a file |
//!
//! Point ids are derived from `(file_id, chunk_index)`, so re-indexing the
//! same content converges to the same set of points.

pub mod memory;
pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::error::SyncResult;
use crate::models::AccessDescriptor;

/// File-level fields stamped on every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub file_id: String,
    pub path: String,
    pub fingerprint: Option<String>,
}

/// One embedded chunk ready to be written.
#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub index: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

impl ChunkPoint {
    /// Payload written alongside the vector. Access fields are absent here;
    /// they are owned by [`IndexClient::set_access`].
    pub fn payload(&self, meta: &ChunkMetadata) -> Value {
        json!({
            "file_id": meta.file_id,
            "path": meta.path,
            "etag": meta.fingerprint,
            "chunk_index": self.index,
            "text": self.text,
        })
    }
}

/// Deterministic point id for chunk `index` of `file_id`.
pub fn point_id(file_id: &str, index: usize) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", file_id, index).as_bytes())
}

#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Replaces all chunks of `meta.file_id` with `chunks`. An empty slice
    /// leaves the file with no chunks.
    async fn upsert_chunks(&self, meta: &ChunkMetadata, chunks: &[ChunkPoint]) -> SyncResult<()>;

    /// Removes every chunk of the file. Deleting an unknown file is not an error.
    async fn delete_file(&self, file_id: &str) -> SyncResult<()>;

    /// Overwrites the access payload on every chunk of the file and waits
    /// for the store to acknowledge.
    async fn set_access(&self, file_id: &str, access: &AccessDescriptor) -> SyncResult<()>;

    /// Prepares the backing collection for vectors of `dims` dimensions.
    async fn ensure_collection(&self, _dims: usize) -> SyncResult<()> {
        Ok(())
    }
}

/// Builds the configured Qdrant client.
pub fn from_config(config: &IndexConfig) -> Result<qdrant::QdrantIndex> {
    qdrant::QdrantIndex::new(config)
}
