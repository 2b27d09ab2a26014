//! Qdrant over its REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{point_id, ChunkMetadata, ChunkPoint, IndexClient};
use crate::config::IndexConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::AccessDescriptor;

/// Points per `PUT /points` request.
const UPSERT_BATCH: usize = 128;

pub struct QdrantIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
}

impl QdrantIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build Qdrant HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: Method, suffix: &str) -> RequestBuilder {
        let url = format!("{}/collections/{}{}", self.base_url, self.collection, suffix);
        let req = self.client.request(method, url);
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn send(&self, what: &str, req: RequestBuilder) -> SyncResult<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::store(format!("qdrant {}: {}", what, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::store(format!(
                "qdrant {} returned {}: {}",
                what, status, body
            )));
        }
        resp.json()
            .await
            .map_err(|e| SyncError::store(format!("qdrant {}: invalid response: {}", what, e)))
    }

    async fn delete_by_file(&self, file_id: &str) -> SyncResult<()> {
        let body = json!({ "filter": file_filter(file_id) });
        self.send(
            "delete",
            self.request(Method::POST, "/points/delete?wait=true").json(&body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IndexClient for QdrantIndex {
    async fn upsert_chunks(&self, meta: &ChunkMetadata, chunks: &[ChunkPoint]) -> SyncResult<()> {
        // Old chunks beyond the new count would otherwise survive a shrink.
        self.delete_by_file(&meta.file_id).await?;

        for batch in chunks.chunks(UPSERT_BATCH) {
            let points: Vec<Value> = batch
                .iter()
                .map(|c| {
                    json!({
                        "id": point_id(&meta.file_id, c.index).to_string(),
                        "vector": c.vector,
                        "payload": c.payload(meta),
                    })
                })
                .collect();

            self.send(
                "upsert",
                self.request(Method::PUT, "/points?wait=true")
                    .json(&json!({ "points": points })),
            )
            .await?;
        }

        debug!(file_id = %meta.file_id, chunks = chunks.len(), "chunks upserted");
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> SyncResult<()> {
        self.delete_by_file(file_id).await
    }

    async fn set_access(&self, file_id: &str, access: &AccessDescriptor) -> SyncResult<()> {
        let body = json!({
            "payload": access.to_payload(),
            "filter": file_filter(file_id),
        });
        self.send(
            "set_payload",
            self.request(Method::POST, "/points/payload?wait=true").json(&body),
        )
        .await?;
        Ok(())
    }

    async fn ensure_collection(&self, dims: usize) -> SyncResult<()> {
        let existing = self
            .request(Method::GET, "")
            .send()
            .await
            .map_err(|e| SyncError::store(format!("qdrant get collection: {}", e)))?;

        match existing.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => {
                return Err(SyncError::store(format!(
                    "qdrant get collection returned {}",
                    s
                )))
            }
        }

        let body = json!({ "vectors": { "size": dims, "distance": "Cosine" } });
        self.send("create collection", self.request(Method::PUT, "").json(&body))
            .await?;

        // Every write filters on file_id.
        let index = json!({ "field_name": "file_id", "field_schema": "keyword" });
        self.send(
            "create payload index",
            self.request(Method::PUT, "/index?wait=true").json(&index),
        )
        .await?;

        info!(collection = %self.collection, dims, "collection created");
        Ok(())
    }
}

fn file_filter(file_id: &str) -> Value {
    json!({
        "must": [
            { "key": "file_id", "match": { "value": file_id } }
        ]
    })
}
