//! Embedding provider abstraction.
//!
//! [`Embedder`] turns a batch of texts into vectors. [`OpenAiEmbedder`]
//! talks to any OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            dims: config.dims,
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbeddingResponse = response
                            .json()
                            .await
                            .context("Invalid embeddings response")?;
                        return into_vectors(parsed, texts.len(), self.dims);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "embedding request failed, retrying");
                        last_err = Some(anyhow!("embeddings API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("embeddings API error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "embedding request failed, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Orders vectors by their `index` and checks count and width.
fn into_vectors(mut resp: EmbeddingResponse, expected: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if resp.data.len() != expected {
        bail!(
            "embeddings API returned {} vectors for {} inputs",
            resp.data.len(),
            expected
        );
    }
    resp.data.sort_by_key(|item| item.index);
    let vectors: Vec<Vec<f32>> = resp.data.into_iter().map(|item| item.embedding).collect();
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        bail!("embedding has {} dimensions, expected {}", v.len(), dims);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> EmbeddingResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn vectors_are_ordered_by_index() {
        let resp = response(serde_json::json!({
            "data": [
                {"index": 1, "embedding": [1.0, 1.0]},
                {"index": 0, "embedding": [0.0, 0.0]}
            ]
        }));
        let vectors = into_vectors(resp, 2, 2).unwrap();
        assert_eq!(vectors, vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
    }

    #[test]
    fn count_mismatch_is_an_error() {
        let resp = response(serde_json::json!({"data": [{"index": 0, "embedding": [0.0]}]}));
        assert!(into_vectors(resp, 2, 1).is_err());
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let resp = response(serde_json::json!({"data": [{"index": 0, "embedding": [0.0, 1.0]}]}));
        let err = into_vectors(resp, 1, 3).unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[tokio::test]
    async fn empty_batch_makes_no_request() {
        let embedder = OpenAiEmbedder::new(&EmbeddingConfig {
            url: "http://127.0.0.1:9/v1/embeddings".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
        assert_eq!(embedder.model_name(), "text-embedding-3-small");
    }
}
