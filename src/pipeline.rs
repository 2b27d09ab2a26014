//! Content pipeline: file bytes in, indexed chunks out.
//!
//! The content consumer only knows the [`ContentPipeline`] trait. The
//! default [`EmbeddingPipeline`] runs extract → chunk → embed → upsert:
//!
//! ```text
//! temp file ──▶ extract ──▶ chunk_text ──▶ Embedder (batched) ──▶ IndexClient::upsert_chunks
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::chunk::chunk_text;
use crate::config::PipelineConfig;
use crate::embedding::{Embedder, OpenAiEmbedder};
use crate::error::{SyncError, SyncResult};
use crate::extract::{detect_content_type, extract_text};
use crate::index::{ChunkMetadata, ChunkPoint, IndexClient};

#[async_trait]
pub trait ContentPipeline: Send + Sync {
    /// Indexes the local copy of a file. Returns the number of chunks written.
    ///
    /// Must replace any chunks previously written for `meta.file_id`, so
    /// running it twice on the same input is a no-op the second time.
    async fn process(&self, file: &Path, meta: &ChunkMetadata) -> SyncResult<usize>;
}

pub struct EmbeddingPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn IndexClient>,
    max_tokens: usize,
    batch_size: usize,
}

impl EmbeddingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn IndexClient>,
        max_tokens: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            max_tokens,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig, index: Arc<dyn IndexClient>) -> Result<Self> {
        let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding)?);
        Ok(Self::new(
            embedder,
            index,
            config.max_tokens,
            config.embedding.batch_size,
        ))
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }
}

#[async_trait]
impl ContentPipeline for EmbeddingPipeline {
    async fn process(&self, file: &Path, meta: &ChunkMetadata) -> SyncResult<usize> {
        let file_id = meta.file_id.as_str();
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| SyncError::pipeline(file_id, format!("read temp file: {}", e)))?;

        let content_type = detect_content_type(&meta.path);
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, content_type))
            .await
            .map_err(|e| SyncError::pipeline(file_id, format!("extractor panicked: {}", e)))?
            .map_err(|e| SyncError::pipeline(file_id, e))?;

        let chunks = chunk_text(&text, self.max_tokens);
        let mut points = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| SyncError::pipeline(file_id, format!("{:#}", e)))?;

            points.extend(batch.iter().zip(vectors).map(|(chunk, vector)| ChunkPoint {
                index: chunk.index,
                text: chunk.text.clone(),
                vector,
            }));
        }

        self.index.upsert_chunks(meta, &points).await?;

        debug!(
            file_id,
            path = %meta.path,
            content_type,
            chunks = points.len(),
            model = self.embedder.model_name(),
            "file indexed"
        );
        Ok(points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::InMemoryIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::io::Write;

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn meta(path: &str) -> ChunkMetadata {
        ChunkMetadata {
            file_id: "42".into(),
            path: path.into(),
            fingerprint: Some("e1".into()),
        }
    }

    fn temp_with(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn text_file_is_chunked_embedded_and_upserted() {
        let index = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let pipeline = EmbeddingPipeline::new(embedder.clone(), index.clone(), 5, 2);

        let body = (0..5).map(|i| format!("Paragraph {}.", i)).collect::<Vec<_>>().join("\n\n");
        let file = temp_with(&body);
        let n = pipeline.process(file.path(), &meta("notes.txt")).await.unwrap();

        assert_eq!(n, 5);
        assert_eq!(index.chunks("42").len(), 5);
        // batches of 2: 2 + 2 + 1
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(index.chunks("42")[0].payload["etag"], "e1");
    }

    #[tokio::test]
    async fn empty_file_clears_previous_chunks() {
        let index = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let pipeline = EmbeddingPipeline::new(embedder, index.clone(), 200, 8);

        pipeline.process(temp_with("hello").path(), &meta("a.txt")).await.unwrap();
        assert_eq!(index.chunks("42").len(), 1);

        let n = pipeline.process(temp_with("  ").path(), &meta("a.txt")).await.unwrap();
        assert_eq!(n, 0);
        assert!(index.chunks("42").is_empty());
    }

    #[tokio::test]
    async fn broken_pdf_is_a_pipeline_error() {
        let index = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let pipeline = EmbeddingPipeline::new(embedder, index, 200, 8);

        let err = pipeline
            .process(temp_with("not a pdf").path(), &meta("a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Pipeline { .. }));
    }
}
