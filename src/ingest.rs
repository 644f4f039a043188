//! File processing: stored upload → processed document → chunks.
//!
//! This is the `file_processing` task. It reads the stored bytes, runs the
//! format processor registered for the file's type, chunks the result,
//! and replaces the file's chunks in one store call. File metadata is
//! enriched with the processor's metadata, the heading outline, and
//! chunk statistics.
//!
//! The resume cursor is a stage name: `stored` once the bytes were read
//! and processed, `chunked` once chunks are persisted. A re-queued task
//! that already reached `chunked` finishes without redoing work.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use easy_dataset_core::chunk::{chunk_document, ChunkerConfig};
use easy_dataset_core::document::ProcessedDocument;
use easy_dataset_core::models::UploadFile;
use easy_dataset_core::store::Store;
use easy_dataset_core::{PipelineError, PipelineResult};

use crate::processors::ProcessorRegistry;
use crate::tasks::{TaskContext, TaskHandler};

pub const STAGE_STORED: &str = "stored";
pub const STAGE_CHUNKED: &str = "chunked";

/// Payload of a `file_processing` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProcessingParams {
    pub file_id: String,
    /// Overrides the configured chunker settings for this run.
    #[serde(default)]
    pub chunking: Option<ChunkerConfig>,
}

/// What one processing run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub file_id: String,
    pub chunks: usize,
    pub characters: usize,
    pub tokens: usize,
}

#[derive(Clone)]
pub struct FileProcessor {
    store: Arc<dyn Store>,
    registry: Arc<ProcessorRegistry>,
    chunking: ChunkerConfig,
}

impl FileProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProcessorRegistry>,
        chunking: ChunkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            chunking,
        }
    }

    async fn file(&self, file_id: &str) -> PipelineResult<UploadFile> {
        self.store
            .get_file(file_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("file", file_id))
    }

    /// Extract a stored upload. Runs the processor on the blocking pool.
    pub async fn extract(&self, file: &UploadFile) -> PipelineResult<ProcessedDocument> {
        let bytes = tokio::fs::read(&file.stored_path).await?;
        let registry = self.registry.clone();
        let tag = file.file_type.clone();
        let name = file.file_name.clone();
        let doc = tokio::task::spawn_blocking(move || registry.process(&tag, &bytes, &name))
            .await
            .map_err(|e| PipelineError::Storage(format!("processor panicked: {}", e)))??;
        debug!(file_id = %file.id, bytes = doc.len(), hints = doc.hints.len(), "extracted document");
        Ok(doc)
    }

    /// Chunk an extracted document and persist the chunks and metadata.
    pub async fn chunk_and_store(
        &self,
        file: &UploadFile,
        doc: &ProcessedDocument,
        cfg: &ChunkerConfig,
    ) -> PipelineResult<ProcessSummary> {
        let stem = Path::new(&file.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&file.file_name);
        let chunks = chunk_document(&file.project_id, &file.id, stem, doc, cfg)?;
        self.store.replace_chunks(&file.id, &chunks).await?;

        let summary = ProcessSummary {
            file_id: file.id.clone(),
            chunks: chunks.len(),
            characters: doc.text.chars().count(),
            tokens: chunks.iter().map(|c| c.token_estimate).sum(),
        };
        let metadata = enrich_metadata(&file.metadata, doc, &summary);
        self.store.update_file_metadata(&file.id, &metadata).await?;
        info!(
            file_id = %file.id,
            name = %file.file_name,
            chunks = summary.chunks,
            "processed file"
        );
        Ok(summary)
    }

    /// Extract and chunk in one go, outside the task engine.
    pub async fn process(
        &self,
        file_id: &str,
        chunking: Option<&ChunkerConfig>,
    ) -> PipelineResult<ProcessSummary> {
        let file = self.file(file_id).await?;
        let doc = self.extract(&file).await?;
        self.chunk_and_store(&file, &doc, chunking.unwrap_or(&self.chunking))
            .await
    }
}

fn enrich_metadata(existing: &Value, doc: &ProcessedDocument, summary: &ProcessSummary) -> Value {
    let mut map = existing.as_object().cloned().unwrap_or_default();
    for (k, v) in &doc.metadata {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    map.insert("toc".to_string(), json!(doc.toc()));
    map.insert("chunk_count".to_string(), json!(summary.chunks));
    map.insert("characters".to_string(), json!(summary.characters));
    map.insert("token_estimate".to_string(), json!(summary.tokens));
    Value::Object(map)
}

#[async_trait]
impl TaskHandler for FileProcessor {
    async fn run(&self, ctx: &mut TaskContext) -> PipelineResult<Value> {
        let params: FileProcessingParams = ctx.params()?;
        let cfg = params.chunking.unwrap_or_else(|| self.chunking.clone());
        cfg.validate()?;
        let file = self.file(&params.file_id).await?;
        ctx.set_total(2).await?;

        if ctx.resume_stage() == Some(STAGE_CHUNKED) {
            let chunks = self.store.list_chunks(&file.id).await?;
            info!(file_id = %file.id, "file already chunked, nothing to resume");
            ctx.set_completed(2);
            let summary = ProcessSummary {
                file_id: file.id,
                chunks: chunks.len(),
                characters: chunks.iter().map(|c| c.body().chars().count()).sum(),
                tokens: chunks.iter().map(|c| c.token_estimate).sum(),
            };
            return Ok(serde_json::to_value(summary)?);
        }

        ctx.checkpoint().await?;
        let doc = self.extract(&file).await?;
        ctx.set_completed(0);
        ctx.advance(STAGE_STORED).await?;

        ctx.checkpoint().await?;
        let summary = self.chunk_and_store(&file, &doc, &cfg).await?;
        ctx.advance(STAGE_CHUNKED).await?;
        Ok(serde_json::to_value(summary)?)
    }
}
