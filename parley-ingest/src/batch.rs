//! Batch indexing path: claim unprocessed documents, chunk, embed, index,
//! then flag them processed.

use std::sync::Arc;

use chrono::Duration;
use parley_core::embeddings::EmbeddingBackend;
use parley_core::error::{ParleyError, Result};
use parley_core::index::{validate_index_name, VectorIndex};
use parley_core::models::{ClaimedDocument, IndexedChunk};
use parley_core::store::DocumentStore;
use serde::Serialize;
use uuid::Uuid;

use crate::splitter::RecursiveSplitter;

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub id: Uuid,
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub indexed_ids: Vec<Uuid>,
    pub failed: Vec<FailedDocument>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.indexed_ids.is_empty() && self.failed.is_empty()
    }
}

pub struct Indexer {
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingBackend>,
    splitter: RecursiveSplitter,
    lease: Duration,
}

impl Indexer {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingBackend>,
        splitter: RecursiveSplitter,
        lease: Duration,
    ) -> Self {
        Self {
            documents,
            index,
            embedder,
            splitter,
            lease,
        }
    }

    /// Index up to `limit` unprocessed documents, oldest first. A failing
    /// document is reported and left unprocessed; the others still complete.
    pub async fn process_unprocessed(&self, index_name: &str, limit: usize) -> Result<BatchReport> {
        validate_index_name(index_name)?;
        if limit == 0 {
            return Ok(BatchReport::default());
        }

        self.index.ensure_index(index_name).await?;

        let claimed = self.documents.claim_unprocessed(limit, self.lease).await?;
        if claimed.is_empty() {
            tracing::debug!(index = index_name, "No unprocessed documents");
            return Ok(BatchReport::default());
        }

        tracing::info!(index = index_name, claimed = claimed.len(), "Indexing batch");

        let mut report = BatchReport::default();
        for doc in &claimed {
            match self.index_document(index_name, doc).await {
                Ok(true) => report.indexed_ids.push(doc.document.id),
                Ok(false) => {
                    // Chunks were written but a newer claim now owns the document.
                    tracing::warn!(doc_id = %doc.document.id, "Claim lost before marking processed");
                }
                Err(e) => {
                    tracing::error!(
                        doc_id = %doc.document.id,
                        file_name = %doc.document.file_name,
                        error = %e,
                        "Failed to index document"
                    );
                    if let Err(release_err) = self.documents.release(doc).await {
                        tracing::warn!(
                            doc_id = %doc.document.id,
                            error = %release_err,
                            "Failed to release claim"
                        );
                    }
                    report.failed.push(FailedDocument {
                        id: doc.document.id,
                        file_name: doc.document.file_name.clone(),
                        error: e.public_message(),
                    });
                }
            }
        }

        tracing::info!(
            index = index_name,
            indexed = report.indexed_ids.len(),
            failed = report.failed.len(),
            "Batch complete"
        );
        Ok(report)
    }

    /// Returns whether the processed flag was flipped by this call.
    async fn index_document(&self, index_name: &str, claimed: &ClaimedDocument) -> Result<bool> {
        let doc = &claimed.document;
        let texts = self.splitter.split(&doc.raw_text);

        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_batch(&texts).await?
        };
        if embeddings.len() != texts.len() {
            return Err(ParleyError::ExternalService(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                texts.len()
            )));
        }

        let chunks: Vec<IndexedChunk> = texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| IndexedChunk {
                source_doc_id: doc.id,
                file_name: doc.file_name.clone(),
                chunk_index: i as i32,
                text,
                embedding,
            })
            .collect();

        self.index.upsert_chunks(index_name, doc.id, &chunks).await?;
        tracing::debug!(doc_id = %doc.id, chunks = chunks.len(), "Indexed document");

        self.documents.mark_processed(claimed).await
    }
}
