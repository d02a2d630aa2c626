//! Retrieval over a named vector index.

use std::sync::Arc;

use async_trait::async_trait;

use crate::embeddings::EmbeddingBackend;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::models::Passage;

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Passages relevant to `query`, most relevant first.
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>>;
}

/// Embeds the query and runs a top-k similarity search.
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingBackend>,
    index_name: String,
    top_k: usize,
}

impl VectorRetriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingBackend>,
        index_name: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            index_name: index_name.into(),
            top_k,
        }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>> {
        let query_vec = self.embedder.embed_query(query).await?;
        let passages = self
            .index
            .search(&self.index_name, &query_vec, self.top_k)
            .await?;

        tracing::debug!(
            index = %self.index_name,
            hits = passages.len(),
            top_score = passages.first().map(|p| p.score).unwrap_or(0.0),
            "Retrieved passages"
        );
        Ok(passages)
    }
}

/// Hands out retrievers for the configured index, if it is usable.
#[derive(Clone)]
pub struct KnowledgeBase {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingBackend>,
    index_name: String,
    top_k: usize,
}

impl KnowledgeBase {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingBackend>,
        index_name: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            index_name: index_name.into(),
            top_k,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// A retriever over the index, or `None` when the index does not exist
    /// yet or the index service cannot be reached.
    pub async fn retriever(&self) -> Option<Arc<dyn Retriever>> {
        match self.index.exists(&self.index_name).await {
            Ok(true) => Some(Arc::new(VectorRetriever::new(
                self.index.clone(),
                self.embedder.clone(),
                self.index_name.clone(),
                self.top_k,
            ))),
            Ok(false) => {
                tracing::info!(index = %self.index_name, "Vector index not created yet");
                None
            }
            Err(e) => {
                tracing::warn!(index = %self.index_name, error = %e, "Vector index unavailable");
                None
            }
        }
    }
}
