use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chunk of a document, ready to be written to a vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub source_doc_id: Uuid,
    pub file_name: String,
    pub chunk_index: i32,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A chunk returned by a similarity search.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Passage {
    pub source_doc_id: Uuid,
    pub file_name: String,
    pub chunk_index: i32,
    pub text: String,
    pub score: f64,
}
