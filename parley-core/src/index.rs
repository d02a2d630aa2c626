//! Named vector indexes of document chunks
//!
//! Each index is its own pgvector table (`kb_<name>`). Creation is
//! idempotent and safe against a concurrent creator; upserts are keyed by
//! `(source_doc_id, chunk_index)` so re-indexing a document replaces its
//! chunks instead of duplicating them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pgvector::Vector;
use regex::Regex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ParleyError, Result};
use crate::models::{IndexedChunk, Passage};

const INDEX_NAME_PATTERN: &str = r"^[a-z][a-z0-9_]{0,47}$";

/// Postgres error codes raised when two creators race on the same relation.
const DUPLICATE_TABLE: &str = "42P07";
const UNIQUE_VIOLATION: &str = "23505";

/// Reject names that cannot be used as part of a table identifier.
pub fn validate_index_name(name: &str) -> Result<()> {
    let re = Regex::new(INDEX_NAME_PATTERN)
        .map_err(|e| ParleyError::Other(format!("index name pattern: {}", e)))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ParleyError::validation(format!(
            "invalid index name '{}': use lowercase letters, digits and '_', starting with a letter",
            name
        )))
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Create the index if missing. Losing a creation race is not an error.
    async fn ensure_index(&self, name: &str) -> Result<()>;

    /// Replace the chunks of one document.
    async fn upsert_chunks(&self, name: &str, doc_id: Uuid, chunks: &[IndexedChunk]) -> Result<()>;

    /// The `k` chunks closest to `query`, best first.
    async fn search(&self, name: &str, query: &[f32], k: usize) -> Result<Vec<Passage>>;
}

// ============================================================================
// pgvector
// ============================================================================

#[derive(Clone)]
pub struct PgVectorIndex {
    pool: PgPool,
    dimensions: usize,
}

impl PgVectorIndex {
    pub fn new(pool: PgPool, dimensions: usize) -> Self {
        Self { pool, dimensions }
    }

    fn table(name: &str) -> Result<String> {
        validate_index_name(name)?;
        Ok(format!("kb_{}", name))
    }

    async fn create(&self, table: &str) -> Result<()> {
        self.create_tables(table).await.map_err(creation_error)
    }

    async fn create_tables(&self, table: &str) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE {table} (
                id            BIGSERIAL PRIMARY KEY,
                source_doc_id UUID NOT NULL,
                file_name     TEXT NOT NULL,
                chunk_index   INTEGER NOT NULL,
                text          TEXT NOT NULL,
                embedding     vector({dim}) NOT NULL,
                UNIQUE (source_doc_id, chunk_index)
            )
            "#,
            table = table,
            dim = self.dimensions
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX {table}_embedding_idx ON {table} USING hnsw (embedding vector_cosine_ops)",
            table = table
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }
}

/// A concurrent creator got there first: `ResourceRace`. Anything else
/// stays a database error.
fn creation_error(e: sqlx::Error) -> ParleyError {
    let raced = match &e {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(DUPLICATE_TABLE) | Some(UNIQUE_VIOLATION)
        ),
        _ => false,
    };
    if raced {
        ParleyError::ResourceRace(e.to_string())
    } else {
        ParleyError::Database(e)
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn exists(&self, name: &str) -> Result<bool> {
        let table = Self::table(name)?;
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&table)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn ensure_index(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            return Ok(());
        }
        let table = Self::table(name)?;

        match self.create(&table).await {
            Ok(()) => {
                tracing::info!(index = name, dimensions = self.dimensions, "Created vector index");
                Ok(())
            }
            Err(ParleyError::ResourceRace(detail)) => {
                tracing::debug!(index = name, error = %detail, "Vector index created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert_chunks(&self, name: &str, doc_id: Uuid, chunks: &[IndexedChunk]) -> Result<()> {
        let table = Self::table(name)?;
        let mut tx = self.pool.begin().await?;

        let upsert = format!(
            r#"
            INSERT INTO {table} (source_doc_id, file_name, chunk_index, text, embedding)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_doc_id, chunk_index)
            DO UPDATE SET file_name = EXCLUDED.file_name,
                          text = EXCLUDED.text,
                          embedding = EXCLUDED.embedding
            "#,
            table = table
        );

        for chunk in chunks {
            if chunk.embedding.len() != self.dimensions {
                return Err(ParleyError::ExternalService(format!(
                    "chunk {} of {} has {} dimensions, index expects {}",
                    chunk.chunk_index,
                    doc_id,
                    chunk.embedding.len(),
                    self.dimensions
                )));
            }
            sqlx::query(&upsert)
                .bind(doc_id)
                .bind(&chunk.file_name)
                .bind(chunk.chunk_index)
                .bind(&chunk.text)
                .bind(Vector::from(chunk.embedding.clone()))
                .execute(&mut *tx)
                .await?;
        }

        // A shorter re-split leaves stale trailing chunks behind.
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE source_doc_id = $1 AND chunk_index >= $2",
            table = table
        ))
        .bind(doc_id)
        .bind(chunks.len() as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(index = name, doc_id = %doc_id, chunks = chunks.len(), "Upserted chunks");
        Ok(())
    }

    async fn search(&self, name: &str, query: &[f32], k: usize) -> Result<Vec<Passage>> {
        let table = Self::table(name)?;
        let vector = Vector::from(query.to_vec());

        let passages = sqlx::query_as::<_, Passage>(&format!(
            r#"
            SELECT source_doc_id, file_name, chunk_index, text,
                   1 - (embedding <=> $1::vector) AS score
            FROM {table}
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
            table = table
        ))
        .bind(&vector)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(passages)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Brute-force cosine index, for tests and local runs without pgvector.
#[derive(Default)]
pub struct MemoryVectorIndex {
    indexes: Mutex<HashMap<String, Vec<IndexedChunk>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks stored in an index.
    pub fn chunk_count(&self, name: &str) -> usize {
        self.indexes
            .lock()
            .ok()
            .and_then(|m| m.get(name).map(Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<IndexedChunk>>>> {
        self.indexes
            .lock()
            .map_err(|_| ParleyError::Other("vector index lock poisoned".to_string()))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn exists(&self, name: &str) -> Result<bool> {
        validate_index_name(name)?;
        Ok(self.lock()?.contains_key(name))
    }

    async fn ensure_index(&self, name: &str) -> Result<()> {
        validate_index_name(name)?;
        self.lock()?.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn upsert_chunks(&self, name: &str, doc_id: Uuid, chunks: &[IndexedChunk]) -> Result<()> {
        validate_index_name(name)?;
        let mut indexes = self.lock()?;
        let Some(rows) = indexes.get_mut(name) else {
            return Err(ParleyError::ExternalService(format!("index '{}' does not exist", name)));
        };
        rows.retain(|c| c.source_doc_id != doc_id);
        rows.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn search(&self, name: &str, query: &[f32], k: usize) -> Result<Vec<Passage>> {
        validate_index_name(name)?;
        let indexes = self.lock()?;
        let Some(rows) = indexes.get(name) else {
            return Err(ParleyError::ExternalService(format!("index '{}' does not exist", name)));
        };

        let mut scored: Vec<Passage> = rows
            .iter()
            .map(|c| Passage {
                source_doc_id: c.source_doc_id,
                file_name: c.file_name.clone(),
                chunk_index: c.chunk_index,
                text: c.text.clone(),
                score: cosine(&c.embedding, query),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: Uuid, idx: i32, text: &str, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            source_doc_id: doc,
            file_name: "doc.txt".to_string(),
            chunk_index: idx,
            text: text.to_string(),
            embedding,
        }
    }

    #[derive(Debug)]
    struct SqlState(&'static str);

    impl std::fmt::Display for SqlState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for SqlState {}

    impl sqlx::error::DatabaseError for SqlState {
        fn message(&self) -> &str {
            "relation already exists"
        }
        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(std::borrow::Cow::Borrowed(self.0))
        }
        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }
        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }
        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }
        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    #[test]
    fn test_creation_races_are_classified() {
        for code in [DUPLICATE_TABLE, UNIQUE_VIOLATION] {
            let err = creation_error(sqlx::Error::Database(Box::new(SqlState(code))));
            assert!(matches!(err, ParleyError::ResourceRace(_)), "{} is a race", code);
        }

        let err = creation_error(sqlx::Error::Database(Box::new(SqlState("42501"))));
        assert!(matches!(err, ParleyError::Database(_)));
        assert!(matches!(creation_error(sqlx::Error::PoolTimedOut), ParleyError::Database(_)));
    }

    #[test]
    fn test_index_name_validation() {
        assert!(validate_index_name("documents").is_ok());
        assert!(validate_index_name("faq_v2").is_ok());
        assert!(validate_index_name("").unwrap_err().is_validation());
        assert!(validate_index_name("2fast").is_err());
        assert!(validate_index_name("Docs").is_err());
        assert!(validate_index_name("docs; DROP TABLE x").is_err());
        assert!(validate_index_name(&"a".repeat(49)).is_err());
    }

    #[tokio::test]
    async fn test_memory_index_ranks_by_cosine() {
        let index = MemoryVectorIndex::new();
        index.ensure_index("kb").await.unwrap();
        let doc = Uuid::new_v4();
        index
            .upsert_chunks(
                "kb",
                doc,
                &[
                    chunk(doc, 0, "north", vec![0.0, 1.0]),
                    chunk(doc, 1, "east", vec![1.0, 0.0]),
                    chunk(doc, 2, "north-east", vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index.search("kb", &[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "east");
        assert_eq!(hits[1].text, "north-east");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_memory_upsert_replaces_document_chunks() {
        let index = MemoryVectorIndex::new();
        index.ensure_index("kb").await.unwrap();
        let doc = Uuid::new_v4();

        let three: Vec<IndexedChunk> =
            (0..3).map(|i| chunk(doc, i, "v1", vec![1.0, 0.0])).collect();
        index.upsert_chunks("kb", doc, &three).await.unwrap();
        index
            .upsert_chunks("kb", doc, &[chunk(doc, 0, "v2", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(index.chunk_count("kb"), 1);
        assert!(!index.exists("other").await.unwrap());
        assert!(index.search("other", &[1.0, 0.0], 1).await.is_err());
    }
}
