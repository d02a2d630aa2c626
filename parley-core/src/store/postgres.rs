use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{DocumentStore, HistoryStore, PromptStore};
use crate::error::{ParleyError, Result};
use crate::models::{ClaimedDocument, ConversationTurn, ImportedDocument, PromptRevision, Role};

// ============================================================================
// History
// ============================================================================

#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    id: Uuid,
    conversation_id: String,
    role: String,
    text: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TurnRow> for ConversationTurn {
    type Error = ParleyError;

    fn try_from(row: TurnRow) -> Result<Self> {
        let role = row.role.parse::<Role>().map_err(ParleyError::Other)?;
        Ok(ConversationTurn {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            text: row.text,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> Result<ConversationTurn> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversations (conversation_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        let row: TurnRow = sqlx::query_as(
            r#"
            INSERT INTO conversation_turns (id, conversation_id, role, text)
            VALUES ($1, $2, $3, $4)
            RETURNING id, conversation_id, role, text, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(text)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(conversation_id, role = %role, turn_id = %row.id, "Appended turn");
        row.try_into()
    }

    async fn load_window(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<TurnRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, role, text, created_at
            FROM (
                SELECT id, conversation_id, role, text, created_at, seq
                FROM conversation_turns
                WHERE conversation_id = $1
                ORDER BY created_at DESC, seq DESC
                LIMIT $2
            ) recent
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConversationTurn::try_from).collect()
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert_raw(&self, file_name: &str, raw_text: &str) -> Result<ImportedDocument> {
        let doc: ImportedDocument = sqlx::query_as(
            r#"
            INSERT INTO imported_documents (id, file_name, raw_text)
            VALUES ($1, $2, $3)
            RETURNING id, file_name, raw_text, is_processed, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(file_name)
        .bind(raw_text)
        .fetch_one(&self.pool)
        .await?;

        Ok(doc)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImportedDocument>> {
        let doc = sqlx::query_as(
            "SELECT id, file_name, raw_text, is_processed, created_at
             FROM imported_documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(doc)
    }

    async fn claim_unprocessed(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedDocument>> {
        let claim = Uuid::new_v4();
        let stale_before = Utc::now() - lease;

        // One statement: rows locked by a concurrent runner are skipped, so two
        // runners never receive the same document.
        let mut docs: Vec<ImportedDocument> = sqlx::query_as(
            r#"
            UPDATE imported_documents
            SET claimed_by = $1, claimed_at = now()
            WHERE id IN (
                SELECT id FROM imported_documents
                WHERE is_processed = false
                  AND (claimed_by IS NULL OR claimed_at < $2)
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, file_name, raw_text, is_processed, created_at
            "#,
        )
        .bind(claim)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        docs.sort_by_key(|d| d.created_at);

        Ok(docs
            .into_iter()
            .map(|document| ClaimedDocument { document, claim })
            .collect())
    }

    async fn mark_processed(&self, claimed: &ClaimedDocument) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE imported_documents
            SET is_processed = true, processed_at = now(), claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND is_processed = false
            "#,
        )
        .bind(claimed.document.id)
        .bind(claimed.claim)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, claimed: &ClaimedDocument) -> Result<()> {
        sqlx::query(
            "UPDATE imported_documents SET claimed_by = NULL, claimed_at = NULL
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(claimed.document.id)
        .bind(claimed.claim)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_unprocessed(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM imported_documents WHERE is_processed = false",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

// ============================================================================
// Prompts
// ============================================================================

#[derive(Clone)]
pub struct PgPromptStore {
    pool: PgPool,
}

impl PgPromptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromptStore for PgPromptStore {
    async fn latest(&self) -> Result<Option<PromptRevision>> {
        let revision = sqlx::query_as(
            "SELECT id, content, created_at FROM prompt_revisions
             ORDER BY created_at DESC, seq DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(revision)
    }

    async fn append(&self, content: &str) -> Result<PromptRevision> {
        let revision: PromptRevision = sqlx::query_as(
            "INSERT INTO prompt_revisions (id, content) VALUES ($1, $2)
             RETURNING id, content, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(revision_id = %revision.id, "Stored prompt revision");
        Ok(revision)
    }

    async fn revisions(&self, limit: usize) -> Result<Vec<PromptRevision>> {
        let revisions = sqlx::query_as(
            "SELECT id, content, created_at FROM prompt_revisions
             ORDER BY created_at DESC, seq DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(revisions)
    }
}
