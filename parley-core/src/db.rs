use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn check_pgvector(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) =
        sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'vector'")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

const SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS vector",
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        started_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversation_turns (
        id              UUID PRIMARY KEY,
        seq             BIGSERIAL,
        conversation_id TEXT NOT NULL REFERENCES conversations (conversation_id),
        role            TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
        text            TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS conversation_turns_conversation_idx
        ON conversation_turns (conversation_id, created_at, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS imported_documents (
        id           UUID PRIMARY KEY,
        file_name    TEXT NOT NULL,
        raw_text     TEXT NOT NULL,
        is_processed BOOLEAN NOT NULL DEFAULT false,
        claimed_by   UUID,
        claimed_at   TIMESTAMPTZ,
        processed_at TIMESTAMPTZ,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS imported_documents_unprocessed_idx
        ON imported_documents (created_at)
        WHERE is_processed = false
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prompt_revisions (
        id         UUID PRIMARY KEY,
        seq        BIGSERIAL,
        content    TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
    )
    "#,
];

/// Create the tables the stores rely on. Safe to run on every startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema ready");
    Ok(())
}
