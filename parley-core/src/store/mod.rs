//! Durable stores behind narrow traits.
//!
//! The orchestrator and the ingestion pipeline only see these traits. The
//! Postgres implementations are used in production, the in-memory ones by
//! tests, and the prompt store can alternatively be backed by a revision file.

pub mod memory;
pub mod postgres;
pub mod prompt_file;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ClaimedDocument, ConversationTurn, ImportedDocument, PromptRevision, Role};

pub use memory::{InMemoryDocumentStore, InMemoryHistoryStore, InMemoryPromptStore};
pub use postgres::{PgDocumentStore, PgHistoryStore, PgPromptStore};
pub use prompt_file::FilePromptStore;

/// Append-only per-conversation log of turns.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a turn at the end of the conversation, creating the
    /// conversation on first use.
    async fn append(&self, conversation_id: &str, role: Role, text: &str)
        -> Result<ConversationTurn>;

    /// The last `limit` turns of a conversation in chronological order.
    async fn load_window(&self, conversation_id: &str, limit: usize)
        -> Result<Vec<ConversationTurn>>;

    /// The last `k` user/assistant pairs (at most `2k` turns).
    async fn load_messages(&self, conversation_id: &str, k: usize) -> Result<Vec<ConversationTurn>> {
        self.load_window(conversation_id, k * 2).await
    }
}

/// Raw uploaded documents with a processed flag.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_raw(&self, file_name: &str, raw_text: &str) -> Result<ImportedDocument>;

    async fn get(&self, id: Uuid) -> Result<Option<ImportedDocument>>;

    /// Atomically claim up to `limit` unprocessed documents, oldest first.
    /// Documents claimed by another runner less than `lease` ago are skipped.
    async fn claim_unprocessed(&self, limit: usize, lease: Duration) -> Result<Vec<ClaimedDocument>>;

    /// Flip `is_processed` if the claim is still held. Returns false when the
    /// claim was lost or the document was already processed.
    async fn mark_processed(&self, claimed: &ClaimedDocument) -> Result<bool>;

    /// Give a claim back so the document can be retried.
    async fn release(&self, claimed: &ClaimedDocument) -> Result<()>;

    async fn count_unprocessed(&self) -> Result<i64>;
}

/// Append-only instruction template revisions.
#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn latest(&self) -> Result<Option<PromptRevision>>;

    async fn append(&self, content: &str) -> Result<PromptRevision>;

    /// Most recent revisions first.
    async fn revisions(&self, limit: usize) -> Result<Vec<PromptRevision>>;
}
