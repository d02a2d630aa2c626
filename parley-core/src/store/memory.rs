//! In-process store implementations. Nothing here survives a restart; they
//! back the unit tests of the orchestrator and the ingestion pipeline.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{DocumentStore, HistoryStore, PromptStore};
use crate::error::{ParleyError, Result};
use crate::models::{ClaimedDocument, ConversationTurn, ImportedDocument, PromptRevision, Role};

fn poisoned() -> ParleyError {
    ParleyError::Other("in-memory store lock poisoned".to_string())
}

/// Timestamps handed out by a store must be strictly increasing even when the
/// wall clock does not move between two calls.
fn next_timestamp(last: &mut Option<DateTime<Utc>>) -> DateTime<Utc> {
    let mut now = Utc::now();
    if let Some(prev) = *last {
        if now <= prev {
            now = prev + Duration::microseconds(1);
        }
    }
    *last = Some(now);
    now
}

// ============================================================================
// History
// ============================================================================

#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HistoryInner>,
}

#[derive(Default)]
struct HistoryInner {
    turns: HashMap<String, Vec<ConversationTurn>>,
    last_ts: Option<DateTime<Utc>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every turn of a conversation, oldest first.
    pub fn all(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        self.inner
            .lock()
            .map(|inner| inner.turns.get(conversation_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> Result<ConversationTurn> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let created_at = next_timestamp(&mut inner.last_ts);
        let turn = ConversationTurn {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            role,
            text: text.to_string(),
            created_at,
        };
        inner
            .turns
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(turn)
    }

    async fn load_window(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        let turns = inner
            .turns
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Default)]
pub struct InMemoryDocumentStore {
    inner: Mutex<DocumentInner>,
}

#[derive(Default)]
struct DocumentInner {
    docs: Vec<DocumentRow>,
    last_ts: Option<DateTime<Utc>>,
}

struct DocumentRow {
    doc: ImportedDocument,
    claimed_by: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_raw(&self, file_name: &str, raw_text: &str) -> Result<ImportedDocument> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let created_at = next_timestamp(&mut inner.last_ts);
        let doc = ImportedDocument {
            id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            raw_text: raw_text.to_string(),
            is_processed: false,
            created_at,
        };
        inner.docs.push(DocumentRow {
            doc: doc.clone(),
            claimed_by: None,
            claimed_at: None,
        });
        Ok(doc)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImportedDocument>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.docs.iter().find(|r| r.doc.id == id).map(|r| r.doc.clone()))
    }

    async fn claim_unprocessed(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedDocument>> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let claim = Uuid::new_v4();
        let now = Utc::now();

        // Rows are kept in insertion order, which is creation order.
        let claimed = inner
            .docs
            .iter_mut()
            .filter(|r| !r.doc.is_processed)
            .filter(|r| match (r.claimed_by, r.claimed_at) {
                (Some(_), Some(at)) => at < now - lease,
                _ => true,
            })
            .take(limit)
            .map(|r| {
                r.claimed_by = Some(claim);
                r.claimed_at = Some(now);
                ClaimedDocument {
                    document: r.doc.clone(),
                    claim,
                }
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_processed(&self, claimed: &ClaimedDocument) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let Some(row) = inner
            .docs
            .iter_mut()
            .find(|r| r.doc.id == claimed.document.id)
        else {
            return Ok(false);
        };

        if row.doc.is_processed || row.claimed_by != Some(claimed.claim) {
            return Ok(false);
        }

        row.doc.is_processed = true;
        row.claimed_by = None;
        row.claimed_at = None;
        Ok(true)
    }

    async fn release(&self, claimed: &ClaimedDocument) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        if let Some(row) = inner
            .docs
            .iter_mut()
            .find(|r| r.doc.id == claimed.document.id && r.claimed_by == Some(claimed.claim))
        {
            row.claimed_by = None;
            row.claimed_at = None;
        }
        Ok(())
    }

    async fn count_unprocessed(&self) -> Result<i64> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.docs.iter().filter(|r| !r.doc.is_processed).count() as i64)
    }
}

// ============================================================================
// Prompts
// ============================================================================

#[derive(Default)]
pub struct InMemoryPromptStore {
    inner: Mutex<PromptInner>,
}

#[derive(Default)]
struct PromptInner {
    revisions: Vec<PromptRevision>,
    last_ts: Option<DateTime<Utc>>,
}

impl InMemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PromptStore for InMemoryPromptStore {
    async fn latest(&self) -> Result<Option<PromptRevision>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.revisions.last().cloned())
    }

    async fn append(&self, content: &str) -> Result<PromptRevision> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let created_at = next_timestamp(&mut inner.last_ts);
        let revision = PromptRevision {
            id: Uuid::new_v4(),
            content: content.to_string(),
            created_at,
        };
        inner.revisions.push(revision.clone());
        Ok(revision)
    }

    async fn revisions(&self, limit: usize) -> Result<Vec<PromptRevision>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.revisions.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_messages_returns_last_eight_of_ten_in_order() {
        let store = InMemoryHistoryStore::new();
        for i in 0..10 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append("conv-1", role, &format!("turn {}", i)).await.unwrap();
        }

        let window = store.load_messages("conv-1", 4).await.unwrap();
        assert_eq!(window.len(), 8);
        let texts: Vec<&str> = window.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["turn 2", "turn 3", "turn 4", "turn 5", "turn 6", "turn 7", "turn 8", "turn 9"]
        );
        assert!(window.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn test_history_is_isolated_per_conversation() {
        let store = InMemoryHistoryStore::new();
        store.append("a", Role::User, "hello").await.unwrap();
        store.append("b", Role::User, "other").await.unwrap();

        let window = store.load_window("a", 10).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].text, "hello");
        assert!(store.load_window("missing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = InMemoryDocumentStore::new();
        store.insert_raw("a.txt", "alpha").await.unwrap();
        store.insert_raw("b.txt", "beta").await.unwrap();

        let first = store.claim_unprocessed(10, Duration::minutes(10)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].document.file_name, "a.txt");

        let second = store.claim_unprocessed(10, Duration::minutes(10)).await.unwrap();
        assert!(second.is_empty(), "claimed documents must not be handed out twice");

        store.release(&first[1]).await.unwrap();
        let third = store.claim_unprocessed(10, Duration::minutes(10)).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].document.file_name, "b.txt");
    }

    #[tokio::test]
    async fn test_mark_processed_requires_current_claim() {
        let store = InMemoryDocumentStore::new();
        store.insert_raw("a.txt", "alpha").await.unwrap();

        let claimed = store.claim_unprocessed(1, Duration::minutes(10)).await.unwrap();
        let mut stale = claimed[0].clone();
        stale.claim = Uuid::new_v4();

        assert!(!store.mark_processed(&stale).await.unwrap());
        assert!(store.mark_processed(&claimed[0]).await.unwrap());
        assert!(!store.mark_processed(&claimed[0]).await.unwrap(), "flag flips once");
        assert_eq!(store.count_unprocessed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let store = InMemoryDocumentStore::new();
        store.insert_raw("a.txt", "alpha").await.unwrap();

        let first = store.claim_unprocessed(1, Duration::minutes(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        // A negative lease treats every existing claim as abandoned.
        let second = store.claim_unprocessed(1, Duration::seconds(-1)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(!store.mark_processed(&first[0]).await.unwrap());
        assert!(store.mark_processed(&second[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_prompt_is_last_appended() {
        let store = InMemoryPromptStore::new();
        assert!(store.latest().await.unwrap().is_none());

        store.append("v1").await.unwrap();
        store.append("v2").await.unwrap();
        store.append("v1").await.unwrap();

        assert_eq!(store.latest().await.unwrap().unwrap().content, "v1");
        let revisions = store.revisions(2).await.unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[1].content, "v2");
    }
}
