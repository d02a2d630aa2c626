use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImportedDocument {
    pub id: Uuid,
    pub file_name: String,
    pub raw_text: String,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
}

/// A document a batch runner holds an exclusive claim on. The claim token
/// must match for the processed flag to be flipped.
#[derive(Debug, Clone)]
pub struct ClaimedDocument {
    pub document: ImportedDocument,
    pub claim: Uuid,
}
