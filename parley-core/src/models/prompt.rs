use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromptRevision {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
