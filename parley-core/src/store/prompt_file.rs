//! Prompt revisions kept in a JSON-lines file, one revision per line. The last
//! line is the current revision.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::PromptStore;
use crate::error::{ParleyError, Result};
use crate::models::PromptRevision;

pub struct FilePromptStore {
    path: PathBuf,
    // Serializes appends from this process.
    write_lock: Mutex<()>,
}

impl FilePromptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<PromptRevision>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut revisions = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PromptRevision>(line) {
                Ok(rev) => revisions.push(rev),
                Err(e) => {
                    // A torn final write should not hide earlier revisions.
                    tracing::warn!(
                        path = %self.path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable prompt revision"
                    );
                }
            }
        }
        Ok(revisions)
    }
}

#[async_trait]
impl PromptStore for FilePromptStore {
    async fn latest(&self) -> Result<Option<PromptRevision>> {
        Ok(self.read_all().await?.pop())
    }

    async fn append(&self, content: &str) -> Result<PromptRevision> {
        let revision = PromptRevision {
            id: Uuid::new_v4(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&revision)
            .map_err(|e| ParleyError::Other(format!("encode prompt revision: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::info!(
            revision_id = %revision.id,
            path = %self.path.display(),
            "Stored prompt revision"
        );
        Ok(revision)
    }

    async fn revisions(&self, limit: usize) -> Result<Vec<PromptRevision>> {
        let mut all = self.read_all().await?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }
}
