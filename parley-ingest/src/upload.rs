//! Upload path: validate, extract, persist as unprocessed.

use std::sync::Arc;

use parley_core::error::{ParleyError, Result};
use parley_core::models::ImportedDocument;
use parley_core::store::DocumentStore;

use crate::extract::{extract_text, DocumentFormat};

pub struct Uploader {
    documents: Arc<dyn DocumentStore>,
    max_file_size: usize,
}

impl Uploader {
    pub fn new(documents: Arc<dyn DocumentStore>, max_file_size: usize) -> Self {
        Self {
            documents,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Store the text of an uploaded file. Validation happens before any
    /// parsing; nothing is written when it fails.
    pub async fn ingest(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        declared_extension: &str,
    ) -> Result<ImportedDocument> {
        let format = DocumentFormat::from_extension(declared_extension).ok_or_else(|| {
            ParleyError::validation(format!(
                "unsupported file type '{}': expected pdf, txt or docx",
                declared_extension
            ))
        })?;

        if bytes.len() > self.max_file_size {
            return Err(ParleyError::validation(format!(
                "file is {} bytes, the limit is {} bytes",
                bytes.len(),
                self.max_file_size
            )));
        }

        let size = bytes.len();
        let text = tokio::task::spawn_blocking(move || extract_text(format, &bytes))
            .await
            .map_err(|e| ParleyError::validation(format!("text extraction aborted: {}", e)))??;

        let doc = self.documents.insert_raw(file_name, &text).await?;

        tracing::info!(
            doc_id = %doc.id,
            file_name = %file_name,
            format = format.as_str(),
            bytes = size,
            chars = text.chars().count(),
            "Imported document"
        );
        Ok(doc)
    }
}
