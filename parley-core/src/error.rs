use thiserror::Error;

use crate::embeddings::EmbeddingError;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum ParleyError {
    /// Bad caller input. Rejected before any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Retrieval, index, embedding or generation service failed.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Concurrent creation of a resource that already exists.
    #[error("Resource race: {0}")]
    ResourceRace(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ParleyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Message safe to hand back to a caller. Unclassified failures are
    /// collapsed so internal detail does not leak.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::ExternalService(_) => "Upstream service error".to_string(),
            Self::Database(_) => "Storage unavailable".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl From<EmbeddingError> for ParleyError {
    fn from(e: EmbeddingError) -> Self {
        Self::ExternalService(format!("embedding: {}", e))
    }
}

impl From<LlmError> for ParleyError {
    fn from(e: LlmError) -> Self {
        Self::ExternalService(format!("generation: {}", e))
    }
}

pub type Result<T, E = ParleyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_internal_detail() {
        let err = ParleyError::Other("secret stack trace".to_string());
        assert_eq!(err.public_message(), "Internal server error");

        let err = ParleyError::ExternalService("api key sk-123 rejected".to_string());
        assert!(!err.public_message().contains("sk-123"));
    }

    #[test]
    fn test_validation_message_is_passed_through() {
        let err = ParleyError::validation("conversation_id is empty");
        assert!(err.is_validation());
        assert_eq!(err.public_message(), "conversation_id is empty");
    }

    #[test]
    fn test_llm_error_maps_to_external_service() {
        let err: ParleyError = LlmError::MissingApiKey.into();
        assert!(matches!(err, ParleyError::ExternalService(_)));
    }
}
