pub mod chain;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod response;
pub mod retriever;
pub mod store;

pub use chain::{Chain, ChainBuilder};
pub use config::ParleyConfig;
pub use embeddings::{
    EmbeddingBackend, EmbeddingClientConfig, EmbeddingError, OpenAIEmbeddingClient,
    OPENAI_DIMENSIONS,
};
pub use error::{ParleyError, Result};
pub use index::{MemoryVectorIndex, PgVectorIndex, VectorIndex};
pub use llm::{ChatClientConfig, CompletionBackend, LlmError, OpenAIChatClient, PromptMessage, TokenStream};
pub use response::ApiResponse;
pub use retriever::{KnowledgeBase, Retriever, VectorRetriever};
