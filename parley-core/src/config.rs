use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ParleyConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: u32,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    /// Maximum number of texts sent in one embeddings request.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            max_retries: 3,
            retry_delay_ms: 1000,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub condense_max_tokens: u32,
    pub answer_max_tokens: u32,
    pub request_timeout_seconds: u64,
    pub max_retries: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.0,
            condense_max_tokens: 200,
            answer_max_tokens: 350,
            request_timeout_seconds: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a conversation's chain is rebuilt from scratch.
    pub ttl_hours: i64,
    /// Number of user/assistant pairs injected as chat history.
    pub history_pairs: usize,
    pub sweep_interval_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 12,
            history_pairs: 4,
            sweep_interval_minutes: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub max_file_size_bytes: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub claim_lease_seconds: i64,
    pub default_batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 5 * 1024 * 1024,
            chunk_size: 1000,
            chunk_overlap: 200,
            claim_lease_seconds: 600,
            default_batch_size: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub name: String,
    pub dimensions: u32,
    pub top_k: usize,
    pub max_context_tokens: usize,
    /// 0 disables the background indexing worker.
    pub auto_index_interval_minutes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: "documents".to_string(),
            dimensions: 1536,
            top_k: 3,
            max_context_tokens: 2000,
            auto_index_interval_minutes: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptBackend {
    #[default]
    Postgres,
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PromptConfig {
    pub backend: PromptBackend,
    /// Revision log used by the `file` backend.
    pub file_path: String,
    /// Optional file holding the instruction used before any revision exists.
    pub default_instruction_path: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            backend: PromptBackend::Postgres,
            file_path: "~/.parley/prompt_revisions.jsonl".to_string(),
            default_instruction_path: None,
        }
    }
}

impl PromptConfig {
    pub fn expanded_file_path(&self) -> String {
        shellexpand::tilde(&self.file_path).into_owned()
    }

    /// Read the default instruction file, if configured. A missing file is
    /// reported, an empty one yields `None`.
    pub fn load_default_instruction(&self) -> std::io::Result<Option<String>> {
        let Some(path) = &self.default_instruction_path else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(shellexpand::tilde(path).as_ref())?;
        let text = text.trim().to_string();
        Ok(if text.is_empty() { None } else { Some(text) })
    }
}

impl ParleyConfig {
    /// Load from a TOML file, then apply `PARLEY__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("PARLEY").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
