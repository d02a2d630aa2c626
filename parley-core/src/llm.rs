//! Chat completion client for Parley
//!
//! `CompletionBackend` is the seam the chain talks to. `OpenAIChatClient`
//! implements it against an OpenAI-compatible `/chat/completions` endpoint,
//! both as a single JSON response and as a server-sent event stream of token
//! deltas.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::LlmConfig;

/// Token deltas in arrival order. Ends after the last token or the first error.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

// ============================================================================
// CompletionBackend trait
// ============================================================================

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Full completion as one string.
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, LlmError>;

    /// Completion as a stream of token deltas. Errors before the first token
    /// are returned directly; later ones arrive as stream items.
    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, LlmError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },

    #[error("Malformed response: {0}")]
    ResponseFormat(String),
}

// ============================================================================
// Client configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ChatClientConfig {
    /// Build from the `[llm]` section with a role-specific token cap. The key
    /// falls back to `OPENAI_API_KEY`.
    pub fn from_settings(settings: &LlmConfig, max_tokens: u32, api_key: Option<String>) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens,
            request_timeout: Duration::from_secs(settings.request_timeout_seconds),
            max_retries: settings.max_retries,
            retry_delay_ms: 500,
        }
    }
}

// ============================================================================
// OpenAI API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// SSE decoding
// ============================================================================

#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
}

/// Incremental decoder for `data: ...` lines. Bytes are buffered until a full
/// line is available so multi-byte characters split across chunks survive.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, LlmError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = Self::decode_line(&line)? {
                let done = event == SseEvent::Done;
                events.push(event);
                if done {
                    self.buf.clear();
                    break;
                }
            }
        }

        Ok(events)
    }

    /// Whatever is left once the body ends without a trailing newline.
    fn finish(&mut self) -> Result<Vec<SseEvent>, LlmError> {
        let rest = std::mem::take(&mut self.buf);
        Ok(Self::decode_line(&rest)?.into_iter().collect())
    }

    fn decode_line(line: &[u8]) -> Result<Option<SseEvent>, LlmError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            return Ok(Some(SseEvent::Done));
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| LlmError::ResponseFormat(format!("stream chunk: {}", e)))?;

        let token: String = chunk
            .choices
            .into_iter()
            .filter_map(|c| c.delta.content)
            .collect();

        Ok(if token.is_empty() {
            None
        } else {
            Some(SseEvent::Token(token))
        })
    }
}

// ============================================================================
// OpenAIChatClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAIChatClient {
    client: Client,
    config: ChatClientConfig,
    base_url: String,
}

impl OpenAIChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, LlmError> {
        Self::with_base_url(config, "https://api.openai.com/v1".to_string())
    }

    pub fn with_base_url(config: ChatClientConfig, base_url: String) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries)
    }

    /// Send the request and return the response once it has a success status.
    async fn send_once(
        &self,
        messages: &[PromptMessage],
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);
            let code = status.as_u16();

            tracing::error!(code = code, message = %message, "Chat completion API error");
            return Err(LlmError::Api { code, message });
        }

        Ok(response)
    }

    async fn complete_once(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        let response = self.send_once(messages, false).await?;
        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::ResponseFormat("no choices in completion".to_string()))
    }
}

#[async_trait]
impl CompletionBackend for OpenAIChatClient {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        Retry::spawn(self.retry_strategy(), || self.complete_once(messages))
            .await
            .map_err(|e| {
                tracing::error!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All completion retry attempts failed"
                );
                LlmError::RetryExhausted {
                    attempts: self.config.max_retries,
                }
            })
    }

    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, LlmError> {
        // Only opening the stream is retried. Once tokens flow, a failure ends it.
        let response = Retry::spawn(self.retry_strategy(), || self.send_once(messages, true))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Could not open completion stream");
                LlmError::RetryExhausted {
                    attempts: self.config.max_retries,
                }
            })?;

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, SseDecoder::default(), VecDeque::<String>::new(), false);

        let tokens = futures::stream::unfold(
            state,
            |(mut bytes, mut decoder, mut pending, mut done)| async move {
                loop {
                    if let Some(token) = pending.pop_front() {
                        return Some((Ok(token), (bytes, decoder, pending, done)));
                    }
                    if done {
                        return None;
                    }

                    let events = match bytes.next().await {
                        Some(Ok(chunk)) => decoder.push(&chunk),
                        Some(Err(e)) => Err(LlmError::Http(e)),
                        None => {
                            done = true;
                            decoder.finish()
                        }
                    };

                    match events {
                        Ok(events) => {
                            for event in events {
                                match event {
                                    SseEvent::Token(t) => pending.push_back(t),
                                    SseEvent::Done => done = true,
                                }
                            }
                        }
                        Err(e) => {
                            return Some((Err(e), (bytes, decoder, VecDeque::new(), true)));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(tokens))
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}
