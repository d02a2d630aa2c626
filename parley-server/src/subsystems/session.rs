//! Session orchestrator - one chat session per conversation id
//!
//! This subsystem owns the per-conversation state machine:
//! - ABSENT → ACTIVE on the first message (chain built from the current prompt)
//! - ACTIVE → rebuilt from scratch once idle for the configured TTL
//! - ACTIVE → answer step rebuilt in place when the prompt revision changes
//! - ACTIVE without a chain (no knowledge base yet) → build retried per message
//!
//! Requests for the same conversation id are serialized: the per-id lock is
//! taken at the start of `respond` and travels with the answer stream until
//! it is exhausted, fails, or is dropped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt};
use parley_core::chain::{Chain, ChainBuilder};
use parley_core::config::SessionConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::models::{ConversationTurn, Role};
use parley_core::prompts::{effective_instruction, FALLBACK_ANSWER};
use parley_core::retriever::KnowledgeBase;
use parley_core::store::{HistoryStore, PromptStore};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Answer fragments in order. Finite, single-consumer, not restartable.
pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Source of "now". Injected so expiry can be tested without waiting.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub cached_prompt_text: String,
    pub chain: Option<Chain>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub cached_prompt_text: String,
    pub chain_id: Option<Uuid>,
    pub chain_revision: Option<u32>,
}

impl From<&ConversationSession> for SessionSnapshot {
    fn from(s: &ConversationSession) -> Self {
        Self {
            conversation_id: s.conversation_id.clone(),
            created_at: s.created_at,
            last_active_at: s.last_active_at,
            cached_prompt_text: s.cached_prompt_text.clone(),
            chain_id: s.chain.as_ref().map(Chain::id),
            chain_revision: s.chain.as_ref().map(Chain::revision),
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    session: Option<ConversationSession>,
}

type SlotHandle = Arc<tokio::sync::Mutex<SessionSlot>>;

pub struct SessionManager {
    registry: Mutex<HashMap<String, SlotHandle>>,
    history: Arc<dyn HistoryStore>,
    prompts: Arc<dyn PromptStore>,
    builder: ChainBuilder,
    knowledge: KnowledgeBase,
    ttl: Duration,
    history_pairs: usize,
    clock: Clock,
}

impl SessionManager {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        prompts: Arc<dyn PromptStore>,
        builder: ChainBuilder,
        knowledge: KnowledgeBase,
        config: &SessionConfig,
    ) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            history,
            prompts,
            builder,
            knowledge,
            ttl: Duration::hours(config.ttl_hours),
            history_pairs: config.history_pairs,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Instruction used while no prompt revision is stored.
    pub fn default_instruction(&self) -> &str {
        self.builder.default_instruction()
    }

    fn registry(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SlotHandle>>> {
        self.registry
            .lock()
            .map_err(|_| ParleyError::Other("session registry lock poisoned".to_string()))
    }

    fn slot(&self, conversation_id: &str) -> Result<SlotHandle> {
        let mut registry = self.registry()?;
        Ok(registry
            .entry(conversation_id.to_string())
            .or_default()
            .clone())
    }

    /// Answer `message` in the conversation. The user turn is stored before
    /// generation starts; the assistant turn once the returned stream is
    /// exhausted.
    pub async fn respond(&self, conversation_id: &str, message: &str) -> Result<AnswerStream> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            tracing::debug!("Rejected message with empty conversation id");
            return Err(ParleyError::validation("conversation_id must not be empty"));
        }

        let mut guard = self.slot(conversation_id)?.lock_owned().await;

        let user_turn = self
            .history
            .append(conversation_id, Role::User, message)
            .await?;
        let history = self.history_window(conversation_id, &user_turn).await?;

        let chain = self.resolve_chain(&mut guard, conversation_id).await?;

        let tokens: AnswerStream = match chain {
            Some(chain) => {
                let stream = chain.stream(&history, message).await.map_err(|e| {
                    tracing::error!(conversation_id, error = %e, "Failed to start answer generation");
                    e
                })?;
                Box::pin(stream.map(|t| t.map_err(ParleyError::from)))
            }
            None => {
                tracing::info!(conversation_id, "No knowledge base, answering with fallback");
                Box::pin(futures::stream::once(async { Ok(FALLBACK_ANSWER.to_string()) }))
            }
        };

        Ok(relay(
            tokens,
            guard,
            self.history.clone(),
            conversation_id.to_string(),
        ))
    }

    /// Drain `respond` into one string.
    pub async fn collect(&self, conversation_id: &str, message: &str) -> Result<String> {
        let mut stream = self.respond(conversation_id, message).await?;
        let mut answer = String::new();
        while let Some(token) = stream.next().await {
            answer.push_str(&token?);
        }
        Ok(answer)
    }

    /// Session metadata, or `None` if the id has no live session. Waits for
    /// an in-flight answer on the same id.
    pub async fn snapshot(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        let slot = self.registry().ok()?.get(conversation_id.trim())?.clone();
        let guard = slot.lock().await;
        guard.session.as_ref().map(SessionSnapshot::from)
    }

    pub fn session_count(&self) -> usize {
        self.registry().map(|r| r.len()).unwrap_or(0)
    }

    /// Drop idle sessions that nobody is using. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = (self.clock)();
        let ttl = self.ttl;
        let Ok(mut registry) = self.registry() else {
            return 0;
        };

        let before = registry.len();
        registry.retain(|_, slot| {
            // Held by a waiter or a live answer stream.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard
                    .session
                    .as_ref()
                    .map(|s| now - s.last_active_at < ttl)
                    .unwrap_or(false),
                Err(_) => true,
            }
        });
        let evicted = before - registry.len();

        if evicted > 0 {
            tracing::info!(evicted, remaining = registry.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// The turns before `current`, at most `history_pairs` pairs.
    async fn history_window(
        &self,
        conversation_id: &str,
        current: &ConversationTurn,
    ) -> Result<Vec<ConversationTurn>> {
        let limit = self.history_pairs * 2;
        let mut turns = self.history.load_window(conversation_id, limit + 1).await?;
        if turns.last().map(|t| t.id) == Some(current.id) {
            turns.pop();
        }
        if turns.len() > limit {
            turns.drain(..turns.len() - limit);
        }
        Ok(turns)
    }

    async fn current_prompt(&self) -> Result<String> {
        let latest = self.prompts.latest().await?;
        Ok(effective_instruction(
            latest.as_ref().map(|r| r.content.as_str()),
            self.builder.default_instruction(),
        )
        .to_string())
    }

    async fn resolve_chain(
        &self,
        slot: &mut SessionSlot,
        conversation_id: &str,
    ) -> Result<Option<Chain>> {
        let now = (self.clock)();
        let prompt = self.current_prompt().await?;

        let idle = slot.session.as_ref().map(|s| now - s.last_active_at);
        if let Some(idle) = idle.filter(|idle| *idle >= self.ttl) {
            tracing::info!(
                conversation_id,
                idle_minutes = idle.num_minutes(),
                "Session expired, rebuilding"
            );
            slot.session = None;
        }

        match slot.session.as_mut() {
            None => {
                let chain = self.builder.build(&prompt, self.knowledge.retriever().await);
                tracing::info!(
                    conversation_id,
                    has_chain = chain.is_some(),
                    "Session started"
                );
                slot.session = Some(ConversationSession {
                    conversation_id: conversation_id.to_string(),
                    created_at: now,
                    last_active_at: now,
                    cached_prompt_text: prompt,
                    chain,
                });
            }
            Some(session) => {
                if session.chain.is_none() {
                    session.chain = self.builder.build(&prompt, self.knowledge.retriever().await);
                    session.cached_prompt_text = prompt;
                } else if session.cached_prompt_text != prompt {
                    tracing::info!(conversation_id, "Prompt changed, rebuilding answer step");
                    session.chain = session.chain.as_ref().map(|c| c.with_instruction(&prompt));
                    session.cached_prompt_text = prompt;
                }
                session.last_active_at = now;
            }
        }

        Ok(slot.session.as_ref().and_then(|s| s.chain.clone()))
    }
}

struct Relay {
    // Declared before `guard` so upstream is dropped before the id is released.
    tokens: AnswerStream,
    answer: String,
    history: Arc<dyn HistoryStore>,
    conversation_id: String,
    guard: OwnedMutexGuard<SessionSlot>,
}

/// Forward tokens to the caller and store the assembled answer at the end.
/// Dropping the stream early stores nothing.
fn relay(
    tokens: AnswerStream,
    guard: OwnedMutexGuard<SessionSlot>,
    history: Arc<dyn HistoryStore>,
    conversation_id: String,
) -> AnswerStream {
    let state = Relay {
        tokens,
        answer: String::new(),
        history,
        conversation_id,
        guard,
    };

    Box::pin(futures::stream::unfold(Some(state), |state| async move {
        let mut relay = state?;
        match relay.tokens.next().await {
            Some(Ok(token)) => {
                relay.answer.push_str(&token);
                Some((Ok(token), Some(relay)))
            }
            Some(Err(e)) => {
                tracing::error!(
                    conversation_id = %relay.conversation_id,
                    error = %e,
                    "Answer generation failed"
                );
                Some((Err(e), None))
            }
            None => {
                let stored = relay
                    .history
                    .append(&relay.conversation_id, Role::Assistant, &relay.answer)
                    .await;
                drop(relay);
                match stored {
                    Ok(turn) => {
                        tracing::debug!(turn_id = %turn.id, chars = turn.text.len(), "Stored answer");
                        None
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to store answer");
                        Some((Err(e), None))
                    }
                }
            }
        }
    }))
}
