//! Answer-generation chain: condense the follow-up, retrieve passages, stream
//! the answer.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::llm::{CompletionBackend, PromptMessage, TokenStream};
use crate::models::{ConversationTurn, Passage};
use crate::prompts::{self, DEFAULT_INSTRUCTION};
use crate::retriever::Retriever;

/// Rough token estimate used for context packing.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Keep passages in rank order while they fit the budget. Lower-ranked
/// passages are dropped first.
pub fn pack_context(passages: &[Passage], max_tokens: usize) -> String {
    let mut used = 0;
    let mut parts = Vec::new();
    for p in passages {
        let cost = estimate_tokens(&p.text);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        parts.push(p.text.as_str());
    }
    parts.join("\n\n")
}

#[derive(Clone)]
pub struct ChainBuilder {
    condense_llm: Arc<dyn CompletionBackend>,
    answer_llm: Arc<dyn CompletionBackend>,
    default_instruction: Arc<str>,
    max_context_tokens: usize,
}

impl ChainBuilder {
    pub fn new(condense_llm: Arc<dyn CompletionBackend>, answer_llm: Arc<dyn CompletionBackend>) -> Self {
        Self {
            condense_llm,
            answer_llm,
            default_instruction: Arc::from(DEFAULT_INSTRUCTION),
            max_context_tokens: 2000,
        }
    }

    pub fn with_default_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        if !instruction.trim().is_empty() {
            self.default_instruction = Arc::from(instruction);
        }
        self
    }

    pub fn with_max_context_tokens(mut self, max_tokens: usize) -> Self {
        self.max_context_tokens = max_tokens;
        self
    }

    pub fn default_instruction(&self) -> &str {
        &self.default_instruction
    }

    /// Assemble a chain. `None` means there is no knowledge base to answer
    /// from. Performs no I/O.
    pub fn build(&self, instruction: &str, retriever: Option<Arc<dyn Retriever>>) -> Option<Chain> {
        let retriever = retriever?;
        let instruction = prompts::effective_instruction(Some(instruction), &self.default_instruction);

        let chain = Chain {
            id: Uuid::new_v4(),
            revision: 0,
            retriever,
            condense_llm: self.condense_llm.clone(),
            answer_llm: self.answer_llm.clone(),
            instruction: Arc::from(instruction),
            max_context_tokens: self.max_context_tokens,
        };
        tracing::debug!(chain_id = %chain.id, "Built chain");
        Some(chain)
    }
}

#[derive(Clone)]
pub struct Chain {
    id: Uuid,
    revision: u32,
    retriever: Arc<dyn Retriever>,
    condense_llm: Arc<dyn CompletionBackend>,
    answer_llm: Arc<dyn CompletionBackend>,
    instruction: Arc<str>,
    max_context_tokens: usize,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("revision", &self.revision)
            .field("instruction_len", &self.instruction.len())
            .finish()
    }
}

impl Chain {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of in-place answer-step rebuilds since the chain was built.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Same chain with a new answer instruction. Retrieval and condensation
    /// are shared with `self`.
    pub fn with_instruction(&self, instruction: &str) -> Chain {
        Chain {
            revision: self.revision + 1,
            instruction: Arc::from(instruction),
            ..self.clone()
        }
    }

    /// Standalone form of `question`. An empty history needs no rewrite.
    pub async fn condense(&self, history: &[ConversationTurn], question: &str) -> Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }

        let messages = [PromptMessage::user(prompts::render_condense(history, question))];
        let standalone = self.condense_llm.complete(&messages).await?;
        let standalone = standalone.trim();

        tracing::debug!(chain_id = %self.id, standalone = %standalone, "Condensed question");
        Ok(if standalone.is_empty() {
            question.to_string()
        } else {
            standalone.to_string()
        })
    }

    /// The answer request for `question`: condensation and retrieval are done
    /// here, generation is not.
    pub async fn answer_messages(
        &self,
        history: &[ConversationTurn],
        question: &str,
    ) -> Result<Vec<PromptMessage>> {
        let standalone = self.condense(history, question).await?;
        let passages = self.retriever.retrieve(&standalone).await?;
        let context = pack_context(&passages, self.max_context_tokens);

        Ok(vec![
            PromptMessage::system(prompts::render_instruction(&self.instruction, &context)),
            PromptMessage::user(format!("Question: {}", standalone)),
        ])
    }

    pub async fn stream(&self, history: &[ConversationTurn], question: &str) -> Result<TokenStream> {
        let messages = self.answer_messages(history, question).await?;
        Ok(self.answer_llm.stream(&messages).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::models::Role;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::StreamExt;
    use std::sync::Mutex;

    /// Records every request and answers with a fixed text.
    struct RecordingLlm {
        reply: String,
        requests: Mutex<Vec<Vec<PromptMessage>>>,
    }

    impl RecordingLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Vec<PromptMessage>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for RecordingLlm {
        async fn complete(&self, messages: &[PromptMessage]) -> std::result::Result<String, LlmError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            Ok(self.reply.clone())
        }

        async fn stream(&self, messages: &[PromptMessage]) -> std::result::Result<TokenStream, LlmError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            let tokens: Vec<std::result::Result<String, LlmError>> =
                self.reply.split_inclusive(' ').map(|t| Ok(t.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(tokens)))
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct StaticRetriever {
        passages: Vec<Passage>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Retriever for StaticRetriever {
        async fn retrieve(&self, query: &str) -> Result<Vec<Passage>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.passages.clone())
        }
    }

    fn passage(text: &str) -> Passage {
        Passage {
            source_doc_id: Uuid::new_v4(),
            file_name: "roses.txt".to_string(),
            chunk_index: 0,
            text: text.to_string(),
            score: 0.9,
        }
    }

    fn turn(role: Role, text: &str) -> ConversationTurn {
        ConversationTurn {
            id: Uuid::new_v4(),
            conversation_id: "c".to_string(),
            role,
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    fn retriever(passages: Vec<Passage>) -> Arc<StaticRetriever> {
        Arc::new(StaticRetriever {
            passages,
            queries: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_build_without_retriever_is_none() {
        let builder = ChainBuilder::new(RecordingLlm::new("x"), RecordingLlm::new("y"));
        assert!(builder.build("anything", None).is_none());
    }

    #[test]
    fn test_blank_template_uses_default_instruction() {
        let builder = ChainBuilder::new(RecordingLlm::new("x"), RecordingLlm::new("y"))
            .with_default_instruction("Default {context}");
        let chain = builder.build("  ", Some(retriever(vec![]))).unwrap();
        assert_eq!(chain.instruction(), "Default {context}");
    }

    #[test]
    fn test_with_instruction_keeps_identity_and_bumps_revision() {
        let builder = ChainBuilder::new(RecordingLlm::new("x"), RecordingLlm::new("y"));
        let chain = builder.build("v1 {context}", Some(retriever(vec![]))).unwrap();
        let rebuilt = chain.with_instruction("v2 {context}");

        assert_eq!(rebuilt.id(), chain.id());
        assert_eq!(rebuilt.revision(), chain.revision() + 1);
        assert_eq!(rebuilt.instruction(), "v2 {context}");
        assert_eq!(chain.instruction(), "v1 {context}");
    }

    #[tokio::test]
    async fn test_empty_history_skips_condensation() {
        let condense = RecordingLlm::new("should not be used");
        let answer = RecordingLlm::new("Roses need sun.");
        let rtv = retriever(vec![passage("Roses like full sun.")]);
        let chain = ChainBuilder::new(condense.clone(), answer.clone())
            .build("Context: {context}", Some(rtv.clone()))
            .unwrap();

        let tokens: Vec<String> = chain
            .stream(&[], "Do roses like sun?")
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;

        assert_eq!(tokens.concat(), "Roses need sun.");
        assert!(condense.requests().is_empty());
        assert_eq!(rtv.queries.lock().unwrap().as_slice(), ["Do roses like sun?"]);

        let request = &answer.requests()[0];
        assert_eq!(request[0].content, "Context: Roses like full sun.");
        assert_eq!(request[1].content, "Question: Do roses like sun?");
    }

    #[tokio::test]
    async fn test_history_is_condensed_before_retrieval() {
        let condense = RecordingLlm::new("  How often should roses be watered?  ");
        let answer = RecordingLlm::new("Twice a week.");
        let rtv = retriever(vec![passage("Water roses twice a week.")]);
        let chain = ChainBuilder::new(condense.clone(), answer.clone())
            .build("{context}", Some(rtv.clone()))
            .unwrap();

        let history = vec![turn(Role::User, "Tell me about roses"), turn(Role::Assistant, "They are flowers.")];
        let messages = chain.answer_messages(&history, "how often to water?").await.unwrap();

        let condense_request = &condense.requests()[0];
        assert_eq!(condense_request.len(), 1, "template is sent as one message");
        let prompt = &condense_request[0].content;
        assert!(prompt.contains("Human: Tell me about roses"));
        assert_eq!(prompt.matches("how often to water?").count(), 1);
        assert!(prompt.ends_with("Follow Up Question: how often to water?\nStandalone question:"));
        assert_eq!(
            rtv.queries.lock().unwrap().as_slice(),
            ["How often should roses be watered?"]
        );
        assert_eq!(messages[1].content, "Question: How often should roses be watered?");
    }

    #[test]
    fn test_pack_context_respects_budget_in_rank_order() {
        let passages = vec![passage(&"a".repeat(40)), passage(&"b".repeat(40)), passage(&"c".repeat(4))];
        // 10 + 10 tokens fit, the third would exceed 20.
        let packed = pack_context(&passages, 20);
        assert_eq!(packed, format!("{}\n\n{}", "a".repeat(40), "b".repeat(40)));
        assert_eq!(pack_context(&passages, 5), "");
    }
}
