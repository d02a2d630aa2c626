//! Fixed prompt texts and template rendering.

use crate::models::{ConversationTurn, Role};

/// Rewrites a follow-up into a standalone question. Filled with
/// `{chat_history}` and `{question}`.
pub const CONDENSE_TEMPLATE: &str = "Given the following conversation and a follow up question to be a standalone question.
You can assume the question about the documents.
If user repeat the question, you must rephrase the same question as before please.
If follow up question is meaningful and related to any information from chat history then rephrase the follow up question to be a standalone question meaningful and related to document or the chat history.
If follow up question is meaningful but not related to any information from documents or chat history then don't rephrase the follow up question to be a standalone question meaningful, just rephrase it to meaningless question.
If follow up question is meaningless (like contain meaningless question or punctuation marks) or question does related to any information of documents, you mustn't try to rephrase that question to be meaningful please.

Chat History:
{chat_history}
Follow Up Question: {question}
Standalone question:";

/// Instruction used until an operator stores a revision.
pub const DEFAULT_INSTRUCTION: &str = "You are a helpful assistant answering questions about the user's documents. \
Use only the information between the markers below. \
If the answer is not there, say that you don't know instead of making one up. \
Keep answers short and to the point.
=========
{context}
=========
Answer in Markdown.";

/// Returned, and stored as the assistant turn, when no knowledge base exists.
pub const FALLBACK_ANSWER: &str =
    "Sorry! I don't have any information about this question. Please provide me document about this.";

const CONTEXT_PLACEHOLDER: &str = "{context}";

/// `Human:` / `Assistant:` transcript of the history window.
pub fn format_history(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| {
            let speaker = match t.role {
                Role::User => "Human",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, t.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_condense(history: &[ConversationTurn], question: &str) -> String {
    let transcript = format_history(history);
    fill_placeholders(
        CONDENSE_TEMPLATE,
        &[("{chat_history}", transcript.as_str()), ("{question}", question)],
    )
}

/// Single left-to-right pass; substituted values are never rescanned.
fn fill_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Put the retrieved context into the instruction. Templates without a
/// `{context}` placeholder get the context appended in its own section.
pub fn render_instruction(instruction: &str, context: &str) -> String {
    if instruction.contains(CONTEXT_PLACEHOLDER) {
        instruction.replace(CONTEXT_PLACEHOLDER, context)
    } else {
        format!("{}\n\n=========\n{}\n=========", instruction.trim_end(), context)
    }
}

/// Treat a blank template as "no custom instruction".
pub fn effective_instruction<'a>(candidate: Option<&'a str>, default: &'a str) -> &'a str {
    match candidate {
        Some(text) if !text.trim().is_empty() => text,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn turn(role: Role, text: &str) -> ConversationTurn {
        ConversationTurn {
            id: Uuid::new_v4(),
            conversation_id: "c".to_string(),
            role,
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_condense_prompt_includes_history_and_question() {
        let history = vec![turn(Role::User, "What is a rose?"), turn(Role::Assistant, "A flower.")];
        let rendered = render_condense(&history, "How do I water it?");

        assert!(rendered.contains("Chat History:\nHuman: What is a rose?\nAssistant: A flower.\n"));
        assert!(rendered.contains("Follow Up Question: How do I water it?\nStandalone question:"));
        assert!(!rendered.contains("{chat_history}"));
    }

    #[test]
    fn test_condense_does_not_expand_placeholders_inside_turns() {
        let history = vec![
            turn(Role::User, "What does {question} mean in a template?"),
            turn(Role::Assistant, "It is replaced, like {chat_history}."),
        ];
        let rendered = render_condense(&history, "And {context}?");

        assert!(rendered.contains("Human: What does {question} mean in a template?"));
        assert!(rendered.contains("Assistant: It is replaced, like {chat_history}."));
        assert!(rendered.contains("Follow Up Question: And {context}?\nStandalone question:"));
        assert_eq!(rendered.matches("And {context}?").count(), 1);
    }

    #[test]
    fn test_instruction_placeholder_is_filled() {
        let out = render_instruction("Use this:\n{context}\nThanks", "PASSAGES");
        assert_eq!(out, "Use this:\nPASSAGES\nThanks");
    }

    #[test]
    fn test_instruction_without_placeholder_gets_context_section() {
        let out = render_instruction("Be brief.", "PASSAGES");
        assert!(out.starts_with("Be brief."));
        assert!(out.contains("PASSAGES"));
    }

    #[test]
    fn test_blank_instruction_falls_back_to_default() {
        assert_eq!(effective_instruction(Some("   \n"), "default"), "default");
        assert_eq!(effective_instruction(None, "default"), "default");
        assert_eq!(effective_instruction(Some("custom"), "default"), "custom");
    }
}
