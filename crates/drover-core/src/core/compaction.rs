//! Context compaction: summarizing history to free context budget.
//!
//! The loop delegates to a pluggable [`Summarizer`]; the default one asks
//! the provider itself. Token figures here are heuristic (bytes / 4) and
//! advisory — they feed the trigger, nothing else.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::generate::generate;
use crate::core::interrupt::Interrupt;
use crate::core::message::{ContentPart, Message};
use crate::providers::ChatProvider;

/// Marks the summary message so a rewritten history is recognizable.
pub const SUMMARY_PREFIX: &str =
    "Earlier conversation was compacted. Summary of the work so far:";

pub const SUMMARIZATION_PROMPT: &str = "Summarize this conversation as a handoff \
for a model that will resume the task. Include: progress and key decisions, \
important constraints or user preferences, what remains to be done, and any \
data needed to continue. Be concise and structured.";

/// Heuristic token count: bytes / 4.
pub fn approx_token_count(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Approximate token footprint of one message.
pub fn approx_message_tokens(message: &Message) -> u64 {
    let mut total = 0u64;
    for part in &message.content {
        total += match part {
            ContentPart::Text { text } | ContentPart::Thinking { text, .. } => {
                approx_token_count(text)
            }
            ContentPart::ImageRef { url, .. } | ContentPart::AudioRef { url, .. } => {
                approx_token_count(url)
            }
            ContentPart::ToolCall(call) => {
                approx_token_count(&call.name) + approx_token_count(&call.arguments)
            }
            ContentPart::ToolCallDelta { arguments, .. } => approx_token_count(arguments),
            ContentPart::Unknown { payload, .. } => {
                approx_token_count(&payload.to_string())
            }
        };
    }
    for call in &message.tool_calls {
        total += approx_token_count(&call.arguments);
    }
    total
}

/// Approximate token footprint of a whole history.
pub fn approx_history_tokens(history: &[Message]) -> u64 {
    history.iter().map(approx_message_tokens).sum()
}

/// Builds the summary message a compaction appends after `clear()`.
pub fn summary_message(summary: &str) -> Message {
    Message::user(format!("{SUMMARY_PREFIX}\n\n{summary}"))
}

/// Produces a shorter, semantically-equivalent rendition of a history.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarizes the full history into handoff text.
    async fn summarize(&self, history: &[Message]) -> Result<String>;
}

/// Default summarizer: one non-tool generation over the history plus the
/// summarization prompt.
pub struct ProviderSummarizer {
    provider: Arc<dyn ChatProvider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, history: &[Message]) -> Result<String> {
        let mut messages = history.to_vec();
        messages.push(Message::user(SUMMARIZATION_PROMPT));

        let outcome = generate(
            self.provider.as_ref(),
            None,
            &[],
            &messages,
            &Interrupt::new(),
            &mut |_part| {},
            &mut |_call| {},
        )
        .await?;
        Ok(outcome.message.text())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::message::ToolCallRequest;

    use super::*;

    #[test]
    fn test_approx_token_count_is_quarter_bytes() {
        assert_eq!(approx_token_count(""), 0);
        assert_eq!(approx_token_count("hello world"), 2);
        assert_eq!(approx_token_count(&"a".repeat(100)), 25);
    }

    #[test]
    fn test_approx_message_tokens_covers_tool_calls() {
        let mut message = Message::assistant();
        message.push_part(ContentPart::text("a".repeat(40)));
        message.push_part(ContentPart::ToolCall(
            ToolCallRequest::new("c1", "search").with_arguments("b".repeat(40)),
        ));

        // 40/4 text + 6/4 name + 40/4 args
        assert_eq!(approx_message_tokens(&message), 21);
    }

    #[test]
    fn test_history_tokens_sum_across_messages() {
        let history = vec![
            Message::user("a".repeat(400)),
            Message::assistant_text("b".repeat(200)),
        ];
        assert_eq!(approx_history_tokens(&history), 150);
    }

    #[test]
    fn test_summary_message_carries_prefix() {
        let message = summary_message("we fixed the parser");
        assert!(message.text().starts_with(SUMMARY_PREFIX));
        assert!(message.text().contains("we fixed the parser"));
    }
}
