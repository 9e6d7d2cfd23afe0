//! Message model shared by providers, tools, and the run loop.
//!
//! Streaming backends emit small content parts; `merge_in_place` defines how
//! a later delta folds into an earlier part of compatible shape. Shapes that
//! do not merge are refused (the caller starts a new part) — a refusal is
//! never an error and never drops data. Payloads the model emits in a shape
//! this crate does not know become [`ContentPart::Unknown`] so front ends can
//! render a placeholder instead of losing them silently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
///
/// `arguments` is the raw JSON buffer and may be partial while the call is
/// still streaming; deltas append to it via [`ContentPart::merge_in_place`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique within a step.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Parses the accumulated argument buffer.
    ///
    /// An empty buffer parses as `{}` (some backends omit arguments for
    /// zero-parameter tools).
    ///
    /// # Errors
    /// Returns an error if the buffer is not valid JSON.
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            Ok(Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_str(&self.arguments)
        }
    }
}

/// One unit of message content.
///
/// The set is closed; forward compatibility goes through `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        /// Finalizing signature; once present the part accepts no more deltas.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ImageRef {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    AudioRef {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    ToolCall(ToolCallRequest),
    /// Incremental extension of a prior `ToolCall`'s argument buffer.
    ToolCallDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        arguments: String,
    },
    /// A streamed shape this crate does not recognize, kept verbatim.
    Unknown {
        kind: String,
        payload: Value,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        ContentPart::Thinking {
            text: text.into(),
            signature: None,
        }
    }

    /// Folds `incoming` into `self` when the shapes are compatible.
    ///
    /// Returns `false` when the pair does not merge; the caller then starts a
    /// new part. Rules:
    /// - Text ⊕ Text concatenates.
    /// - Thinking ⊕ Thinking concatenates unless the existing part already
    ///   carries a signature (a signed part is final). A delta that carries
    ///   the signature finalizes the part it merges into.
    /// - `ToolCall` ⊕ `ToolCallDelta` appends to (or initializes) the argument
    ///   buffer when the delta names no id or the matching id.
    /// - Everything else refuses.
    pub fn merge_in_place(&mut self, incoming: &ContentPart) -> bool {
        match (self, incoming) {
            (ContentPart::Text { text }, ContentPart::Text { text: delta }) => {
                text.push_str(delta);
                true
            }
            (
                ContentPart::Thinking {
                    signature: Some(_), ..
                },
                ContentPart::Thinking { .. },
            ) => false,
            (
                ContentPart::Thinking { text, signature },
                ContentPart::Thinking {
                    text: delta,
                    signature: incoming_signature,
                },
            ) => {
                text.push_str(delta);
                if incoming_signature.is_some() {
                    signature.clone_from(incoming_signature);
                }
                true
            }
            (ContentPart::ToolCall(call), ContentPart::ToolCallDelta { id, arguments }) => {
                if id.as_deref().is_none_or(|delta_id| delta_id == call.id) {
                    call.arguments.push_str(arguments);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// A conversation message: ordered content parts plus tool-call metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Tool calls carried by an assistant message, in call order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on `Role::Tool` messages: the request this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role) -> Self {
        Self {
            role,
            content: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        let mut message = Self::new(Role::System);
        message.content.push(ContentPart::text(text));
        message
    }

    pub fn user(text: impl Into<String>) -> Self {
        let mut message = Self::new(Role::User);
        message.content.push(ContentPart::text(text));
        message
    }

    /// Creates an empty assistant message; parts are folded in via
    /// [`Message::push_part`].
    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        let mut message = Self::assistant();
        message.content.push(ContentPart::text(text));
        message
    }

    /// Creates a tool-result message. The `tool_call_id` link to the prior
    /// request is mandatory for `Role::Tool` messages, so it is taken here
    /// rather than being settable after the fact.
    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool);
        message.tool_call_id = Some(tool_call_id.into());
        message.content.push(ContentPart::text(text));
        message
    }

    /// Appends a part, folding it into the last part when the shapes merge.
    pub fn push_part(&mut self, part: ContentPart) {
        if let Some(last) = self.content.last_mut()
            && last.merge_in_place(&part)
        {
            return;
        }
        self.content.push(part);
    }

    /// Concatenated text of all `Text` parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// True if the message has neither content parts nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }
}

/// Token usage reported by a provider for one request.
///
/// Totals are always derived, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens that were neither read from nor written to cache.
    pub input_other: u64,
    pub input_cache_read: u64,
    pub input_cache_creation: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(
        input_other: u64,
        input_cache_read: u64,
        input_cache_creation: u64,
        output: u64,
    ) -> Self {
        Self {
            input_other,
            input_cache_read,
            input_cache_creation,
            output,
        }
    }

    /// Total tokens across all categories.
    pub fn total(&self) -> u64 {
        self.input_other + self.input_cache_read + self.input_cache_creation + self.output
    }

    /// Input-side tokens: what the request occupied in the context window.
    pub fn context_input(&self) -> u64 {
        self.input_other + self.input_cache_read + self.input_cache_creation
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_other: self.input_other + other.input_other,
            input_cache_read: self.input_cache_read + other.input_cache_read,
            input_cache_creation: self.input_cache_creation + other.input_cache_creation,
            output: self.output + other.output,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: TokenUsage) {
        *self = *self + other;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_deltas(chunks: &[&str]) -> Vec<ContentPart> {
        chunks.iter().map(|c| ContentPart::text(*c)).collect()
    }

    /// Merging a delta sequence yields the same part regardless of where the
    /// sequence is split.
    #[test]
    fn test_merge_is_split_invariant() {
        let full = "The quick brown fox jumps over the lazy dog";
        let chars: Vec<char> = full.chars().collect();

        for split_a in [1, 7, 19, 40] {
            for split_b in [split_a + 1, split_a + 2, chars.len()] {
                let a: String = chars[..split_a].iter().collect();
                let b: String = chars[split_a..split_b.min(chars.len())].iter().collect();
                let c: String = chars[split_b.min(chars.len())..].iter().collect();

                let mut merged = ContentPart::text(a);
                assert!(merged.merge_in_place(&ContentPart::text(b)));
                assert!(merged.merge_in_place(&ContentPart::text(c)));
                assert_eq!(merged, ContentPart::text(full));
            }
        }
    }

    #[test]
    fn test_thinking_merge_concatenates_until_signed() {
        let mut part = ContentPart::thinking("step one");
        assert!(part.merge_in_place(&ContentPart::Thinking {
            text: ", step two".to_string(),
            signature: Some("sig".to_string()),
        }));

        // The signature finalizes the part: further thinking deltas refuse.
        assert!(!part.merge_in_place(&ContentPart::thinking(" more")));
        assert_eq!(
            part,
            ContentPart::Thinking {
                text: "step one, step two".to_string(),
                signature: Some("sig".to_string()),
            }
        );
    }

    #[test]
    fn test_tool_call_delta_appends_to_argument_buffer() {
        let mut part = ContentPart::ToolCall(ToolCallRequest::new("call_1", "add"));
        assert!(part.merge_in_place(&ContentPart::ToolCallDelta {
            id: None,
            arguments: r#"{"a":2,"#.to_string(),
        }));
        assert!(part.merge_in_place(&ContentPart::ToolCallDelta {
            id: Some("call_1".to_string()),
            arguments: r#""b":3}"#.to_string(),
        }));

        let ContentPart::ToolCall(call) = part else {
            panic!("expected tool call");
        };
        assert_eq!(call.arguments, r#"{"a":2,"b":3}"#);
        assert_eq!(
            call.parsed_arguments().unwrap(),
            serde_json::json!({"a": 2, "b": 3})
        );
    }

    #[test]
    fn test_delta_for_other_call_id_refuses() {
        let mut part = ContentPart::ToolCall(ToolCallRequest::new("call_1", "add"));
        assert!(!part.merge_in_place(&ContentPart::ToolCallDelta {
            id: Some("call_2".to_string()),
            arguments: "{}".to_string(),
        }));
    }

    #[test]
    fn test_incompatible_shapes_refuse_without_mutation() {
        let mut part = ContentPart::text("hello");
        assert!(!part.merge_in_place(&ContentPart::thinking("hmm")));
        assert!(!part.merge_in_place(&ContentPart::Unknown {
            kind: "video".to_string(),
            payload: serde_json::json!({}),
        }));
        assert_eq!(part, ContentPart::text("hello"));
    }

    #[test]
    fn test_push_part_folds_compatible_runs() {
        let mut message = Message::assistant();
        for part in text_deltas(&["4", " is", " the answer"]) {
            message.push_part(part);
        }
        message.push_part(ContentPart::thinking("done"));

        assert_eq!(message.content.len(), 2);
        assert_eq!(message.text(), "4 is the answer");
    }

    #[test]
    fn test_tool_result_message_links_request_id() {
        let message = Message::tool_result("call_9", "5");
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(message.text(), "5");
    }

    #[test]
    fn test_empty_argument_buffer_parses_as_empty_object() {
        let call = ToolCallRequest::new("c1", "list");
        assert_eq!(
            call.parsed_arguments().unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn test_usage_totals_are_derived() {
        let usage = TokenUsage::new(100, 2000, 50, 300);
        assert_eq!(usage.total(), 2450);
        assert_eq!(usage.context_input(), 2150);

        let mut sum = usage;
        sum += TokenUsage::new(1, 2, 3, 4);
        assert_eq!(sum.total(), 2460);
        assert!(!sum.is_empty());
        assert!(TokenUsage::default().is_empty());
    }

    #[test]
    fn test_content_part_serde_roundtrip() {
        let parts = vec![
            ContentPart::text("hi"),
            ContentPart::Thinking {
                text: "mull".to_string(),
                signature: Some("sig".to_string()),
            },
            ContentPart::ToolCall(ToolCallRequest::new("c1", "add").with_arguments("{}")),
            ContentPart::Unknown {
                kind: "hologram".to_string(),
                payload: serde_json::json!({"frames": 3}),
            },
        ];
        let json = serde_json::to_string(&parts).unwrap();
        assert!(json.contains(r#""type":"tool_call""#));
        assert!(json.contains(r#""type":"unknown""#));

        let back: Vec<ContentPart> = serde_json::from_str(&json).unwrap();
        assert_eq!(parts, back);
    }
}
