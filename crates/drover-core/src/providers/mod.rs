//! Backend-agnostic chat provider contract.
//!
//! Concrete wire-format adapters live outside this crate; they implement
//! [`ChatProvider`] and reuse the HTTP/SSE plumbing in [`http`]. The runtime
//! only ever sees the contract: a stream of [`StreamedMessagePart`]s followed
//! by a response id and optional usage, with errors classified into
//! [`ProviderErrorKind`] so one uniform retry policy can apply.

pub mod http;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::message::{ContentPart, Message, TokenUsage};
use crate::tools::ToolSpec;

/// Categories of provider errors, closed so callers can apply one retry
/// policy across arbitrary backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// TCP/TLS connect failure or mid-stream transport loss.
    Connection,
    /// Connect or request timeout.
    Timeout,
    /// Non-2xx HTTP response, carrying the code.
    Status(u16),
    /// A 2xx response that produced no content and no tool calls.
    EmptyResponse,
    /// Everything else (parse failures, protocol violations, defects).
    Other,
}

impl ProviderErrorKind {
    /// Whether the uniform retry policy applies to this kind.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderErrorKind::Connection
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::EmptyResponse => true,
            ProviderErrorKind::Status(code) => retry::is_retryable_status(*code),
            ProviderErrorKind::Other => false,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Connection => write!(f, "connection"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Status(code) => write!(f, "status_{code}"),
            ProviderErrorKind::EmptyResponse => write!(f, "empty_response"),
            ProviderErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Structured provider error with kind and optional raw details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Optional additional details (e.g. raw error body).
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn empty_response() -> Self {
        Self::new(
            ProviderErrorKind::EmptyResponse,
            "Provider returned an empty response",
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    /// Creates an HTTP status error, pulling a cleaner message out of a JSON
    /// `{"error": {"message": ...}}` body when one is present.
    pub fn http_status(status: u16, body: &str) -> Self {
        let kind = ProviderErrorKind::Status(status);
        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(error_obj) = json.get("error")
            && let Some(msg) = error_obj.get("message").and_then(|v| v.as_str())
        {
            return Self {
                kind,
                message: format!("HTTP {status}: {msg}"),
                details: Some(body.to_string()),
            };
        }
        Self {
            kind,
            message: format!("HTTP {status}"),
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// One incremental unit of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamedMessagePart {
    Part(ContentPart),
    /// Emitted once the stream is exhausted.
    Completed {
        id: String,
        usage: Option<TokenUsage>,
    },
}

/// Boxed stream of streamed message parts.
pub type ProviderStream = BoxStream<'static, ProviderResult<StreamedMessagePart>>;

/// Reasoning effort a provider handle can be specialized to per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingEffort {
    Off,
    #[default]
    Low,
    Medium,
    High,
}

impl ThinkingEffort {
    pub fn label(&self) -> &'static str {
        match self {
            ThinkingEffort::Off => "off",
            ThinkingEffort::Low => "low",
            ThinkingEffort::Medium => "medium",
            ThinkingEffort::High => "high",
        }
    }
}

/// Input modalities a model can accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub vision: bool,
    pub audio: bool,
}

/// Uniform async contract over arbitrary chat backends.
///
/// Ordering guarantee relied on by stream assembly: a `ToolCallDelta` always
/// follows the `ToolCall` it extends, and deltas for one call id never
/// interleave with another id's.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Starts one streamed generation over the given history.
    async fn stream_chat(
        &self,
        system_prompt: Option<&str>,
        tools: &[ToolSpec],
        history: &[Message],
    ) -> ProviderResult<ProviderStream>;

    /// Returns a reconfigured copy for the given effort without mutating the
    /// shared instance, so one handle can be specialized per call
    /// concurrently.
    fn with_effort(&self, effort: ThinkingEffort) -> Arc<dyn ChatProvider>;

    /// Model identifier, for display and error messages.
    fn model(&self) -> &str;

    /// Context window size in tokens, feeding the compaction trigger.
    fn context_window(&self) -> u64;

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds_match_policy() {
        assert!(ProviderErrorKind::Connection.is_retryable());
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(ProviderErrorKind::EmptyResponse.is_retryable());
        assert!(ProviderErrorKind::Status(429).is_retryable());
        assert!(ProviderErrorKind::Status(503).is_retryable());

        assert!(!ProviderErrorKind::Status(400).is_retryable());
        assert!(!ProviderErrorKind::Status(401).is_retryable());
        assert!(!ProviderErrorKind::Other.is_retryable());
    }

    #[test]
    fn test_http_status_extracts_json_error_message() {
        let body = r#"{"error": {"type": "overloaded", "message": "Try again later"}}"#;
        let err = ProviderError::http_status(529, body);
        assert_eq!(err.kind, ProviderErrorKind::Status(529));
        assert_eq!(err.message, "HTTP 529: Try again later");
        assert_eq!(err.details.as_deref(), Some(body));
    }

    #[test]
    fn test_http_status_with_opaque_body() {
        let err = ProviderError::http_status(500, "<html>oops</html>");
        assert_eq!(err.message, "HTTP 500");
        assert_eq!(err.details.as_deref(), Some("<html>oops</html>"));

        let bare = ProviderError::http_status(502, "");
        assert!(bare.details.is_none());
    }
}
