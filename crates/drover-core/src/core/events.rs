//! Typed events and envelopes observable outside a run.
//!
//! [`WireMessage`] is the closed union carried by the wire bus; it is
//! immutable once constructed and flows one direction only, from the run
//! loop to any number of consumers. Tool outcomes and approval types live
//! here too because both the runtime and front ends consume them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::message::{Message, TokenUsage};
use crate::providers::ProviderErrorKind;

/// Error categories for [`WireMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    /// Non-2xx HTTP response.
    Status,
    EmptyResponse,
    /// History or a tool result needs a capability the model lacks.
    CapabilityMismatch,
    /// Internal/unknown error.
    Internal,
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::Connection => ErrorKind::Connection,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::Status(_) => ErrorKind::Status,
            ProviderErrorKind::EmptyResponse => ErrorKind::EmptyResponse,
            ProviderErrorKind::Other => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Status => write!(f, "status"),
            ErrorKind::EmptyResponse => write!(f, "empty_response"),
            ErrorKind::CapabilityMismatch => write!(f, "capability_mismatch"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Content block rendered to the user alongside a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayBlock {
    Text { text: String },
    Image { mime_type: String, data: String },
}

/// Out-of-band control signal a tool can attach to its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolControl {
    /// The user rejected the call; the run ends cleanly.
    Reject,
    /// Retroactive correction: rewind to an earlier checkpoint and substitute
    /// a corrective message, discarding the intermediate context.
    Rewind {
        checkpoint_id: u64,
        replacement: String,
    },
}

/// Final, non-streaming outcome of one tool call.
///
/// Tools report expected failure through `is_error`; they never raise for it.
/// `message` is what the model sees; `display` is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub is_error: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub display: Vec<DisplayBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ToolControl>,
}

impl ToolOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            is_error: false,
            message: message.into(),
            display: Vec::new(),
            control: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            message: message.into(),
            display: Vec::new(),
            control: None,
        }
    }

    /// Outcome for a call cancelled mid-flight (interrupt or timeout).
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::error(message)
    }

    /// Rejection-flagged outcome; ends the run.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            message: message.into(),
            display: Vec::new(),
            control: Some(ToolControl::Reject),
        }
    }

    /// Retroactive-correction outcome naming an earlier checkpoint and the
    /// replacement message that preserves the lesson learned.
    pub fn rewind(
        message: impl Into<String>,
        checkpoint_id: u64,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            is_error: false,
            message: message.into(),
            display: Vec::new(),
            control: Some(ToolControl::Rewind {
                checkpoint_id,
                replacement: replacement.into(),
            }),
        }
    }

    #[must_use]
    pub fn with_display(mut self, display: Vec<DisplayBlock>) -> Self {
        self.display = display;
        self
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.control, Some(ToolControl::Reject))
    }

    pub fn rewind_request(&self) -> Option<(u64, &str)> {
        match &self.control {
            Some(ToolControl::Rewind {
                checkpoint_id,
                replacement,
            }) => Some((*checkpoint_id, replacement.as_str())),
            _ => None,
        }
    }
}

/// Resolution of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Approve this and identical actions for the rest of the run.
    ApproveForSession,
    Reject,
}

/// A request for user approval emitted mid-step by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    /// Machine-matchable action key (e.g. a command pattern).
    pub action: String,
    /// Human-readable description of what will happen.
    pub description: String,
    /// Which tool is asking.
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ApprovalRequest {
    pub fn new(
        action: impl Into<String>,
        description: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            description: description.into(),
            sender: sender.into(),
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn with_tool_call_id(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_id = Some(tool_call_id.into());
        self
    }

    /// Key under which an `ApproveForSession` grant is remembered.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.sender, self.action)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The configured step bound was reached; history is intact and resumable.
    MaxStepsReached,
    Cancelled,
    ToolRejected,
}

/// Events emitted by a run onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    RunStarted {
        run_id: String,
    },
    StepStarted {
        step: usize,
    },

    /// Incremental reasoning chunk from the assistant.
    ThinkingDelta {
        text: String,
    },
    /// Incremental text chunk from the assistant.
    TextDelta {
        text: String,
    },
    /// Complete assistant message for one step.
    AssistantMessage {
        message: Message,
    },

    /// The model decided to call a tool (arguments may still be streaming).
    ToolCallStarted {
        id: String,
        name: String,
    },
    /// Arguments fully received; the call has been dispatched.
    ToolCallReady {
        id: String,
        name: String,
        arguments: Value,
    },
    /// One tool call finished; emitted in original call order.
    ToolFinished {
        id: String,
        is_error: bool,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        display: Vec<DisplayBlock>,
    },

    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        id: String,
        decision: ApprovalDecision,
    },

    /// History was rewritten into a summary to free context budget.
    ContextCompacted {
        old_len: usize,
        new_len: usize,
    },
    /// History was rewound to an earlier checkpoint.
    ContextReverted {
        checkpoint_id: u64,
    },
    UsageUpdate {
        usage: TokenUsage,
    },
    StepInterrupted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<String>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    RunEnded {
        status: RunStatus,
        steps: usize,
    },

    /// Forward-compatibility escape hatch for shapes this crate predates.
    Other {
        kind: String,
        payload: Value,
    },
}

impl WireMessage {
    /// Folds a consecutive compatible content event into `self`.
    ///
    /// Used for subscribers that requested pre-merged delivery; only runs of
    /// `TextDelta` and runs of `ThinkingDelta` coalesce.
    pub fn merge_delta(&mut self, next: &WireMessage) -> bool {
        match (self, next) {
            (WireMessage::TextDelta { text }, WireMessage::TextDelta { text: delta })
            | (
                WireMessage::ThinkingDelta { text },
                WireMessage::ThinkingDelta { text: delta },
            ) => {
                text.push_str(delta);
                true
            }
            _ => false,
        }
    }
}
