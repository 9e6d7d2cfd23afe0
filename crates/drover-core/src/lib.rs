//! Execution core for an interactive, tool-using agent runtime.
//!
//! Drives multi-step reasoning/tool loops against pluggable model backends,
//! keeps a durable checkpointed conversation context, and exposes a typed
//! event stream ("wire") consumed by front ends.

pub mod config;
pub mod core;
pub mod logging;
pub mod providers;
pub mod tools;

pub use crate::config::Config;
pub use crate::core::agent::{Agent, CapabilityError, RunOutcome};
pub use crate::core::context::Context;
pub use crate::core::events::{ApprovalDecision, ApprovalRequest, ToolOutcome, WireMessage};
pub use crate::core::interrupt::Interrupt;
pub use crate::core::message::{ContentPart, Message, Role, TokenUsage, ToolCallRequest};
pub use crate::core::wire::{Wire, WireReceiver};
pub use crate::providers::{ChatProvider, ProviderError, ProviderErrorKind};
pub use crate::tools::{ToolResult, ToolSpec, Toolset};
