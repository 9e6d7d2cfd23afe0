//! Tool system: specs, dispatch registry, and pending handles.
//!
//! Concrete tools live outside this crate; they register a spec plus an
//! async handler. Dispatch answers a call either synchronously (an
//! immediately-resolved handle, e.g. for unknown names or malformed
//! arguments) or by spawning the handler future, so execution overlaps with
//! continued stream consumption.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::events::ToolOutcome;
use crate::core::message::{Message, ToolCallRequest};
use crate::core::wire::ApprovalRoute;

/// Tool definition surfaced to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Result of executing one tool call.
///
/// Transient: produced by the step, appended to the context as a
/// `Role::Tool` message, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn new(tool_call_id: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            outcome,
        }
    }

    /// Renders this result as the tool message the model will see.
    pub fn to_message(&self) -> Message {
        Message::tool_result(self.tool_call_id.clone(), self.outcome.message.clone())
    }
}

/// Execution context handed to tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    /// Root directory for tools that touch the filesystem.
    pub run_root: PathBuf,
    /// Optional per-call timeout enforced by the dispatcher.
    pub timeout: Option<Duration>,
    /// Route for mid-step approval requests; nested runs must reuse it.
    pub approvals: ApprovalRoute,
}

impl ToolContext {
    pub fn new(run_root: impl Into<PathBuf>, approvals: ApprovalRoute) -> Self {
        Self {
            run_root: run_root.into(),
            timeout: None,
            approvals,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Boxed future returned by a tool handler.
pub type ToolFuture = Pin<Box<dyn Future<Output = ToolOutcome> + Send>>;
/// Tool handler: arguments in, outcome out. Expected failure comes back as
/// an error-flagged outcome, never as a panic or error type.
pub type ToolHandler = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// Name → implementation registry.
#[derive(Clone, Default)]
pub struct Toolset {
    specs: Vec<ToolSpec>,
    handlers: HashMap<String, ToolHandler>,
}

impl std::fmt::Debug for Toolset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolset")
            .field("specs", &self.specs)
            .field("handlers_len", &self.handlers.len())
            .finish()
    }
}

impl Toolset {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, spec: ToolSpec, handler: ToolHandler) -> Self {
        self.register(spec, handler);
        self
    }

    /// Registers a tool; re-registering a name replaces the previous entry.
    /// Names match case-insensitively, which keeps dispatch resilient to
    /// provider casing differences.
    pub fn register(&mut self, spec: ToolSpec, handler: ToolHandler) {
        let key = spec.name.to_ascii_lowercase();
        if let Some(pos) = self
            .specs
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(&spec.name))
        {
            self.specs.remove(pos);
        }
        self.specs.push(spec);
        self.handlers.insert(key, handler);
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Answers a call with a handle.
    ///
    /// Unknown names and malformed argument buffers resolve immediately to
    /// error-flagged outcomes; recognized calls spawn their handler (wrapped
    /// in the context's timeout, when set) and resolve later.
    pub fn dispatch(&self, call: &ToolCallRequest, ctx: &ToolContext) -> ToolHandle {
        let arguments = match call.parsed_arguments() {
            Ok(value) => value,
            Err(e) => {
                return ToolHandle::ready(
                    call.id.clone(),
                    ToolOutcome::error(format!(
                        "Invalid JSON arguments for tool '{}': {e}",
                        call.name
                    )),
                );
            }
        };

        let Some(handler) = self.handlers.get(&call.name.to_ascii_lowercase()) else {
            return ToolHandle::ready(call.id.clone(), self.unknown_tool_outcome(&call.name));
        };

        debug!(tool = %call.name, id = %call.id, "dispatching tool call");
        let future = handler(arguments, ctx.clone());
        let timeout = ctx.timeout;
        let join = tokio::spawn(async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, future).await {
                    Ok(outcome) => outcome,
                    Err(_) => ToolOutcome::error(format!(
                        "Tool execution timed out after {} seconds",
                        limit.as_secs()
                    )),
                },
                None => future.await,
            }
        });
        ToolHandle::spawned(call.id.clone(), join)
    }

    fn unknown_tool_outcome(&self, name: &str) -> ToolOutcome {
        let mut available = self.names();
        available.sort();
        ToolOutcome::error(format!(
            "Unknown tool: {name}. Available tools: {}",
            available.join(", ")
        ))
    }
}

enum HandleInner {
    Ready(Option<ToolOutcome>),
    Spawned(JoinHandle<ToolOutcome>),
}

/// A pending (or already answered) tool invocation.
pub struct ToolHandle {
    pub tool_call_id: String,
    inner: HandleInner,
}

impl ToolHandle {
    /// Synchronously answered handle.
    pub fn ready(tool_call_id: impl Into<String>, outcome: ToolOutcome) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            inner: HandleInner::Ready(Some(outcome)),
        }
    }

    fn spawned(tool_call_id: impl Into<String>, join: JoinHandle<ToolOutcome>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            inner: HandleInner::Spawned(join),
        }
    }

    /// Requests cancellation of a still-running handler.
    pub fn abort(&self) {
        if let HandleInner::Spawned(join) = &self.inner {
            join.abort();
        }
    }

    /// Awaits the outcome. Aborted handlers resolve to a canceled outcome,
    /// panicked handlers to an error-flagged one; a handle only ever yields
    /// its real outcome once.
    pub async fn resolve(&mut self) -> ToolOutcome {
        match &mut self.inner {
            HandleInner::Ready(outcome) => outcome
                .take()
                .unwrap_or_else(|| ToolOutcome::error("Tool outcome already consumed")),
            HandleInner::Spawned(join) => match join.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => ToolOutcome::canceled("Tool call was cancelled"),
                Err(_) => ToolOutcome::error("Tool execution panicked"),
            },
        }
    }
}
