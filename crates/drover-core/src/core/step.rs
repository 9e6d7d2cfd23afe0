//! One model turn: generation plus concurrent tool execution.
//!
//! Recognized tool calls are dispatched the moment their arguments are
//! buffered; handles are recorded in call order and awaited in that order
//! once the assistant message is complete, so results are reported
//! deterministically no matter how the tools interleave. If generation
//! fails after calls were dispatched, every pending handle is cancelled and
//! drained before the error propagates — no invocation is ever orphaned.

use anyhow::Result;
use tracing::debug;

use crate::core::events::{ErrorKind, WireMessage};
use crate::core::generate::generate;
use crate::core::interrupt::{Interrupt, InterruptedError};
use crate::core::message::{ContentPart, Message, TokenUsage, ToolCallRequest};
use crate::core::wire::Wire;
use crate::providers::{ChatProvider, ProviderError, retry};
use crate::tools::{ToolContext, ToolHandle, ToolResult, Toolset};

/// Everything a step needs from its surrounding run.
pub struct StepParams<'a> {
    pub provider: &'a dyn ChatProvider,
    pub toolset: &'a Toolset,
    pub system_prompt: Option<&'a str>,
    pub tool_ctx: &'a ToolContext,
    pub wire: &'a Wire,
    pub interrupt: &'a Interrupt,
    /// Total provider-call attempts, including the first.
    pub max_attempts: usize,
}

/// What one finished step produced.
#[derive(Debug)]
pub struct StepReport {
    pub assistant: Message,
    /// Tool results in original call order.
    pub results: Vec<ToolResult>,
    pub usage: Option<TokenUsage>,
    pub response_id: Option<String>,
    /// True if any result was rejection-flagged.
    pub rejected: bool,
}

/// Explicit exit paths of one step, matched by the run loop.
#[derive(Debug)]
pub enum StepOutcome {
    Finished(StepReport),
    Interrupted {
        partial: Option<String>,
    },
    /// A tool asked for a retroactive correction; a non-local control
    /// transfer, not a normal completion.
    RevertRequested {
        checkpoint_id: u64,
        replacement: String,
        report: StepReport,
    },
}

/// Runs one step over `history`.
///
/// Provider calls retry with backoff for retryable error kinds, up to
/// `max_attempts`; any tool dispatched during a failed attempt is cancelled
/// and drained before the retry or the propagated error.
///
/// # Errors
/// Returns non-retryable provider errors and internal defects; expected
/// tool failure never propagates.
pub async fn run_step(params: &StepParams<'_>, history: &[Message]) -> Result<StepOutcome> {
    let mut attempt = 0usize;

    let (generated, handles) = loop {
        attempt += 1;
        let mut handles: Vec<(ToolCallRequest, ToolHandle)> = Vec::new();
        let mut partial = String::new();

        let result = {
            let wire = params.wire;
            let toolset = params.toolset;
            let tool_ctx = params.tool_ctx;
            let handles = &mut handles;
            let partial = &mut partial;

            let mut on_part = move |part: &ContentPart| match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    partial.push_str(text);
                    wire.publish_delta(WireMessage::TextDelta { text: text.clone() });
                }
                ContentPart::Thinking { text, .. } if !text.is_empty() => {
                    wire.publish_delta(WireMessage::ThinkingDelta { text: text.clone() });
                }
                ContentPart::ToolCall(call) => {
                    wire.publish_delta(WireMessage::ToolCallStarted {
                        id: call.id.clone(),
                        name: call.name.clone(),
                    });
                }
                _ => {}
            };
            let mut on_tool_call = move |call: &ToolCallRequest| {
                let handle = toolset.dispatch(call, tool_ctx);
                wire.publish_delta(WireMessage::ToolCallReady {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.parsed_arguments().unwrap_or(serde_json::Value::Null),
                });
                handles.push((call.clone(), handle));
            };

            generate(
                params.provider,
                params.system_prompt,
                params.toolset.specs(),
                history,
                params.interrupt,
                &mut on_part,
                &mut on_tool_call,
            )
            .await
        };

        match result {
            Ok(generated) => break (generated, handles),
            Err(err) => {
                cancel_and_drain(handles).await;

                if err.downcast_ref::<InterruptedError>().is_some() {
                    return Ok(StepOutcome::Interrupted {
                        partial: (!partial.is_empty()).then_some(partial),
                    });
                }
                let retryable = err
                    .downcast_ref::<ProviderError>()
                    .is_some_and(ProviderError::is_retryable);
                if retryable && attempt < params.max_attempts {
                    let delay = retry::backoff_delay((attempt - 1) as u32);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying provider call");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                emit_error(params.wire, &err).await;
                return Err(err);
            }
        }
    };

    // Await handles in original call order; completion order does not matter.
    let mut results: Vec<ToolResult> = Vec::with_capacity(handles.len());
    let mut queue = handles.into_iter();
    while let Some((call, mut handle)) = queue.next() {
        let resolved = tokio::select! {
            biased;
            () = params.interrupt.cancelled() => None,
            outcome = handle.resolve() => Some(outcome),
        };
        match resolved {
            Some(outcome) => {
                params
                    .wire
                    .publish(WireMessage::ToolFinished {
                        id: call.id.clone(),
                        is_error: outcome.is_error,
                        message: outcome.message.clone(),
                        display: outcome.display.clone(),
                    })
                    .await;
                results.push(ToolResult::new(call.id, outcome));
            }
            None => {
                handle.abort();
                let _ = handle.resolve().await;
                for (_, mut rest) in queue.by_ref() {
                    rest.abort();
                    let _ = rest.resolve().await;
                }
                let text = generated.message.text();
                return Ok(StepOutcome::Interrupted {
                    partial: (!text.is_empty()).then_some(text),
                });
            }
        }
    }

    let rejected = results.iter().any(|r| r.outcome.is_rejected());
    let rewind = if rejected {
        // A rejection ends the run; pending control signals are discarded.
        None
    } else {
        results.iter().find_map(|r| {
            r.outcome
                .rewind_request()
                .map(|(checkpoint_id, replacement)| (checkpoint_id, replacement.to_string()))
        })
    };

    let report = StepReport {
        assistant: generated.message,
        results,
        usage: generated.usage,
        response_id: generated.response_id,
        rejected,
    };

    match rewind {
        Some((checkpoint_id, replacement)) => Ok(StepOutcome::RevertRequested {
            checkpoint_id,
            replacement,
            report,
        }),
        None => Ok(StepOutcome::Finished(report)),
    }
}

async fn cancel_and_drain(handles: Vec<(ToolCallRequest, ToolHandle)>) {
    for (_, mut handle) in handles {
        handle.abort();
        let _ = handle.resolve().await;
    }
}

/// Publishes an error event, preserving provider error detail.
pub(crate) async fn emit_error(wire: &Wire, err: &anyhow::Error) {
    let event = if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
        WireMessage::Error {
            kind: provider_err.kind.into(),
            message: provider_err.message.clone(),
            details: provider_err.details.clone(),
        }
    } else {
        WireMessage::Error {
            kind: ErrorKind::Internal,
            message: err.to_string(),
            details: None,
        }
    };
    wire.publish(event).await;
}
