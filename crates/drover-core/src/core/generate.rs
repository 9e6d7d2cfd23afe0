//! Drives one provider stream to completion, assembling a single message.
//!
//! Parts fold together via the message model's merge rules. The
//! `on_tool_call` hook fires the instant a tool call's arguments are fully
//! buffered — when the next incompatible part begins, not when the turn
//! ends — so tool execution starts while the assistant's trailing text is
//! still streaming.

use anyhow::Result;
use futures_util::StreamExt;

use crate::core::interrupt::{Interrupt, InterruptedError};
use crate::core::message::{ContentPart, Message, TokenUsage, ToolCallRequest};
use crate::providers::{ChatProvider, ProviderError, StreamedMessagePart};
use crate::tools::ToolSpec;

/// Result of one streamed generation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    /// The single assembled assistant message.
    pub message: Message,
    pub response_id: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Consumes a provider stream into one assembled assistant [`Message`].
///
/// `on_part` fires for every streamed part as it arrives; `on_tool_call`
/// fires once per fully-buffered tool call. On cancellation, consumption
/// stops promptly, no further hooks fire, and [`InterruptedError`]
/// propagates.
///
/// # Errors
/// Returns the provider error, [`InterruptedError`] on cancellation, or an
/// `EmptyResponse` provider error for a stream that produced neither
/// content nor tool calls.
pub async fn generate(
    provider: &dyn ChatProvider,
    system_prompt: Option<&str>,
    tools: &[ToolSpec],
    history: &[Message],
    interrupt: &Interrupt,
    on_part: &mut (dyn FnMut(&ContentPart) + Send),
    on_tool_call: &mut (dyn FnMut(&ToolCallRequest) + Send),
) -> Result<GenerateOutcome> {
    let mut stream = tokio::select! {
        biased;
        () = interrupt.cancelled() => return Err(InterruptedError.into()),
        result = provider.stream_chat(system_prompt, tools, history) => {
            result.map_err(anyhow::Error::new)?
        }
    };

    let mut message = Message::assistant();
    let mut response_id = None;
    let mut usage = None;

    loop {
        let item = tokio::select! {
            biased;
            () = interrupt.cancelled() => return Err(InterruptedError.into()),
            item = stream.next() => item,
        };
        let Some(item) = item else { break };

        match item.map_err(anyhow::Error::new)? {
            StreamedMessagePart::Part(part) => {
                on_part(&part);
                ingest_part(&mut message, part, on_tool_call);
            }
            StreamedMessagePart::Completed { id, usage: reported } => {
                response_id = Some(id);
                usage = reported;
            }
        }
    }

    finalize_open_tool_call(&mut message, on_tool_call);

    if message.is_empty() {
        return Err(ProviderError::empty_response().into());
    }

    Ok(GenerateOutcome {
        message,
        response_id,
        usage,
    })
}

/// Folds one streamed part into the message under assembly.
///
/// A part that does not merge closes the previously-open tool call (if
/// any). A `ToolCallDelta` with no call to extend is surfaced as `Unknown`
/// rather than dropped.
fn ingest_part(
    message: &mut Message,
    part: ContentPart,
    on_tool_call: &mut (dyn FnMut(&ToolCallRequest) + Send),
) {
    if let Some(last) = message.content.last_mut()
        && last.merge_in_place(&part)
    {
        return;
    }
    finalize_open_tool_call(message, on_tool_call);

    let part = match part {
        dangling @ ContentPart::ToolCallDelta { .. } => ContentPart::Unknown {
            kind: "tool_call_delta".to_string(),
            payload: serde_json::to_value(&dangling).unwrap_or(serde_json::Value::Null),
        },
        other => other,
    };
    message.content.push(part);
}

/// If the last part is a tool call not yet reported, records it on the
/// message and fires the hook.
fn finalize_open_tool_call(
    message: &mut Message,
    on_tool_call: &mut (dyn FnMut(&ToolCallRequest) + Send),
) {
    let open = match message.content.last() {
        Some(ContentPart::ToolCall(call))
            if !message.tool_calls.iter().any(|c| c.id == call.id) =>
        {
            Some(call.clone())
        }
        _ => None,
    };
    if let Some(call) = open {
        message.tool_calls.push(call.clone());
        on_tool_call(&call);
    }
}
