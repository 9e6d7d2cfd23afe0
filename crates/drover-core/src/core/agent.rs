//! The run state machine: multi-step execution over one context.
//!
//! A run appends the user message, then loops: compact if the budget is
//! tight, checkpoint, execute one step with an approval relay running
//! alongside, and react to the step's explicit outcome (finished,
//! interrupted, or a retroactive-correction revert). All observable
//! behavior flows out through the wire; the context is mutated only here
//! (single writer).
//!
//! Nested runs (subagents spawned as tools) own their own [`Context`] but
//! must be constructed with the root wire so their approval relays publish
//! onto the root channel instead of opening a second one.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::core::compaction::{
    self, ProviderSummarizer, Summarizer, approx_history_tokens,
};
use crate::core::context::Context;
use crate::core::events::{ApprovalDecision, ErrorKind, RunStatus, WireMessage};
use crate::core::interrupt::Interrupt;
use crate::core::message::{ContentPart, Message};
use crate::core::step::{StepOutcome, StepParams, run_step};
use crate::core::wire::{ApprovalRoute, PendingApproval, Wire};
use crate::providers::{ChatProvider, ProviderError, retry};
use crate::tools::{ToolContext, Toolset};

/// History (or a tool result) needs a capability the selected model lacks.
/// Surfaced before any provider call when detectable.
#[derive(Debug)]
pub struct CapabilityError {
    pub capability: &'static str,
    pub model: String,
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Model '{}' cannot accept {} input; switch models or remove that content",
            self.model, self.capability
        )
    }
}

impl std::error::Error for CapabilityError {}

/// How a run ended. Bounded completion, cancellation, and rejection are
/// reported statuses, not errors: history stays intact and resumable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { final_text: String, steps: usize },
    MaxStepsReached { steps: usize },
    Cancelled { steps: usize },
    ToolRejected { steps: usize },
}

/// Drives multi-step runs against one provider and toolset.
pub struct Agent {
    provider: Arc<dyn ChatProvider>,
    toolset: Toolset,
    summarizer: Arc<dyn Summarizer>,
    wire: Arc<Wire>,
    config: Config,
    system_prompt: Option<String>,
    run_root: PathBuf,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        toolset: Toolset,
        wire: Arc<Wire>,
        config: Config,
    ) -> Self {
        let summarizer = Arc::new(ProviderSummarizer::new(Arc::clone(&provider)));
        Self {
            provider,
            toolset,
            summarizer,
            wire,
            config,
            system_prompt: None,
            run_root: PathBuf::from("."),
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    #[must_use]
    pub fn with_run_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.run_root = root.into();
        self
    }

    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    /// Executes one run: appends `user` (creating checkpoint 0 on a fresh
    /// context) and loops steps until completion, rejection, interruption,
    /// or the step bound.
    ///
    /// # Errors
    /// Returns capability mismatches (before any provider call),
    /// non-retryable provider errors, and persistence failures. Reported
    /// statuses come back as `Ok`.
    pub async fn run(
        &self,
        ctx: &mut Context,
        user: Message,
        interrupt: &Interrupt,
    ) -> Result<RunOutcome> {
        self.check_capabilities(ctx.history(), &user).await?;

        let run_id = uuid::Uuid::new_v4().to_string();
        self.wire.publish(WireMessage::RunStarted { run_id }).await;

        if ctx.checkpoints().is_empty() {
            ctx.checkpoint()?;
        }
        ctx.append(user)?;

        let session_grants: Arc<Mutex<HashSet<String>>> = Arc::default();
        let mut steps = 0usize;

        loop {
            if steps >= self.config.max_steps_per_run {
                self.wire
                    .publish(WireMessage::RunEnded {
                        status: RunStatus::MaxStepsReached,
                        steps,
                    })
                    .await;
                return Ok(RunOutcome::MaxStepsReached { steps });
            }
            steps += 1;
            self.wire
                .publish(WireMessage::StepStarted { step: steps })
                .await;

            self.maybe_compact(ctx).await?;
            ctx.checkpoint()?;

            let (route, relay_rx) = ApprovalRoute::channel(16);
            let relay = self.spawn_approval_relay(relay_rx, Arc::clone(&session_grants));
            let tool_ctx = ToolContext::new(self.run_root.clone(), route)
                .with_timeout(self.config.tool_timeout());

            let step_params = StepParams {
                provider: self.provider.as_ref(),
                toolset: &self.toolset,
                system_prompt: self.system_prompt.as_deref(),
                tool_ctx: &tool_ctx,
                wire: &self.wire,
                interrupt,
                max_attempts: self.config.max_retries_per_step,
            };
            let step_result = run_step(&step_params, ctx.history()).await;
            // The relay never outlives its step.
            relay.abort();

            match step_result? {
                StepOutcome::Interrupted { partial } => {
                    self.wire
                        .publish(WireMessage::StepInterrupted { partial })
                        .await;
                    self.wire
                        .publish(WireMessage::RunEnded {
                            status: RunStatus::Cancelled,
                            steps,
                        })
                        .await;
                    return Ok(RunOutcome::Cancelled { steps });
                }
                StepOutcome::RevertRequested {
                    checkpoint_id,
                    replacement,
                    report,
                } => {
                    if let Some(usage) = report.usage {
                        self.wire.publish(WireMessage::UsageUpdate { usage }).await;
                    }
                    ctx.revert_to(checkpoint_id)?;
                    ctx.checkpoint()?;
                    ctx.append(Message::user(replacement))?;
                    ctx.update_token_count(approx_history_tokens(ctx.history()));
                    self.wire
                        .publish(WireMessage::ContextReverted { checkpoint_id })
                        .await;
                }
                StepOutcome::Finished(report) => {
                    let made_tool_calls = !report.results.is_empty();
                    self.wire
                        .publish(WireMessage::AssistantMessage {
                            message: report.assistant.clone(),
                        })
                        .await;
                    ctx.append(report.assistant.clone())?;
                    for result in &report.results {
                        ctx.append(result.to_message())?;
                    }
                    if let Some(usage) = report.usage {
                        ctx.update_token_count(usage.context_input() + usage.output);
                        self.wire.publish(WireMessage::UsageUpdate { usage }).await;
                    }
                    if report.rejected {
                        self.wire
                            .publish(WireMessage::RunEnded {
                                status: RunStatus::ToolRejected,
                                steps,
                            })
                            .await;
                        return Ok(RunOutcome::ToolRejected { steps });
                    }
                    if !made_tool_calls {
                        let final_text = report.assistant.text();
                        self.wire
                            .publish(WireMessage::RunEnded {
                                status: RunStatus::Completed,
                                steps,
                            })
                            .await;
                        return Ok(RunOutcome::Completed { final_text, steps });
                    }
                }
            }
        }
    }

    /// Rewrites history into a summary when the projected budget would
    /// exceed the provider's window minus the reserved margin.
    async fn maybe_compact(&self, ctx: &mut Context) -> Result<()> {
        if !self.config.compaction.enabled {
            return Ok(());
        }
        let window = self.provider.context_window();
        let limit = self
            .config
            .compaction
            .threshold_override_tokens
            .map_or(window, |t| t.min(window));
        let projected = ctx.token_count().max(approx_history_tokens(ctx.history()));
        if projected + self.config.reserved_context_tokens <= limit {
            return Ok(());
        }

        debug!(projected, limit, "compacting context");
        let old_len = ctx.len();
        let summary = self.summarize_with_retry(ctx.history()).await?;
        ctx.clear()?;
        ctx.checkpoint()?;
        let message = compaction::summary_message(&summary);
        ctx.update_token_count(compaction::approx_message_tokens(&message));
        ctx.append(message)?;
        self.wire
            .publish(WireMessage::ContextCompacted {
                old_len,
                new_len: ctx.len(),
            })
            .await;
        Ok(())
    }

    /// Summarization shares the step retry policy.
    async fn summarize_with_retry(&self, history: &[Message]) -> Result<String> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.summarizer.summarize(history).await {
                Ok(summary) => return Ok(summary),
                Err(err) => {
                    let retryable = err
                        .downcast_ref::<ProviderError>()
                        .is_some_and(ProviderError::is_retryable);
                    if retryable && attempt < self.config.max_retries_per_step {
                        tokio::time::sleep(retry::backoff_delay((attempt - 1) as u32)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn check_capabilities(&self, history: &[Message], user: &Message) -> Result<()> {
        let caps = self.provider.capabilities();
        let missing = history.iter().chain(std::iter::once(user)).find_map(|m| {
            m.content.iter().find_map(|part| match part {
                ContentPart::ImageRef { .. } if !caps.vision => Some("image"),
                ContentPart::AudioRef { .. } if !caps.audio => Some("audio"),
                _ => None,
            })
        });
        if let Some(capability) = missing {
            let err = CapabilityError {
                capability,
                model: self.provider.model().to_string(),
            };
            self.wire
                .publish(WireMessage::Error {
                    kind: ErrorKind::CapabilityMismatch,
                    message: err.to_string(),
                    details: None,
                })
                .await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Forwards approval requests from tools onto the wire and blocks on
    /// resolution. `ApproveForSession` grants are remembered per action key
    /// for the rest of the run.
    fn spawn_approval_relay(
        &self,
        mut rx: mpsc::Receiver<PendingApproval>,
        grants: Arc<Mutex<HashSet<String>>>,
    ) -> JoinHandle<()> {
        let wire = Arc::clone(&self.wire);
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                let key = pending.request.session_key();
                let granted = grants
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&key);
                if granted {
                    debug!(%key, "auto-approving from session grant");
                    let _ = pending.respond.send(ApprovalDecision::Approve);
                    continue;
                }

                let id = pending.request.id.clone();
                let decision_rx = wire.request_approval(pending.request).await;
                let decision = decision_rx.await.unwrap_or(ApprovalDecision::Reject);
                if decision == ApprovalDecision::ApproveForSession {
                    grants
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key);
                }
                wire.publish(WireMessage::ApprovalResolved { id, decision })
                    .await;
                let _ = pending.respond.send(decision);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_error_message_is_actionable() {
        let err = CapabilityError {
            capability: "image",
            model: "text-only-1".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("text-only-1"));
        assert!(text.contains("image"));
        assert!(text.contains("switch models"));
    }
}
