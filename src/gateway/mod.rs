//! LLM gateway: the narrow interface every model call goes through.
//!
//! Two operations cover the engine's needs: structured plan generation and
//! step execution with an optional tool-call loop. Both stream partials
//! through the run-event handle while they work — `plan` emits planner
//! rationale (`thinking`) as it is produced, `execute_step` emits `token`
//! events — and return a final structured result. Transient provider
//! failures are retried with exponential backoff to a finite cap;
//! schema-invalid planner output is retried with a corrective prompt before
//! failing.

pub mod gemini;
pub mod types;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::{
    message::Message,
    plan::{PlanStep, PlannedStep, SearchHit},
    registry::{ToolDescriptor, ToolError, ToolRegistry},
    runtime::event::RunEvents,
};

pub use gemini::GeminiGateway;

/// Bounded retry budget for schema-invalid planner output.
pub const PLAN_SCHEMA_ATTEMPTS: u32 = 3;
/// Bounded retry budget for transient provider errors.
pub const TRANSIENT_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between transient retries.
pub const BACKOFF_BASE_MS: u64 = 200;
/// Hard cap on tool-call iterations within one step.
pub const TOOL_LOOP_CAP: usize = 10;

/// Inputs to plan generation.
pub struct PlanRequest<'a> {
    pub request: &'a str,
    /// Digest of recent turns, present when the thread has history.
    pub history_summary: Option<&'a str>,
    /// Tools the caller is authorized to use, as planning hints.
    pub tools: &'a [ToolDescriptor],
}

/// Schema-valid planner output.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanDraft {
    pub thinking: String,
    pub steps: Vec<PlannedStep>,
}

/// Inputs to step execution.
pub struct StepRequest<'a> {
    pub step: &'a PlanStep,
    pub total_steps: usize,
    pub previous_results: &'a str,
    pub tools: &'a [ToolDescriptor],
    /// Operator-substituted content from an `edit` resume decision.
    pub approved_payload: Option<&'a Value>,
    /// Note attached by the router for advisory-class tools.
    pub advisory_note: Option<&'a str>,
}

/// Final structured result of one step execution.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub result: String,
    pub rationale: Option<String>,
    pub tools_used: Vec<String>,
    pub search_hits: Option<Vec<SearchHit>>,
    /// Tool-output messages to append to the thread record.
    pub tool_messages: Vec<Message>,
}

/// Errors from gateway operations.
#[derive(Debug, Error, Diagnostic)]
pub enum GatewayError {
    #[error("planner produced no schema-valid plan after {attempts} attempts: {message}")]
    #[diagnostic(
        code(planweave::gateway::schema),
        help("The model repeatedly returned output that does not match the plan schema.")
    )]
    Schema { attempts: u32, message: String },

    #[error("provider error (status {status}): {message}")]
    #[diagnostic(code(planweave::gateway::provider))]
    Provider { status: u16, message: String },

    #[error("network error: {0}")]
    #[diagnostic(code(planweave::gateway::network))]
    Network(String),

    #[error("call timed out after {seconds}s")]
    #[diagnostic(code(planweave::gateway::timeout))]
    Timeout { seconds: u64 },

    #[error(transparent)]
    #[diagnostic(code(planweave::gateway::tool))]
    Tool(#[from] ToolError),

    #[error("malformed provider response: {0}")]
    #[diagnostic(code(planweave::gateway::malformed))]
    Malformed(String),
}

impl GatewayError {
    /// Whether a retry with backoff could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Timeout { .. } => true,
            GatewayError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// The seam every LLM call goes through. Implementations are shared across
/// requests and must be cheap to clone behind an `Arc`.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Generate a schema-valid plan for the request.
    ///
    /// Implementations emit the planner's rationale through `events` as
    /// thinking frames while the plan streams; the returned draft carries
    /// the complete text. Clients aggregate thinking deltas the same way
    /// they aggregate tokens.
    async fn plan(
        &self,
        request: PlanRequest<'_>,
        events: &RunEvents,
    ) -> Result<PlanDraft, GatewayError>;

    /// Execute one step, optionally looping through tool calls (bounded by
    /// [`TOOL_LOOP_CAP`]). Partial output streams through `events` as
    /// `token` events. The registry supplies bearer tokens for dispatch.
    async fn execute_step(
        &self,
        request: StepRequest<'_>,
        registry: &ToolRegistry,
        events: &RunEvents,
    ) -> Result<StepOutcome, GatewayError>;
}

/// Run `op` with exponential backoff on transient errors, up to
/// [`TRANSIENT_ATTEMPTS`] attempts. Permanent errors surface immediately.
pub(crate) async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < TRANSIENT_ATTEMPTS => {
                let delay = BACKOFF_BASE_MS << attempt;
                tracing::debug!(attempt, delay_ms = delay, error = %err, "transient gateway error, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_transient_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_at_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Timeout { seconds: 1 }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), TRANSIENT_ATTEMPTS);
    }

    #[tokio::test]
    async fn permanent_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::Provider {
                    status: 401,
                    message: "bad key".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
