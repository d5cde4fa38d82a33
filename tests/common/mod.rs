//! Shared helpers for integration tests: a scripted gateway, a scripted
//! tool dispatcher, and token-bag builders.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use planweave::gateway::{
    GatewayError, LlmGateway, PlanDraft, PlanRequest, StepOutcome, StepRequest,
};
use planweave::plan::PlannedStep;
use planweave::registry::{
    IntegrationTokens, ToolDescriptor, ToolDispatcher, ToolError, ToolRegistry,
};
use planweave::runtime::{RunEvents, WorkflowEvent};

/// Build a plan draft from `(description, expected_tools, requires_approval,
/// approval_reason)` tuples.
pub fn draft(steps: &[(&str, &[&str], bool, &str)]) -> PlanDraft {
    PlanDraft {
        thinking: "break the request into steps".to_string(),
        steps: steps
            .iter()
            .map(|(description, tools, requires_approval, reason)| PlannedStep {
                description: description.to_string(),
                expected_tools: tools.iter().map(|t| t.to_string()).collect(),
                requires_approval: *requires_approval,
                approval_reason: reason.to_string(),
            })
            .collect(),
    }
}

/// Tokens for every catalog integration.
pub fn all_tokens() -> IntegrationTokens {
    IntegrationTokens {
        gmail_token: Some("gmail-secret".into()),
        notion_token: Some("notion-secret".into()),
        slack_token: Some("slack-secret".into()),
        tavily_api_key: Some("tavily-secret".into()),
    }
}

/// Tokens granting only the silent web-search integration.
pub fn search_tokens() -> IntegrationTokens {
    IntegrationTokens {
        tavily_api_key: Some("tavily-secret".into()),
        ..Default::default()
    }
}

/// One recorded `plan` call.
#[derive(Clone, Debug)]
pub struct RecordedPlanCall {
    pub request: String,
    pub history_summary: Option<String>,
    pub tool_ids: Vec<String>,
}

/// Scripted gateway: pops queued plan and step responses in order, falling
/// back to a single-step plan / echo outcome when the script runs dry.
#[derive(Default)]
pub struct MockGateway {
    plans: Mutex<VecDeque<Result<PlanDraft, GatewayError>>>,
    steps: Mutex<VecDeque<Result<StepOutcome, GatewayError>>>,
    pub plan_calls: Mutex<Vec<RecordedPlanCall>>,
    pub executed_steps: Mutex<Vec<u32>>,
    pub approved_payloads: Mutex<Vec<Option<Value>>>,
    emit_tokens: bool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, plan: Result<PlanDraft, GatewayError>) -> Self {
        self.plans.lock().push_back(plan);
        self
    }

    pub fn with_step(self, step: Result<StepOutcome, GatewayError>) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    pub fn emitting_tokens(mut self) -> Self {
        self.emit_tokens = true;
        self
    }

    pub fn execute_count(&self) -> usize {
        self.executed_steps.lock().len()
    }
}

pub fn step_ok(result: &str) -> Result<StepOutcome, GatewayError> {
    Ok(StepOutcome {
        result: result.to_string(),
        ..Default::default()
    })
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn plan(
        &self,
        request: PlanRequest<'_>,
        events: &RunEvents,
    ) -> Result<PlanDraft, GatewayError> {
        self.plan_calls.lock().push(RecordedPlanCall {
            request: request.request.to_string(),
            history_summary: request.history_summary.map(str::to_string),
            tool_ids: request.tools.iter().map(|t| t.id.clone()).collect(),
        });
        let result = match self.plans.lock().pop_front() {
            Some(scripted) => scripted,
            None => Ok(draft(&[("answer the request", &[], false, "read-only")])),
        };
        // Mirror the gateway contract: rationale streams through events.
        if let Ok(draft) = &result {
            events.emit(WorkflowEvent::Thinking {
                content: draft.thinking.clone(),
                duration_hint: 1,
            });
        }
        result
    }

    async fn execute_step(
        &self,
        request: StepRequest<'_>,
        _registry: &ToolRegistry,
        events: &RunEvents,
    ) -> Result<StepOutcome, GatewayError> {
        self.executed_steps.lock().push(request.step.step_number);
        self.approved_payloads
            .lock()
            .push(request.approved_payload.cloned());
        if self.emit_tokens {
            events.token(request.step.step_number, "partial ");
            events.token(request.step.step_number, "output");
        }
        match self.steps.lock().pop_front() {
            Some(scripted) => scripted,
            None => step_ok(&format!("did: {}", request.step.description)),
        }
    }
}

/// Scripted dispatcher recording every invocation.
#[derive(Default)]
pub struct MockDispatcher {
    pub invoked: Mutex<Vec<(String, Value)>>,
    response: Option<Value>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responding(response: Value) -> Self {
        Self {
            invoked: Mutex::default(),
            response: Some(response),
        }
    }
}

#[async_trait]
impl ToolDispatcher for MockDispatcher {
    async fn invoke(
        &self,
        tool: &ToolDescriptor,
        _bearer: Option<&str>,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        self.invoked.lock().push((tool.id.clone(), arguments));
        Ok(self.response.clone().unwrap_or_else(|| json!({"ok": true})))
    }
}

/// Convenience: an `Arc` pair of gateway and the graph dependencies most
/// tests need.
pub fn gateway_arc(gateway: MockGateway) -> Arc<MockGateway> {
    Arc::new(gateway)
}
