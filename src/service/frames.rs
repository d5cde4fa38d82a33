//! Client-facing wire frames.
//!
//! Each SSE frame is one `data: <json>` line whose payload is a tagged
//! [`Frame`]. Frames mirror the runtime's [`WorkflowEvent`]s plus the
//! service-emitted terminals (`error`, `done`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    plan::{Plan, SearchHit, StepStatus},
    registry::IntegrationInfo,
    runtime::{InterruptInfo, WorkflowEvent},
    state::WorkflowState,
};

/// Wire shape of one plan step inside a `progress` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepWire {
    pub step_number: u32,
    pub description: String,
    pub status: StepStatus,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub approval_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(default)]
    pub expected_tools: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub search_hits: Option<Vec<SearchHit>>,
}

/// Wire shape of the plan inside `progress` frames and sync responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanWire {
    pub thinking: String,
    pub steps: Vec<StepWire>,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_summary: Option<String>,
}

impl From<&Plan> for PlanWire {
    fn from(plan: &Plan) -> Self {
        PlanWire {
            thinking: plan.thinking.clone(),
            steps: plan
                .steps
                .iter()
                .map(|s| StepWire {
                    step_number: s.step_number,
                    description: s.description.clone(),
                    status: s.status,
                    requires_approval: s.requires_approval,
                    approval_reason: s.approval_reason.clone(),
                    result: s.result.clone(),
                    error: s.error.clone(),
                    expected_tools: s.expected_tools.clone(),
                    tools_used: s.tools_used.clone(),
                    search_hits: s.search_hits.clone(),
                })
                .collect(),
            is_complete: plan.is_complete,
            final_summary: plan.final_summary.clone(),
        }
    }
}

/// One typed event on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Thinking {
        content: String,
        duration_hint: u64,
    },
    IntegrationsReady {
        integrations: Vec<IntegrationInfo>,
    },
    IntegrationAddedIncrementally {
        integration: IntegrationInfo,
    },
    Progress {
        thread_id: String,
        current_step: usize,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        plan: Option<PlanWire>,
    },
    StepThinking {
        step_number: u32,
        content: String,
        duration_hint: u64,
    },
    Token {
        step_number: u32,
        content: String,
    },
    ApprovalRequired {
        thread_id: String,
        step_number: u32,
        interrupt: InterruptInfo,
    },
    Error {
        message: String,
    },
    Done,
}

impl Frame {
    /// Whether this frame may be dropped under backpressure. Only `token`
    /// frames are non-canonical.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(self, Frame::Token { .. })
    }

    /// Build a `progress` frame from a state snapshot.
    #[must_use]
    pub fn progress(state: &WorkflowState) -> Self {
        Frame::Progress {
            thread_id: state.thread_id.clone(),
            current_step: state.current_step,
            plan: state.plan.as_ref().map(PlanWire::from),
        }
    }

    /// Build an `error` frame from any displayable error.
    #[must_use]
    pub fn error(message: impl std::fmt::Display) -> Self {
        Frame::Error {
            message: message.to_string(),
        }
    }

    /// Serialize to the JSON carried on a `data:` line.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({"type": "error"}))
    }
}

impl From<WorkflowEvent> for Frame {
    fn from(event: WorkflowEvent) -> Self {
        match event {
            WorkflowEvent::Thinking {
                content,
                duration_hint,
            } => Frame::Thinking {
                content,
                duration_hint,
            },
            WorkflowEvent::IntegrationsReady { integrations } => {
                Frame::IntegrationsReady { integrations }
            }
            WorkflowEvent::IntegrationAdded { integration } => {
                Frame::IntegrationAddedIncrementally { integration }
            }
            WorkflowEvent::Progress { state } => Frame::progress(&state),
            WorkflowEvent::StepThinking {
                step_number,
                content,
                duration_hint,
            } => Frame::StepThinking {
                step_number,
                content,
                duration_hint,
            },
            WorkflowEvent::Token {
                step_number,
                content,
            } => Frame::Token {
                step_number,
                content,
            },
            WorkflowEvent::ApprovalRequired {
                thread_id,
                step_number,
                interrupt,
            } => Frame::ApprovalRequired {
                thread_id,
                step_number,
                interrupt,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_tag_snake_case() {
        let done = serde_json::to_value(&Frame::Done).unwrap();
        assert_eq!(done["type"], "done");

        let frame = Frame::ApprovalRequired {
            thread_id: "t".into(),
            step_number: 2,
            interrupt: InterruptInfo {
                description: "send".into(),
                reason: "mail".into(),
                preview: serde_json::json!({}),
                actions: InterruptInfo::default_actions(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "approval_required");
        assert_eq!(value["step_number"], 2);
        assert_eq!(value["interrupt"]["actions"][0], "approve");
    }

    #[test]
    fn progress_carries_plan_snapshot() {
        let mut state = WorkflowState::new("t1", "req");
        state.plan = Some(Plan::new(
            "req",
            "think",
            vec![crate::plan::PlannedStep {
                description: "step".into(),
                expected_tools: vec!["web_search".into()],
                requires_approval: false,
                approval_reason: String::new(),
            }],
        ));
        let value = Frame::progress(&state).to_json();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["thread_id"], "t1");
        assert_eq!(value["plan"]["steps"][0]["status"], "pending");
        assert_eq!(value["plan"]["is_complete"], false);
    }

    #[test]
    fn only_tokens_droppable() {
        assert!(Frame::Token {
            step_number: 1,
            content: "x".into()
        }
        .is_droppable());
        assert!(!Frame::Done.is_droppable());
        assert!(!Frame::error("boom").is_droppable());
    }
}
