//! The node sum type and the pure routing function.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    plan::StepStatus,
    registry::{ApprovalClass, ToolRegistry},
    state::WorkflowState,
};

/// The four nodes of the plan-and-execute machine.
///
/// Encoded into checkpoint metadata so a stored lineage records which
/// transition produced each snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowNode {
    /// Turns the request into a step plan.
    Planner,
    /// Decides execute / suspend / finish for the cursor step.
    Router,
    /// Runs one step against the gateway and tools.
    Executor,
    /// Composes the final assistant message.
    Synthesizer,
}

impl WorkflowNode {
    /// Persisted string form.
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            WorkflowNode::Planner => "planner",
            WorkflowNode::Router => "router",
            WorkflowNode::Executor => "executor",
            WorkflowNode::Synthesizer => "synthesizer",
        }
    }

    /// Decode a persisted string form; unknown strings map to `Router`,
    /// which is always safe to re-enter.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "planner" => WorkflowNode::Planner,
            "executor" => WorkflowNode::Executor,
            "synthesizer" => WorkflowNode::Synthesizer,
            _ => WorkflowNode::Router,
        }
    }
}

impl fmt::Display for WorkflowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Outcome of routing the cursor step.
#[derive(Clone, Debug, PartialEq)]
pub enum RouterDecision {
    /// Execute the step now, optionally with an advisory note.
    Execute {
        step_number: u32,
        advisory_note: Option<String>,
    },
    /// Suspend for human approval before the step runs.
    NeedApproval { step_number: u32, reason: String },
    /// No steps remain; hand off to the synthesizer.
    Done,
}

/// Pure routing function over the current state and the tool registry.
///
/// A step needs approval when its own flag is set or when any tool it will
/// invoke carries a mandatory approval class; advisory tools execute with a
/// note attached.
#[must_use]
pub fn route(state: &WorkflowState, registry: &ToolRegistry) -> RouterDecision {
    let Some(plan) = state.plan.as_ref() else {
        return RouterDecision::Done;
    };
    if state.current_step >= plan.len() {
        return RouterDecision::Done;
    }
    let step = &plan.steps[state.current_step];
    if step.status.is_terminal() {
        return RouterDecision::Done;
    }

    let tools = registry.tools_for(&step.expected_tools);
    let strongest = ToolRegistry::strongest_class(&tools);

    if step.requires_approval || strongest == ApprovalClass::Mandatory {
        let reason = step
            .approval_reason
            .clone()
            .or_else(|| {
                tools
                    .iter()
                    .find(|t| t.approval == ApprovalClass::Mandatory)
                    .and_then(|t| t.approval_note.clone())
            })
            .unwrap_or_else(|| "this step has external side effects".to_string());
        return RouterDecision::NeedApproval {
            step_number: step.step_number,
            reason,
        };
    }

    let advisory_note = if strongest == ApprovalClass::Advisory
        && step.status == StepStatus::Pending
    {
        tools
            .iter()
            .find(|t| t.approval == ApprovalClass::Advisory)
            .and_then(|t| t.approval_note.clone())
    } else {
        None
    };

    RouterDecision::Execute {
        step_number: step.step_number,
        advisory_note,
    }
}
