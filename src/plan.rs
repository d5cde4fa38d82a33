//! Step plans produced by the planner and mutated by the executor.
//!
//! A [`Plan`] is an ordered list of [`PlanStep`]s with dense 1-based
//! numbering. Steps move through a small status machine:
//!
//! ```text
//! pending ─► in_progress ─► completed | failed
//!    │                          │
//!    └─► awaiting_approval ─► in_progress | skipped | failed
//!                               (failed ─► pending on retry)
//! ```
//!
//! The invariants the rest of the engine relies on:
//! - step numbers are exactly `1..=N` with no gaps;
//! - at most one step is `in_progress` at any time;
//! - at most one step is `awaiting_approval`, and only if it requires
//!   approval.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length of a recorded step result, matching what the progress
/// frames are expected to carry.
pub const RESULT_MAX_CHARS: usize = 500;

/// Lifecycle status of a single plan step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether a direct transition from `self` to `to` is legal.
    #[must_use]
    pub fn can_transition(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, AwaitingApproval)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (AwaitingApproval, InProgress)
                | (AwaitingApproval, Skipped)
                | (AwaitingApproval, Failed)
                | (AwaitingApproval, Pending)
                | (Failed, Pending)
                | (Completed, Pending)
                | (Skipped, Pending)
        )
    }

    /// Whether the step has reached a terminal state for normal execution.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::AwaitingApproval => "awaiting_approval",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Structured search result extracted from web-search tool output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub favicon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub date: Option<String>,
}

/// One unit of work within a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based, dense, monotonic within a plan.
    pub step_number: u32,
    pub description: String,
    /// Tool-id hints from the planner. Advisory: the registry authorizes.
    #[serde(default)]
    pub expected_tools: Vec<String>,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub approval_reason: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Per-step rationale captured from the executor.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rationale: Option<String>,
    /// Structured payload shown to the approver when the step suspends.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preview: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub search_hits: Option<Vec<SearchHit>>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thinking_duration_ms: Option<u64>,
}

/// Errors raised when a plan mutation would break an invariant.
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("step {step} out of range 1..={len}")]
    #[diagnostic(code(planweave::plan::step_out_of_range))]
    StepOutOfRange { step: u32, len: usize },

    #[error("illegal step transition {from} -> {to} (step {step})")]
    #[diagnostic(
        code(planweave::plan::illegal_transition),
        help("Steps only move along pending -> in_progress -> terminal, with approval and retry detours.")
    )]
    IllegalTransition {
        step: u32,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step numbers are not dense 1..=N")]
    #[diagnostic(code(planweave::plan::non_dense_numbering))]
    NonDenseNumbering,

    #[error("more than one step is {status}")]
    #[diagnostic(code(planweave::plan::duplicate_active))]
    DuplicateActive { status: StepStatus },

    #[error("step {step} is awaiting approval but does not require it")]
    #[diagnostic(code(planweave::plan::approval_without_flag))]
    ApprovalWithoutFlag { step: u32 },
}

impl PlanStep {
    fn transition(&mut self, to: StepStatus) -> Result<(), PlanError> {
        if !self.status.can_transition(to) {
            return Err(PlanError::IllegalTransition {
                step: self.step_number,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark the step as started.
    pub fn begin(&mut self) -> Result<(), PlanError> {
        self.transition(StepStatus::InProgress)
    }

    /// Mark the step completed, recording its (truncated) result text.
    pub fn complete(&mut self, result: &str, rationale: Option<String>) -> Result<(), PlanError> {
        self.transition(StepStatus::Completed)?;
        self.result = Some(truncate_chars(result, RESULT_MAX_CHARS));
        self.rationale = rationale;
        self.error = None;
        Ok(())
    }

    /// Mark the step failed, recording the error text.
    pub fn fail(&mut self, error: &str) -> Result<(), PlanError> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Park the step for human approval, attaching the preview payload.
    pub fn await_approval(&mut self, preview: Value) -> Result<(), PlanError> {
        if !self.requires_approval {
            return Err(PlanError::ApprovalWithoutFlag {
                step: self.step_number,
            });
        }
        self.transition(StepStatus::AwaitingApproval)?;
        self.preview = Some(preview);
        Ok(())
    }

    /// Skip the step on operator decision.
    pub fn skip(&mut self) -> Result<(), PlanError> {
        self.transition(StepStatus::Skipped)?;
        self.result = Some("Skipped by user".to_string());
        Ok(())
    }

    /// Reopen the step for retry, clearing any prior outcome.
    pub fn reopen(&mut self) -> Result<(), PlanError> {
        if self.status != StepStatus::Pending {
            self.transition(StepStatus::Pending)?;
        }
        self.result = None;
        self.error = None;
        self.rationale = None;
        self.preview = None;
        self.search_hits = None;
        self.tools_used.clear();
        self.thinking_duration_ms = None;
        Ok(())
    }
}

/// The complete workflow plan for one thread.
///
/// A thread holds at most one active plan; a new top-level request replaces
/// it while the message history is preserved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub original_request: String,
    /// Planner rationale ("thinking") surfaced to the client.
    pub thinking: String,
    pub steps: Vec<PlanStep>,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_summary: Option<String>,
}

/// Step description produced by the planner before numbering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    #[serde(default)]
    pub expected_tools: Vec<String>,
    pub requires_approval: bool,
    #[serde(default)]
    pub approval_reason: String,
}

impl Plan {
    /// Build a plan from planner output, assigning dense 1-based numbers.
    #[must_use]
    pub fn new(original_request: &str, thinking: &str, planned: Vec<PlannedStep>) -> Self {
        let steps = planned
            .into_iter()
            .enumerate()
            .map(|(i, p)| PlanStep {
                step_number: i as u32 + 1,
                description: p.description,
                expected_tools: p.expected_tools,
                requires_approval: p.requires_approval,
                approval_reason: if p.approval_reason.is_empty() {
                    None
                } else {
                    Some(p.approval_reason)
                },
                status: StepStatus::Pending,
                result: None,
                error: None,
                rationale: None,
                preview: None,
                search_hits: None,
                tools_used: Vec::new(),
                thinking_duration_ms: None,
            })
            .collect();
        Self {
            original_request: original_request.to_string(),
            thinking: thinking.to_string(),
            steps,
            is_complete: false,
            final_summary: None,
        }
    }

    /// Number of steps in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Borrow the step with the given 1-based number.
    pub fn step(&self, step_number: u32) -> Result<&PlanStep, PlanError> {
        self.steps
            .get(step_number.checked_sub(1).ok_or(PlanError::StepOutOfRange {
                step: step_number,
                len: self.steps.len(),
            })? as usize)
            .ok_or(PlanError::StepOutOfRange {
                step: step_number,
                len: self.steps.len(),
            })
    }

    /// Mutably borrow the step with the given 1-based number.
    pub fn step_mut(&mut self, step_number: u32) -> Result<&mut PlanStep, PlanError> {
        let len = self.steps.len();
        self.steps
            .get_mut(step_number.checked_sub(1).ok_or(PlanError::StepOutOfRange {
                step: step_number,
                len,
            })? as usize)
            .ok_or(PlanError::StepOutOfRange {
                step: step_number,
                len,
            })
    }

    /// Verify the plan invariants hold.
    pub fn check_invariants(&self) -> Result<(), PlanError> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.step_number != i as u32 + 1 {
                return Err(PlanError::NonDenseNumbering);
            }
            if step.status == StepStatus::AwaitingApproval && !step.requires_approval {
                return Err(PlanError::ApprovalWithoutFlag {
                    step: step.step_number,
                });
            }
        }
        for status in [StepStatus::InProgress, StepStatus::AwaitingApproval] {
            if self.steps.iter().filter(|s| s.status == status).count() > 1 {
                return Err(PlanError::DuplicateActive { status });
            }
        }
        Ok(())
    }

    /// Reset step `step_number` and every later step to pending for a retry.
    ///
    /// Clears completion state so a re-run is indistinguishable from a fresh
    /// run starting at that step.
    pub fn reset_from(&mut self, step_number: u32) -> Result<(), PlanError> {
        if step_number == 0 || step_number as usize > self.steps.len() {
            return Err(PlanError::StepOutOfRange {
                step: step_number,
                len: self.steps.len(),
            });
        }
        for step in self.steps.iter_mut().skip(step_number as usize - 1) {
            step.reopen()?;
        }
        self.is_complete = false;
        self.final_summary = None;
        Ok(())
    }

    /// Digest of results from steps before `current_index` (0-based), fed to
    /// the executor so later steps can use earlier outputs.
    #[must_use]
    pub fn previous_results(&self, current_index: usize) -> String {
        let mut digest = String::new();
        for step in self.steps.iter().take(current_index) {
            if let Some(result) = &step.result {
                digest.push_str(&format!("Step {}: {}\n", step.step_number, result));
            }
        }
        if digest.is_empty() {
            "None yet - this is the first step.".to_string()
        } else {
            digest
        }
    }

    /// Compose the final summary enumerating step outcomes.
    #[must_use]
    pub fn compose_summary(&self) -> String {
        let mut summary = format!(
            "Workflow complete: {} of {} steps for: {}\n\n",
            self.steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            self.steps.len(),
            self.original_request
        );
        for step in &self.steps {
            let marker = match step.status {
                StepStatus::Completed => "done",
                StepStatus::Skipped => "skipped",
                StepStatus::Failed => "failed",
                _ => "pending",
            };
            summary.push_str(&format!(
                "{}. [{}] {}\n",
                step.step_number, marker, step.description
            ));
            if let Some(result) = &step.result {
                summary.push_str(&format!("   -> {}\n", truncate_chars(result, 100)));
            }
        }
        summary
    }
}

/// Truncate to at most `max` characters on a char boundary.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
