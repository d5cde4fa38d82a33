//! The plan-and-execute state machine driver.
//!
//! One `WorkflowGraph` serves every thread. Each entry point (fresh run,
//! resume, retry) loads or builds a [`WorkflowState`], then advances the
//! machine transition by transition. After every transition the state is
//! checkpointed, and only once the write has durably committed is the
//! corresponding progress event emitted.
//!
//! Approval suspensions are persisted in state: when the router parks a step
//! as `awaiting_approval` the graph checkpoints, emits the interrupt, and
//! returns. Nothing stays resident in memory while the operator decides;
//! resume rehydrates from the latest checkpoint and starts a fresh
//! transition.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use miette::Diagnostic;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    gateway::{GatewayError, LlmGateway, PlanRequest, StepRequest},
    message::Message,
    plan::{truncate_chars, Plan, PlanError},
    registry::ToolRegistry,
    state::WorkflowState,
};

use super::{
    checkpointer::{CheckpointMeta, Checkpointer, CheckpointerError},
    event::{InterruptInfo, RunEvents, WorkflowEvent},
    node::{route, RouterDecision, WorkflowNode},
};

/// How a graph run ended.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// The synthesizer ran; the plan is complete.
    Complete(WorkflowState),
    /// A step is awaiting a human decision; the thread is suspended.
    Suspended(WorkflowState),
    /// The client disconnected; the last transition was checkpointed and
    /// further work abandoned.
    Abandoned(WorkflowState),
}

impl RunOutcome {
    /// The state the run ended with.
    #[must_use]
    pub fn state(&self) -> &WorkflowState {
        match self {
            RunOutcome::Complete(s) | RunOutcome::Suspended(s) | RunOutcome::Abandoned(s) => s,
        }
    }
}

/// Operator decision fed into a suspended thread.
#[derive(Clone, Debug)]
pub enum ResumeDecision {
    Approve,
    /// Approve with substituted content the executor must use.
    Edit(Value),
    Skip,
}

impl ResumeDecision {
    /// Stable name for logs and idempotence receipts.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ResumeDecision::Approve => "approve",
            ResumeDecision::Edit(_) => "edit",
            ResumeDecision::Skip => "skip",
        }
    }
}

/// Errors surfaced by graph runs.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("planner failed: {message}")]
    #[diagnostic(
        code(planweave::graph::planner),
        help("The thread is unchanged and remains usable for a new request.")
    )]
    Planner { message: String },

    #[error("step {step} failed: {message}")]
    #[diagnostic(
        code(planweave::graph::execution),
        help("The step is recorded as failed; retry it via the retry endpoint.")
    )]
    Execution { step: u32, message: String },

    #[error(transparent)]
    #[diagnostic(code(planweave::graph::checkpointer))]
    Checkpointer(#[from] CheckpointerError),

    #[error(transparent)]
    #[diagnostic(code(planweave::graph::plan))]
    Plan(#[from] PlanError),

    #[error("thread {thread_id} is in an incompatible state: {detail}")]
    #[diagnostic(code(planweave::graph::state_mismatch))]
    StateMismatch { thread_id: String, detail: String },

    #[error("step {step} outside 1..={len}")]
    #[diagnostic(code(planweave::graph::invalid_step))]
    InvalidStep { step: u32, len: usize },

    #[error("no checkpoint for thread {thread_id}")]
    #[diagnostic(code(planweave::graph::no_checkpoint))]
    NoCheckpoint { thread_id: String },
}

/// The state machine driver shared across threads.
pub struct WorkflowGraph {
    gateway: Arc<dyn LlmGateway>,
    checkpointer: Arc<dyn Checkpointer>,
    step_timeout: Duration,
}

impl WorkflowGraph {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        checkpointer: Arc<dyn Checkpointer>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            checkpointer,
            step_timeout,
        }
    }

    /// The checkpoint store this graph writes through.
    #[must_use]
    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// Run a top-level request: plan it, then drive execution until the
    /// plan completes or suspends for approval.
    ///
    /// An existing thread keeps its message history; the plan is replaced.
    #[instrument(skip(self, registry, request, events), err)]
    pub async fn start(
        &self,
        registry: &mut ToolRegistry,
        thread_id: &str,
        request: &str,
        events: &RunEvents,
    ) -> Result<RunOutcome, GraphError> {
        let existing = self.checkpointer.get_latest(thread_id).await?;
        let (mut state, mut head) = match existing {
            Some(cp) => {
                let mut state = cp.state;
                state.begin_request(request);
                (state, Some(cp.checkpoint_id))
            }
            None => (WorkflowState::new(thread_id, request), None),
        };

        // Planner transition. The gateway streams planner rationale through
        // `events` while it works, so thinking frames precede everything
        // emitted here.
        let started = Instant::now();
        let integrations = registry.load_for_request(request);
        let tools = registry.tools_for(&[]);
        let summary = state.history_summary();
        let draft = self
            .gateway
            .plan(
                PlanRequest {
                    request,
                    history_summary: summary.as_deref(),
                    tools: &tools,
                },
                events,
            )
            .await
            .map_err(|e| GraphError::Planner {
                message: e.to_string(),
            })?;

        events.emit(WorkflowEvent::IntegrationsReady {
            integrations: integrations.clone(),
        });

        let plan = Plan::new(request, &draft.thinking, draft.steps);
        let mut announcement = format!("Workflow plan created for: {request}\n");
        for step in &plan.steps {
            announcement.push_str(&format!(
                "{}. {}{}\n",
                step.step_number,
                if step.requires_approval {
                    "[needs approval] "
                } else {
                    ""
                },
                step.description
            ));
        }
        state.plan = Some(plan);
        state.current_step = 0;
        state.loaded_integrations = integrations;
        state.push_message(Message::assistant(&announcement));

        self.commit(
            &mut head,
            &state,
            WorkflowNode::Planner,
            &["messages", "plan", "cursor"],
            started,
            events,
        )
        .await?;

        self.drive(registry, state, head, events).await
    }

    /// Feed an operator decision into a suspended thread and continue.
    #[instrument(skip(self, registry, decision, events), err)]
    pub async fn resume(
        &self,
        registry: &mut ToolRegistry,
        thread_id: &str,
        decision: ResumeDecision,
        events: &RunEvents,
    ) -> Result<RunOutcome, GraphError> {
        let cp = self
            .checkpointer
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| GraphError::NoCheckpoint {
                thread_id: thread_id.to_string(),
            })?;
        let mut state = cp.state;
        let mut head = Some(cp.checkpoint_id);

        if !state.awaiting_approval {
            return Err(GraphError::StateMismatch {
                thread_id: thread_id.to_string(),
                detail: "thread is not awaiting approval".to_string(),
            });
        }
        let step_number =
            state
                .awaiting_step_number()
                .ok_or_else(|| GraphError::StateMismatch {
                    thread_id: thread_id.to_string(),
                    detail: "awaiting flag set but no step is parked".to_string(),
                })?;
        registry.load_from_snapshot(&state.loaded_integrations);
        info!(thread = %thread_id, step = step_number, decision = decision.kind(), "resuming");

        match decision {
            ResumeDecision::Skip => {
                let started = Instant::now();
                let plan = state.plan.as_mut().expect("awaiting thread has a plan");
                plan.step_mut(step_number)?.skip()?;
                state.current_step += 1;
                state.awaiting_approval = false;
                self.commit(
                    &mut head,
                    &state,
                    WorkflowNode::Router,
                    &["plan", "cursor"],
                    started,
                    events,
                )
                .await?;
                self.drive(registry, state, head, events).await
            }
            ResumeDecision::Approve => {
                self.execute(registry, &mut state, &mut head, step_number, None, None, events)
                    .await?;
                self.drive(registry, state, head, events).await
            }
            ResumeDecision::Edit(payload) => {
                self.execute(
                    registry,
                    &mut state,
                    &mut head,
                    step_number,
                    None,
                    Some(payload),
                    events,
                )
                .await?;
                self.drive(registry, state, head, events).await
            }
        }
    }

    /// Reset step `step_number` and everything after it, then re-enter the
    /// router from the step before it.
    #[instrument(skip(self, registry, events), err)]
    pub async fn retry(
        &self,
        registry: &mut ToolRegistry,
        thread_id: &str,
        step_number: u32,
        events: &RunEvents,
    ) -> Result<RunOutcome, GraphError> {
        let cp = self
            .checkpointer
            .get_latest(thread_id)
            .await?
            .ok_or_else(|| GraphError::NoCheckpoint {
                thread_id: thread_id.to_string(),
            })?;
        let mut state = cp.state;
        let mut head = Some(cp.checkpoint_id);

        let Some(plan) = state.plan.as_mut() else {
            return Err(GraphError::StateMismatch {
                thread_id: thread_id.to_string(),
                detail: "thread has no plan to retry".to_string(),
            });
        };
        let len = plan.len();
        if step_number == 0 || step_number as usize > len {
            return Err(GraphError::InvalidStep {
                step: step_number,
                len,
            });
        }

        let started = Instant::now();
        plan.reset_from(step_number)?;
        state.current_step = step_number as usize - 1;
        state.awaiting_approval = false;
        state.is_complete = false;
        state.last_error = None;
        registry.load_from_snapshot(&state.loaded_integrations);
        info!(thread = %thread_id, step = step_number, "retrying from step");

        self.commit(
            &mut head,
            &state,
            WorkflowNode::Router,
            &["plan", "cursor"],
            started,
            events,
        )
        .await?;
        self.drive(registry, state, head, events).await
    }

    /// Advance router/executor transitions until done, suspended, failed,
    /// or abandoned.
    async fn drive(
        &self,
        registry: &mut ToolRegistry,
        mut state: WorkflowState,
        mut head: Option<String>,
        events: &RunEvents,
    ) -> Result<RunOutcome, GraphError> {
        loop {
            // Cancellation is cooperative at node boundaries: the committed
            // work stands, further transitions are abandoned.
            if !events.is_connected() {
                warn!(thread = %state.thread_id, "client gone, abandoning after last checkpoint");
                return Ok(RunOutcome::Abandoned(state));
            }

            // Resolve the cursor step's hints before routing so a hint into
            // a credentialed-but-unloaded integration widens the registry.
            if state.current_step_number().is_some() {
                let hints =
                    state.plan.as_ref().expect("cursor implies plan").steps[state.current_step]
                        .expected_tools
                        .clone();
                for hint in &hints {
                    if let Some(integration) = registry.load_incrementally(hint) {
                        state.loaded_integrations = registry.snapshot();
                        events.emit(WorkflowEvent::IntegrationAdded { integration });
                    }
                }
            }

            match route(&state, registry) {
                RouterDecision::Done => return self.synthesize(state, head, events).await,
                RouterDecision::NeedApproval {
                    step_number,
                    reason,
                } => {
                    let started = Instant::now();
                    let thread_id = state.thread_id.clone();
                    let context = {
                        let plan = state.plan.as_ref().expect("routing implies plan");
                        truncate_chars(&plan.previous_results(state.current_step), 500)
                    };
                    let plan = state.plan.as_mut().expect("routing implies plan");
                    let step = plan.step_mut(step_number)?;
                    if step.approval_reason.is_none() {
                        step.approval_reason = Some(reason.clone());
                    }
                    // Mandatory tools force approval even when the planner
                    // did not flag the step.
                    step.requires_approval = true;
                    let description = step.description.clone();
                    let preview = json!({
                        "description": description.clone(),
                        "expected_tools": step.expected_tools.clone(),
                        "context": context,
                    });
                    step.await_approval(preview.clone())?;
                    state.awaiting_approval = true;

                    self.commit(
                        &mut head,
                        &state,
                        WorkflowNode::Router,
                        &["plan"],
                        started,
                        events,
                    )
                    .await?;
                    events.emit(WorkflowEvent::ApprovalRequired {
                        thread_id,
                        step_number,
                        interrupt: InterruptInfo {
                            description,
                            reason,
                            preview,
                            actions: InterruptInfo::default_actions(),
                        },
                    });
                    return Ok(RunOutcome::Suspended(state));
                }
                RouterDecision::Execute {
                    step_number,
                    advisory_note,
                } => {
                    self.execute(
                        registry,
                        &mut state,
                        &mut head,
                        step_number,
                        advisory_note,
                        None,
                        events,
                    )
                    .await?;
                }
            }
        }
    }

    /// Executor node: run one step through the gateway.
    ///
    /// Checkpoints twice: once when the step enters `in_progress`, once with
    /// its outcome. On failure the cursor stays put and the error propagates
    /// after the failure checkpoint commits.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        registry: &ToolRegistry,
        state: &mut WorkflowState,
        head: &mut Option<String>,
        step_number: u32,
        advisory_note: Option<String>,
        approved_payload: Option<Value>,
        events: &RunEvents,
    ) -> Result<(), GraphError> {
        let started = Instant::now();
        {
            let plan = state.plan.as_mut().expect("execute implies plan");
            plan.step_mut(step_number)?.begin()?;
        }
        state.awaiting_approval = false;
        self.commit(head, state, WorkflowNode::Executor, &["plan"], started, events)
            .await?;

        let (step_clone, total_steps, previous_results) = {
            let plan = state.plan.as_ref().expect("execute implies plan");
            (
                plan.step(step_number)?.clone(),
                plan.len(),
                plan.previous_results(state.current_step),
            )
        };
        events.step_thinking(
            step_number,
            format!("Executing step {step_number}: {}", step_clone.description),
            1,
        );
        let tools = registry.tools_for(&step_clone.expected_tools);

        let exec_started = Instant::now();
        let request = StepRequest {
            step: &step_clone,
            total_steps,
            previous_results: &previous_results,
            tools: &tools,
            approved_payload: approved_payload.as_ref(),
            advisory_note: advisory_note.as_deref(),
        };
        let outcome = match tokio::time::timeout(
            self.step_timeout,
            self.gateway.execute_step(request, registry, events),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return self.fail_step(state, head, step_number, err, events).await,
            Err(_) => {
                let err = GatewayError::Timeout {
                    seconds: self.step_timeout.as_secs(),
                };
                return self.fail_step(state, head, step_number, err, events).await;
            }
        };

        let thinking_ms = exec_started.elapsed().as_millis() as u64;
        for message in &outcome.tool_messages {
            state.push_message(message.clone());
        }
        {
            let plan = state.plan.as_mut().expect("execute implies plan");
            let step = plan.step_mut(step_number)?;
            step.complete(
                &outcome.result,
                outcome.rationale.clone().or(advisory_note),
            )?;
            step.tools_used = outcome.tools_used;
            step.search_hits = outcome.search_hits;
            step.thinking_duration_ms = Some(thinking_ms);
        }
        state.push_message(Message::assistant(&outcome.result));
        state.current_step += 1;
        state.last_error = None;

        self.commit(
            head,
            state,
            WorkflowNode::Executor,
            &["messages", "plan", "cursor"],
            started,
            events,
        )
        .await
    }

    /// Record a step failure: mark failed, checkpoint, propagate. The
    /// cursor does not advance.
    async fn fail_step(
        &self,
        state: &mut WorkflowState,
        head: &mut Option<String>,
        step_number: u32,
        err: GatewayError,
        events: &RunEvents,
    ) -> Result<(), GraphError> {
        let message = err.to_string();
        let started = Instant::now();
        {
            let plan = state.plan.as_mut().expect("execute implies plan");
            plan.step_mut(step_number)?.fail(&message)?;
        }
        state.last_error = Some(message.clone());
        self.commit(head, state, WorkflowNode::Executor, &["plan"], started, events)
            .await?;
        Err(GraphError::Execution {
            step: step_number,
            message,
        })
    }

    /// Synthesizer node: compose the final assistant message and mark the
    /// plan complete.
    async fn synthesize(
        &self,
        mut state: WorkflowState,
        mut head: Option<String>,
        events: &RunEvents,
    ) -> Result<RunOutcome, GraphError> {
        let started = Instant::now();
        let Some(plan) = state.plan.as_mut() else {
            return Err(GraphError::StateMismatch {
                thread_id: state.thread_id.clone(),
                detail: "nothing to synthesize: thread has no plan".to_string(),
            });
        };
        let summary = plan.compose_summary();
        plan.final_summary = Some(summary.clone());
        plan.is_complete = true;
        state.is_complete = true;
        state.awaiting_approval = false;
        state.push_message(Message::assistant(&summary));

        self.commit(
            &mut head,
            &state,
            WorkflowNode::Synthesizer,
            &["messages", "plan"],
            started,
            events,
        )
        .await?;
        Ok(RunOutcome::Complete(state))
    }

    /// Persist one transition's snapshot, then emit the progress event.
    ///
    /// The emit strictly follows the durable write, which gives every frame
    /// a happens-before relationship with its checkpoint.
    async fn commit(
        &self,
        head: &mut Option<String>,
        state: &WorkflowState,
        node: WorkflowNode,
        updated_channels: &[&str],
        started: Instant,
        events: &RunEvents,
    ) -> Result<(), GraphError> {
        if let Some(plan) = &state.plan {
            plan.check_invariants()?;
        }
        let checkpoint_id = self
            .checkpointer
            .put(
                &state.thread_id,
                head.as_deref(),
                state,
                CheckpointMeta::new(node.encode(), updated_channels),
            )
            .await?;
        info!(
            thread = %state.thread_id,
            checkpoint = %checkpoint_id,
            node = %node,
            duration_ms = started.elapsed().as_millis() as u64,
            status = "committed",
            "graph transition"
        );
        *head = Some(checkpoint_id);
        events.emit(WorkflowEvent::Progress {
            state: state.clone(),
        });
        Ok(())
    }
}
