//! Runtime events emitted while the graph advances.
//!
//! Nodes and the gateway emit [`WorkflowEvent`]s through a [`RunEvents`]
//! handle. The handle is cheap to clone and never blocks the graph: sends to
//! a departed consumer are ignored, and the graph probes connectivity at
//! node boundaries to abandon work for disconnected clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{registry::IntegrationInfo, state::WorkflowState};

/// Payload describing a persisted approval suspension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptInfo {
    pub description: String,
    pub reason: String,
    pub preview: Value,
    pub actions: Vec<String>,
}

impl InterruptInfo {
    /// The decision set offered to the approver.
    #[must_use]
    pub fn default_actions() -> Vec<String> {
        vec!["approve".into(), "edit".into(), "skip".into()]
    }
}

/// One event from a running workflow, in graph-transition order.
#[derive(Clone, Debug)]
pub enum WorkflowEvent {
    /// Planner rationale.
    Thinking { content: String, duration_hint: u64 },
    /// Registry built; loaded integrations announced once.
    IntegrationsReady { integrations: Vec<IntegrationInfo> },
    /// A deferred integration became available mid-stream.
    IntegrationAdded { integration: IntegrationInfo },
    /// Canonical state snapshot after a node transition.
    Progress { state: WorkflowState },
    /// Per-step rationale during execution.
    StepThinking {
        step_number: u32,
        content: String,
        duration_hint: u64,
    },
    /// Partial LLM or tool output; non-canonical, droppable.
    Token { step_number: u32, content: String },
    /// The workflow is now suspended for a human decision.
    ApprovalRequired {
        thread_id: String,
        step_number: u32,
        interrupt: InterruptInfo,
    },
}

impl WorkflowEvent {
    /// Whether consumers may drop this event under backpressure.
    ///
    /// Only `token` is droppable; everything else is canonical protocol.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(self, WorkflowEvent::Token { .. })
    }
}

/// Emission handle threaded through graph nodes and the gateway.
#[derive(Clone, Debug)]
pub struct RunEvents {
    tx: Option<flume::Sender<WorkflowEvent>>,
}

impl RunEvents {
    /// Create a connected handle and its receiving side.
    #[must_use]
    pub fn channel() -> (Self, flume::Receiver<WorkflowEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A handle that swallows every event (synchronous endpoints).
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Whether a consumer is still attached. Disabled handles report
    /// connected so synchronous runs are never abandoned.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match &self.tx {
            Some(tx) => !tx.is_disconnected(),
            None => true,
        }
    }

    /// Emit an event; a departed consumer is not an error.
    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Emit a partial-output token for a step.
    pub fn token(&self, step_number: u32, content: impl Into<String>) {
        self.emit(WorkflowEvent::Token {
            step_number,
            content: content.into(),
        });
    }

    /// Emit per-step rationale.
    pub fn step_thinking(&self, step_number: u32, content: impl Into<String>, duration_hint: u64) {
        self.emit(WorkflowEvent::StepThinking {
            step_number,
            content: content.into(),
            duration_hint,
        });
    }
}
