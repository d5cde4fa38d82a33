//! The single state value the graph runtime threads through every node and
//! the checkpointer persists after every transition.
//!
//! Unlike a general graph state with independently versioned channels, this
//! engine has exactly one sequential writer per thread, so the state is a
//! plain struct: the message history, the active plan, the execution cursor,
//! and the suspension flags.

use serde::{Deserialize, Serialize};

use crate::{
    message::Message,
    plan::{Plan, StepStatus},
    registry::IntegrationInfo,
};

/// Number of trailing messages summarized into the planner prompt when a
/// thread has prior turns.
pub const HISTORY_WINDOW: usize = 10;

/// Complete graph state for one thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub thread_id: String,
    /// Append-only conversation record.
    pub messages: Vec<Message>,
    /// The active plan; replaced wholesale by a new top-level request.
    pub plan: Option<Plan>,
    /// 0-based index of the next step to execute; 0 when no plan.
    pub current_step: usize,
    /// Shape-only snapshot of the loaded integrations (no secrets).
    #[serde(default)]
    pub loaded_integrations: Vec<IntegrationInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    pub awaiting_approval: bool,
    pub is_complete: bool,
}

impl WorkflowState {
    /// Fresh state for a new thread, seeded with the user's request.
    #[must_use]
    pub fn new(thread_id: &str, request: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            messages: vec![Message::user(request)],
            plan: None,
            current_step: 0,
            loaded_integrations: Vec::new(),
            last_error: None,
            awaiting_approval: false,
            is_complete: false,
        }
    }

    /// Start a new top-level request on an existing thread: the message
    /// history is preserved, the plan and cursor are reset.
    pub fn begin_request(&mut self, request: &str) {
        self.messages.push(Message::user(request));
        self.plan = None;
        self.current_step = 0;
        self.last_error = None;
        self.awaiting_approval = false;
        self.is_complete = false;
    }

    /// Append a message to the thread record.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The most recent user request, if any.
    #[must_use]
    pub fn latest_request(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.content.as_str())
    }

    /// 1-based number of the step the cursor points at, when one exists.
    #[must_use]
    pub fn current_step_number(&self) -> Option<u32> {
        let plan = self.plan.as_ref()?;
        if self.current_step < plan.len() {
            Some(self.current_step as u32 + 1)
        } else {
            None
        }
    }

    /// The step currently awaiting approval, if the thread is suspended.
    #[must_use]
    pub fn awaiting_step_number(&self) -> Option<u32> {
        let plan = self.plan.as_ref()?;
        plan.steps
            .iter()
            .find(|s| s.status == StepStatus::AwaitingApproval)
            .map(|s| s.step_number)
    }

    /// Role-prefixed digest of the last [`HISTORY_WINDOW`] messages, used by
    /// the planner when the thread has more than two prior turns so that
    /// pronouns like "that" and "those" resolve.
    #[must_use]
    pub fn history_summary(&self) -> Option<String> {
        // The trailing message is the request currently being planned.
        let prior = &self.messages[..self.messages.len().saturating_sub(1)];
        if prior.len() <= 2 {
            return None;
        }
        let start = prior.len().saturating_sub(HISTORY_WINDOW);
        let mut summary = String::new();
        for message in &prior[start..] {
            summary.push_str(&format!(
                "{}: {}\n",
                message.role,
                crate::plan::truncate_chars(&message.content, 200)
            ));
        }
        Some(summary)
    }
}
