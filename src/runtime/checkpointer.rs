//! Checkpoint model and the persistence seam.
//!
//! A checkpoint is an immutable snapshot of graph state taken after one node
//! transition. Checkpoints for a thread form a linked list through
//! `parent_checkpoint_id`; the most recent wins on read. Writes within one
//! thread are serialized: a `put` whose expected parent does not match the
//! stored head fails with [`CheckpointerError::Conflict`], which the runtime
//! surfaces as fatal to the current request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::state::WorkflowState;

/// Metadata recorded alongside each snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointMeta {
    /// Encoded name of the node whose transition produced the snapshot.
    pub node: String,
    pub created_at: DateTime<Utc>,
    /// Logical channels the transition touched (messages, plan, cursor).
    pub updated_channels: Vec<String>,
}

impl CheckpointMeta {
    #[must_use]
    pub fn new(node: &str, updated_channels: &[&str]) -> Self {
        Self {
            node: node.to_string(),
            created_at: Utc::now(),
            updated_channels: updated_channels.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Immutable snapshot of graph state after one node transition.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub state: WorkflowState,
    pub meta: CheckpointMeta,
}

/// Errors surfaced by checkpoint backends.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(
        code(planweave::checkpointer::backend),
        help("Check the database URL and that the store is reachable.")
    )]
    Backend { message: String },

    #[error(
        "checkpoint conflict for thread {thread_id}: expected head {expected:?}, found {found:?}"
    )]
    #[diagnostic(
        code(planweave::checkpointer::conflict),
        help("Another writer advanced this thread; reload the latest checkpoint.")
    )]
    Conflict {
        thread_id: String,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("checkpoint serialization error: {0}")]
    #[diagnostic(code(planweave::checkpointer::serde))]
    Serde(#[from] serde_json::Error),

    #[error("checkpointer error: {message}")]
    #[diagnostic(code(planweave::checkpointer::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Durable store of per-thread checkpoint lineages.
///
/// Guarantees: read-your-writes within a thread; `put` returns only after a
/// durable write; writes to different threads may proceed in parallel.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Append a snapshot whose parent must be the current head for the
    /// thread. Returns the new checkpoint id.
    async fn put(
        &self,
        thread_id: &str,
        parent_checkpoint_id: Option<&str>,
        state: &WorkflowState,
        meta: CheckpointMeta,
    ) -> Result<String>;

    /// The most recent checkpoint for a thread, if any.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints for a thread, newest first.
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;
}

/// Generate a fresh checkpoint identifier.
#[must_use]
pub fn new_checkpoint_id() -> String {
    format!("ckpt-{}", Uuid::new_v4())
}

/// Process-local checkpointer for development and tests.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    threads: Mutex<FxHashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn put(
        &self,
        thread_id: &str,
        parent_checkpoint_id: Option<&str>,
        state: &WorkflowState,
        meta: CheckpointMeta,
    ) -> Result<String> {
        let mut threads = self.threads.lock();
        let lineage = threads.entry(thread_id.to_string()).or_default();
        let head = lineage.last().map(|cp| cp.checkpoint_id.clone());
        if head.as_deref() != parent_checkpoint_id {
            return Err(CheckpointerError::Conflict {
                thread_id: thread_id.to_string(),
                expected: parent_checkpoint_id.map(str::to_string),
                found: head,
            });
        }
        let checkpoint_id = new_checkpoint_id();
        lineage.push(Checkpoint {
            thread_id: thread_id.to_string(),
            checkpoint_id: checkpoint_id.clone(),
            parent_checkpoint_id: parent_checkpoint_id.map(str::to_string),
            state: state.clone(),
            meta,
        });
        Ok(checkpoint_id)
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .threads
            .lock()
            .get(thread_id)
            .and_then(|lineage| lineage.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self
            .threads
            .lock()
            .get(thread_id)
            .map(|lineage| lineage.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}
