//! Workflow runtime: the fixed plan-and-execute state machine and the
//! checkpoint persistence behind it.
//!
//! The runtime is deliberately not a general graph engine. The only loop in
//! the system is executor → router → executor, so the machine is a sum type
//! of four nodes ([`WorkflowNode`]) plus a pure routing function, driven by
//! [`WorkflowGraph`]. Every node transition persists a [`Checkpoint`] before
//! any event describing it is emitted, and human-approval suspensions are
//! persisted in state rather than held as in-memory continuations.

pub mod checkpointer;
pub mod checkpointer_sqlite;
pub mod event;
pub mod graph;
pub mod node;
pub mod persistence;

pub use checkpointer::{
    Checkpoint, CheckpointMeta, Checkpointer, CheckpointerError, InMemoryCheckpointer,
};
pub use checkpointer_sqlite::SqliteCheckpointer;
pub use event::{InterruptInfo, RunEvents, WorkflowEvent};
pub use graph::{GraphError, ResumeDecision, RunOutcome, WorkflowGraph};
pub use node::{route, RouterDecision, WorkflowNode};
