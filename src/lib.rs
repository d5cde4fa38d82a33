//! ```text
//! HTTP surface ──► WorkflowService ──► WorkflowGraph
//!                    │                   │
//!                    │                   ├─► planner ─► router ⇄ executor ─► synthesizer
//!                    │                   │                │
//!                    │                   │                ├─► LlmGateway (plan / execute_step)
//!                    │                   │                └─► ToolRegistry + ToolDispatcher
//!                    │                   │
//!                    │                   └─► Checkpointer (SQLite / InMemory)
//!                    │
//!                    └─► SSE frames (thinking / progress / token / approval_required / done)
//! ```
//!
//! Planweave turns a natural-language request into an ordered step plan,
//! executes the steps against external tool integrations, pauses for human
//! approval at sensitive steps, and streams fine-grained progress to the
//! caller. Every node transition is checkpointed per thread, so an
//! interrupted workflow resumes from the exact step where control was handed
//! back to the operator.

pub mod config;
pub mod gateway;
pub mod message;
pub mod plan;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod service;
pub mod state;
