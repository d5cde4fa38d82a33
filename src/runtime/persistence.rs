//! Serde-facing persistence models for checkpoints.
//!
//! Explicit persisted shapes decoupled from the in-memory types keep the
//! durable backends lean: they move JSON strings in and out of columns while
//! conversion logic lives here. This module performs no I/O.

use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::checkpointer::{Checkpoint, CheckpointMeta};
use crate::state::WorkflowState;

/// Metadata column shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedMeta {
    pub node: String,
    #[serde(default)]
    pub updated_channels: Vec<String>,
}

/// Full persisted checkpoint row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCheckpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_checkpoint_id: Option<String>,
    pub state: WorkflowState,
    pub meta: PersistedMeta,
    /// RFC3339 creation time (keeps `chrono::DateTime` out of the stored
    /// shape).
    pub created_at: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(
        code(planweave::persistence::serde),
        help("Ensure the stored JSON matches the Persisted* shapes.")
    )]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(cp: &Checkpoint) -> Self {
        PersistedCheckpoint {
            thread_id: cp.thread_id.clone(),
            checkpoint_id: cp.checkpoint_id.clone(),
            parent_checkpoint_id: cp.parent_checkpoint_id.clone(),
            state: cp.state.clone(),
            meta: PersistedMeta {
                node: cp.meta.node.clone(),
                updated_channels: cp.meta.updated_channels.clone(),
            },
            created_at: cp.meta.created_at.to_rfc3339(),
        }
    }
}

impl From<PersistedCheckpoint> for Checkpoint {
    fn from(p: PersistedCheckpoint) -> Self {
        let created_at = chrono::DateTime::parse_from_rfc3339(&p.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Checkpoint {
            thread_id: p.thread_id,
            checkpoint_id: p.checkpoint_id,
            parent_checkpoint_id: p.parent_checkpoint_id,
            state: p.state,
            meta: CheckpointMeta {
                node: p.meta.node,
                created_at,
                updated_channels: p.meta.updated_channels,
            },
        }
    }
}

/// Serialize a value into the JSON text stored in a column.
pub fn to_column<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize column JSON text.
pub fn from_column<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::checkpointer::new_checkpoint_id;

    #[test]
    fn checkpoint_roundtrips_through_persisted_shape() {
        let cp = Checkpoint {
            thread_id: "t1".into(),
            checkpoint_id: new_checkpoint_id(),
            parent_checkpoint_id: Some("ckpt-parent".into()),
            state: WorkflowState::new("t1", "hello"),
            meta: CheckpointMeta::new("planner", &["messages", "plan"]),
        };
        let persisted = PersistedCheckpoint::from(&cp);
        let text = to_column(&persisted).unwrap();
        let back: PersistedCheckpoint = from_column(&text).unwrap();
        let restored = Checkpoint::from(back);
        assert_eq!(restored.checkpoint_id, cp.checkpoint_id);
        assert_eq!(restored.parent_checkpoint_id, cp.parent_checkpoint_id);
        assert_eq!(restored.state, cp.state);
        assert_eq!(restored.meta.node, "planner");
        assert_eq!(restored.meta.updated_channels, vec!["messages", "plan"]);
    }

    #[test]
    fn bad_created_at_falls_back_to_now() {
        let mut persisted = PersistedCheckpoint::from(&Checkpoint {
            thread_id: "t1".into(),
            checkpoint_id: "c1".into(),
            parent_checkpoint_id: None,
            state: WorkflowState::new("t1", "x"),
            meta: CheckpointMeta::new("router", &[]),
        });
        persisted.created_at = "not-a-date".into();
        let restored = Checkpoint::from(persisted);
        assert_eq!(restored.meta.node, "router");
    }
}
