//! Workflow service: mediates between the HTTP surface and the graph
//! runtime, translating runtime events into the SSE frame protocol.

pub mod frames;
pub mod workflow;

pub use frames::{Frame, PlanWire, StepWire};
pub use workflow::{
    LoggingMetadataHook, ServiceError, SyncRunResult, ThreadHistory, ThreadMetadataHook,
    WorkflowService,
};
