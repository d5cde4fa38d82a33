//! The workflow service.
//!
//! One service instance fronts the graph for every thread. Per request it
//! assembles the dependencies (tool registry from tokens, the shared
//! gateway-backed graph), serializes access per thread through an advisory
//! lock, and — for streaming runs — pumps runtime events into a bounded
//! frame channel, dropping only non-canonical `token` frames when the
//! consumer falls behind.
//!
//! Resume and retry deliberately reuse the credentials cached when the
//! thread's workflow started: swapping tokens mid-flight would orphan the
//! gateway handles the in-flight workflow is keyed on.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    message::Message,
    plan::truncate_chars,
    registry::{IntegrationInfo, IntegrationTokens, ToolRegistry},
    runtime::{GraphError, ResumeDecision, RunEvents, RunOutcome, WorkflowEvent, WorkflowGraph},
    state::WorkflowState,
};

use super::frames::{Frame, PlanWire};

/// Thread titles recorded through the metadata hook are capped at this many
/// characters of the originating request.
pub const THREAD_TITLE_MAX: usize = 100;
/// Default bound of the per-request frame buffer.
pub const DEFAULT_FRAME_BUFFER: usize = 256;

/// Out-of-band hook notified once per brand-new thread.
///
/// Best-effort idempotent: implementations must let an existing record win,
/// and the service additionally dedupes per process.
#[async_trait]
pub trait ThreadMetadataHook: Send + Sync {
    async fn on_thread_started(&self, thread_id: &str, title: &str);
}

/// Default hook: records thread starts in the process log only.
pub struct LoggingMetadataHook;

#[async_trait]
impl ThreadMetadataHook for LoggingMetadataHook {
    async fn on_thread_started(&self, thread_id: &str, title: &str) {
        info!(thread = %thread_id, title = %title, "thread metadata recorded");
    }
}

/// Service-level errors, mapped onto HTTP statuses by the surface.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("{message}")]
    #[diagnostic(code(planweave::service::bad_request))]
    BadRequest { message: String },

    #[error("{message}")]
    #[diagnostic(code(planweave::service::not_found))]
    NotFound { message: String },

    #[error("{message}")]
    #[diagnostic(code(planweave::service::conflict))]
    Conflict { message: String },

    #[error("{message}")]
    #[diagnostic(code(planweave::service::internal))]
    Internal { message: String },
}

impl ServiceError {
    fn internal(err: impl std::fmt::Display) -> Self {
        ServiceError::Internal {
            message: err.to_string(),
        }
    }
}

/// Response body of the synchronous run/resume/retry operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plan: Option<PlanWire>,
    pub is_complete: bool,
}

/// Response body of the history operation: the latest checkpoint only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadHistory {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plan: Option<PlanWire>,
    pub messages: Vec<Message>,
    pub current_step_index: usize,
    pub loaded_integrations: Vec<IntegrationInfo>,
}

#[derive(Clone, Debug)]
struct ResumeReceipt {
    step_number: u32,
    action: String,
}

/// Orchestrates single requests against the shared graph.
pub struct WorkflowService {
    graph: Arc<WorkflowGraph>,
    default_tokens: IntegrationTokens,
    metadata_hook: Arc<dyn ThreadMetadataHook>,
    frame_buffer: usize,
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    credentials: Mutex<FxHashMap<String, IntegrationTokens>>,
    resume_receipts: Mutex<FxHashMap<String, ResumeReceipt>>,
    metadata_seen: Mutex<FxHashSet<String>>,
}

impl WorkflowService {
    #[must_use]
    pub fn new(
        graph: Arc<WorkflowGraph>,
        default_tokens: IntegrationTokens,
        metadata_hook: Arc<dyn ThreadMetadataHook>,
    ) -> Self {
        Self {
            graph,
            default_tokens,
            metadata_hook,
            frame_buffer: DEFAULT_FRAME_BUFFER,
            locks: Mutex::default(),
            credentials: Mutex::default(),
            resume_receipts: Mutex::default(),
            metadata_seen: Mutex::default(),
        }
    }

    /// Override the frame-buffer bound (tests exercise the drop policy with
    /// tiny buffers).
    #[must_use]
    pub fn with_frame_buffer(mut self, frame_buffer: usize) -> Self {
        self.frame_buffer = frame_buffer.max(1);
        self
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(thread_id.to_string())
            .or_default()
            .clone()
    }

    fn cache_tokens(&self, thread_id: &str, tokens: IntegrationTokens) -> IntegrationTokens {
        let merged = tokens.merged_over(&self.default_tokens);
        self.credentials
            .lock()
            .insert(thread_id.to_string(), merged.clone());
        merged
    }

    /// Tokens for resume/retry: whatever the workflow started with. No
    /// refresh here — a swap would invalidate the cached gateway handles
    /// the in-flight workflow is keyed on.
    fn cached_tokens(&self, thread_id: &str) -> IntegrationTokens {
        self.credentials
            .lock()
            .get(thread_id)
            .cloned()
            .unwrap_or_else(|| self.default_tokens.clone())
    }

    async fn ensure_metadata(&self, thread_id: &str, request: &str) {
        {
            let mut seen = self.metadata_seen.lock();
            if !seen.insert(thread_id.to_string()) {
                return;
            }
        }
        let title = truncate_chars(request, THREAD_TITLE_MAX);
        self.metadata_hook.on_thread_started(thread_id, &title).await;
    }

    async fn latest_sync_result(&self, thread_id: &str) -> Result<SyncRunResult, ServiceError> {
        let cp = self
            .graph
            .checkpointer()
            .get_latest(thread_id)
            .await
            .map_err(ServiceError::internal)?
            .ok_or_else(|| ServiceError::NotFound {
                message: format!("unknown thread {thread_id}"),
            })?;
        Ok(sync_result(thread_id, &cp.state))
    }

    /// Synchronous run: plan and execute until complete or suspended.
    #[instrument(skip(self, request, tokens), err)]
    pub async fn run(
        &self,
        request: &str,
        thread_id: Option<String>,
        tokens: IntegrationTokens,
    ) -> Result<SyncRunResult, ServiceError> {
        let thread_id = thread_id.unwrap_or_else(new_thread_id);
        let lock = self.thread_lock(&thread_id);
        let _guard = lock.lock().await;

        self.resume_receipts.lock().remove(&thread_id);
        let merged = self.cache_tokens(&thread_id, tokens);
        let mut registry = ToolRegistry::build(&merged);
        let is_new = self
            .graph
            .checkpointer()
            .get_latest(&thread_id)
            .await
            .map_err(ServiceError::internal)?
            .is_none();

        let events = RunEvents::disabled();
        match self
            .graph
            .start(&mut registry, &thread_id, request, &events)
            .await
        {
            Ok(outcome) => {
                if is_new {
                    self.ensure_metadata(&thread_id, request).await;
                }
                Ok(sync_result(&thread_id, outcome.state()))
            }
            // The failure is recorded on the step; the caller sees it in
            // the plan and may retry.
            Err(GraphError::Execution { .. }) => {
                if is_new {
                    self.ensure_metadata(&thread_id, request).await;
                }
                self.latest_sync_result(&thread_id).await
            }
            Err(err) => Err(ServiceError::internal(err)),
        }
    }

    /// Streaming run: returns the thread id and the frame stream. The
    /// workflow advances on its own task; disconnecting the receiver
    /// abandons it at the next node boundary.
    pub fn stream(
        self: &Arc<Self>,
        request: String,
        thread_id: Option<String>,
        tokens: IntegrationTokens,
    ) -> (String, mpsc::Receiver<Frame>) {
        let thread_id = thread_id.unwrap_or_else(new_thread_id);
        let (tx, rx) = mpsc::channel(self.frame_buffer);
        let service = Arc::clone(self);
        let stream_thread = thread_id.clone();
        tokio::spawn(async move {
            service.stream_inner(stream_thread, request, tokens, tx).await;
        });
        (thread_id, rx)
    }

    async fn stream_inner(
        self: Arc<Self>,
        thread_id: String,
        request: String,
        tokens: IntegrationTokens,
        tx: mpsc::Sender<Frame>,
    ) {
        let lock = self.thread_lock(&thread_id);
        let _guard = lock.lock().await;

        self.resume_receipts.lock().remove(&thread_id);
        let merged = self.cache_tokens(&thread_id, tokens);
        let mut registry = ToolRegistry::build(&merged);
        let is_new = match self.graph.checkpointer().get_latest(&thread_id).await {
            Ok(cp) => cp.is_none(),
            Err(err) => {
                let _ = tx.send(Frame::error(err)).await;
                return;
            }
        };

        let (events, event_rx) = RunEvents::channel();
        let metadata = if is_new {
            Some((Arc::clone(&self), thread_id.clone(), request.clone()))
        } else {
            None
        };
        let pump = tokio::spawn(pump_frames(event_rx, tx.clone(), metadata));

        let outcome = self
            .graph
            .start(&mut registry, &thread_id, &request, &events)
            .await;
        drop(events);
        let _ = pump.await;

        match outcome {
            Ok(RunOutcome::Complete(_)) | Ok(RunOutcome::Suspended(_)) => {
                let _ = tx.send(Frame::Done).await;
            }
            Ok(RunOutcome::Abandoned(_)) => {}
            Err(err) => {
                let _ = tx.send(Frame::error(err)).await;
            }
        }
    }

    /// Feed an approve/edit/skip decision into a suspended thread.
    ///
    /// A repeated identical decision after the first one applied returns
    /// the current plan without another transition; anything else on a
    /// thread that is not awaiting approval is a conflict.
    #[instrument(skip(self, decision), err)]
    pub async fn resume(
        &self,
        thread_id: &str,
        decision: ResumeDecision,
    ) -> Result<SyncRunResult, ServiceError> {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let tokens = self.cached_tokens(thread_id);
        let mut registry = ToolRegistry::build(&tokens);

        let latest = self
            .graph
            .checkpointer()
            .get_latest(thread_id)
            .await
            .map_err(ServiceError::internal)?;
        let Some(cp) = latest else {
            return Err(ServiceError::Conflict {
                message: format!("thread {thread_id} has no workflow state"),
            });
        };

        if !cp.state.awaiting_approval {
            let receipt = self.resume_receipts.lock().get(thread_id).cloned();
            if let Some(receipt) = receipt {
                if receipt.action == decision.kind() {
                    debug!(thread = %thread_id, action = %receipt.action, "duplicate resume deduped");
                    return Ok(sync_result(thread_id, &cp.state));
                }
            }
            return Err(ServiceError::Conflict {
                message: format!("thread {thread_id} is not awaiting approval"),
            });
        }
        let step_number =
            cp.state
                .awaiting_step_number()
                .ok_or_else(|| ServiceError::Conflict {
                    message: format!("thread {thread_id} has no step awaiting approval"),
                })?;

        let action = decision.kind().to_string();
        let events = RunEvents::disabled();
        let record_receipt = || {
            self.resume_receipts.lock().insert(
                thread_id.to_string(),
                ResumeReceipt {
                    step_number,
                    action: action.clone(),
                },
            );
        };

        match self
            .graph
            .resume(&mut registry, thread_id, decision, &events)
            .await
        {
            Ok(outcome) => {
                record_receipt();
                Ok(sync_result(thread_id, outcome.state()))
            }
            Err(GraphError::Execution { .. }) => {
                record_receipt();
                self.latest_sync_result(thread_id).await
            }
            Err(GraphError::StateMismatch { detail, .. }) => {
                Err(ServiceError::Conflict { message: detail })
            }
            Err(err) => Err(ServiceError::internal(err)),
        }
    }

    /// Reset a step (and everything after it) to pending and re-run.
    #[instrument(skip(self), err)]
    pub async fn retry(
        &self,
        thread_id: &str,
        step_number: u32,
    ) -> Result<SyncRunResult, ServiceError> {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let tokens = self.cached_tokens(thread_id);
        let mut registry = ToolRegistry::build(&tokens);
        let events = RunEvents::disabled();

        match self
            .graph
            .retry(&mut registry, thread_id, step_number, &events)
            .await
        {
            Ok(outcome) => {
                self.resume_receipts.lock().remove(thread_id);
                Ok(sync_result(thread_id, outcome.state()))
            }
            Err(GraphError::InvalidStep { step, len }) => Err(ServiceError::BadRequest {
                message: format!("step {step} outside 1..={len}"),
            }),
            Err(GraphError::NoCheckpoint { .. }) => Err(ServiceError::NotFound {
                message: format!("unknown thread {thread_id}"),
            }),
            Err(GraphError::StateMismatch { detail, .. }) => {
                Err(ServiceError::Conflict { message: detail })
            }
            Err(GraphError::Execution { .. }) => self.latest_sync_result(thread_id).await,
            Err(err) => Err(ServiceError::internal(err)),
        }
    }

    /// Latest state of a thread for history reconstruction.
    pub async fn history(&self, thread_id: &str) -> Result<ThreadHistory, ServiceError> {
        let cp = self
            .graph
            .checkpointer()
            .get_latest(thread_id)
            .await
            .map_err(ServiceError::internal)?
            .ok_or_else(|| ServiceError::NotFound {
                message: format!("unknown thread {thread_id}"),
            })?;
        Ok(ThreadHistory {
            plan: cp.state.plan.as_ref().map(PlanWire::from),
            messages: cp.state.messages.clone(),
            current_step_index: cp.state.current_step,
            loaded_integrations: cp.state.loaded_integrations.clone(),
        })
    }
}

/// Forward runtime events into the bounded frame channel.
///
/// Canonical frames wait for buffer space; `token` frames are dropped when
/// the buffer is full. A closed channel (client gone) stops the pump, which
/// in turn disconnects the graph's emitter.
async fn pump_frames(
    event_rx: flume::Receiver<WorkflowEvent>,
    tx: mpsc::Sender<Frame>,
    mut metadata: Option<(Arc<WorkflowService>, String, String)>,
) {
    while let Ok(event) = event_rx.recv_async().await {
        let is_progress = matches!(event, WorkflowEvent::Progress { .. });
        let frame = Frame::from(event);
        if frame.is_droppable() {
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("frame buffer full, dropping token frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        } else if tx.send(frame).await.is_err() {
            break;
        }
        if is_progress {
            if let Some((service, thread_id, request)) = metadata.take() {
                service.ensure_metadata(&thread_id, &request).await;
            }
        }
    }
}

fn new_thread_id() -> String {
    Uuid::new_v4().to_string()
}

fn sync_result(thread_id: &str, state: &WorkflowState) -> SyncRunResult {
    SyncRunResult {
        thread_id: thread_id.to_string(),
        plan: state.plan.as_ref().map(PlanWire::from),
        is_complete: state.is_complete,
    }
}
