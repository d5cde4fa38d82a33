//! HTTP surface: a thin axum adapter over the workflow service.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::service::WorkflowService;

/// Build the router exposing the five chat endpoints.
pub fn router(service: Arc<WorkflowService>) -> Router {
    Router::new()
        .route("/chat", post(handlers::chat))
        .route("/chat/stream", post(handlers::chat_stream))
        .route("/chat/resume", post(handlers::chat_resume))
        .route("/chat/retry", post(handlers::chat_retry))
        .route("/chat/history/{thread_id}", get(handlers::chat_history))
        .with_state(service)
}
