//! Endpoint handlers and request schemas.
//!
//! Bodies are deserialized into permissive option-typed schemas and
//! validated by hand so schema-invalid input maps to 400 rather than a
//! framework rejection.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    registry::IntegrationTokens,
    runtime::ResumeDecision,
    service::{ServiceError, SyncRunResult, ThreadHistory, WorkflowService},
};

/// Error response carrying the mapped status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Conflict { .. } => StatusCode::CONFLICT,
            ServiceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Body of `/chat` and `/chat/stream`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub request: Option<String>,
    pub thread_id: Option<String>,
    pub gmail_token: Option<String>,
    pub notion_token: Option<String>,
    pub slack_token: Option<String>,
    pub tavily_api_key: Option<String>,
}

impl ChatRequest {
    fn request_text(&self) -> Result<String, ApiError> {
        match self.request.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(ApiError::bad_request("request is required")),
        }
    }

    fn tokens(&self) -> IntegrationTokens {
        IntegrationTokens {
            gmail_token: self.gmail_token.clone(),
            notion_token: self.notion_token.clone(),
            slack_token: self.slack_token.clone(),
            tavily_api_key: self.tavily_api_key.clone(),
        }
    }
}

/// Body of `/chat/resume`.
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub thread_id: Option<String>,
    pub action: Option<String>,
    pub content: Option<Value>,
}

/// Body of `/chat/retry`.
#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub thread_id: Option<String>,
    pub step_number: Option<u32>,
}

pub async fn chat(
    State(service): State<Arc<WorkflowService>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<SyncRunResult>, ApiError> {
    let request = body.request_text()?;
    let result = service
        .run(&request, body.thread_id.clone(), body.tokens())
        .await?;
    Ok(Json(result))
}

pub async fn chat_stream(
    State(service): State<Arc<WorkflowService>>,
    Json(body): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.request_text()?;
    let (_thread_id, mut rx) = service.stream(request, body.thread_id.clone(), body.tokens());

    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>,
    > = Box::pin(async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            let payload = serde_json::to_string(&frame).unwrap_or_default();
            yield Ok(SseEvent::default().data(payload));
        }
    });

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

pub async fn chat_resume(
    State(service): State<Arc<WorkflowService>>,
    Json(body): Json<ResumeRequest>,
) -> Result<Json<SyncRunResult>, ApiError> {
    let thread_id = body
        .thread_id
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("thread_id is required"))?;
    let decision = match body.action.as_deref() {
        Some("approve") => ResumeDecision::Approve,
        Some("edit") => ResumeDecision::Edit(body.content.clone().unwrap_or_else(|| json!({}))),
        Some("skip") => ResumeDecision::Skip,
        _ => {
            return Err(ApiError::bad_request(
                "action must be one of approve, edit, skip",
            ))
        }
    };
    let result = service.resume(thread_id, decision).await?;
    Ok(Json(result))
}

pub async fn chat_retry(
    State(service): State<Arc<WorkflowService>>,
    Json(body): Json<RetryRequest>,
) -> Result<Json<SyncRunResult>, ApiError> {
    let thread_id = body
        .thread_id
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("thread_id is required"))?;
    let step_number = body
        .step_number
        .ok_or_else(|| ApiError::bad_request("step_number is required"))?;
    if step_number == 0 {
        return Err(ApiError::bad_request("step_number is 1-based"));
    }
    let result = service.retry(thread_id, step_number).await?;
    Ok(Json(result))
}

pub async fn chat_history(
    State(service): State<Arc<WorkflowService>>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadHistory>, ApiError> {
    let history = service.history(&thread_id).await?;
    Ok(Json(history))
}
