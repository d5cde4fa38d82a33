use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use planweave::registry::IntegrationTokens;
use planweave::runtime::{InMemoryCheckpointer, WorkflowGraph};
use planweave::server;
use planweave::service::{LoggingMetadataHook, WorkflowService};

mod common;
use common::*;

async fn spawn_server(gateway: Arc<MockGateway>, tokens: IntegrationTokens) -> String {
    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let graph = Arc::new(WorkflowGraph::new(
        gateway,
        checkpointer,
        Duration::from_secs(5),
    ));
    let service = Arc::new(WorkflowService::new(
        graph,
        tokens,
        Arc::new(LoggingMetadataHook),
    ));
    let router = server::router(service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn chat_requires_a_request() {
    let base = spawn_server(gateway_arc(MockGateway::new()), search_tokens()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/chat"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{base}/chat"))
        .json(&json!({"request": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn chat_runs_to_completion() {
    let base = spawn_server(gateway_arc(MockGateway::new()), search_tokens()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/chat"))
        .json(&json!({"request": "summarize doc X"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(!body["thread_id"].as_str().unwrap().is_empty());
    assert_eq!(body["is_complete"], json!(true));
    assert_eq!(body["plan"]["steps"][0]["status"], json!("completed"));
}

#[tokio::test]
async fn chat_approval_flow_over_http() {
    let gateway = gateway_arc(MockGateway::new().with_plan(Ok(draft(&[
        ("summarize the doc", &["web_search"], false, "read-only"),
        ("email the summary to a@b.com", &["send_mail"], false, ""),
    ]))));
    let base = spawn_server(gateway, all_tokens()).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/chat"))
        .json(&json!({"request": "email the summary to a@b.com"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let thread_id = body["thread_id"].as_str().unwrap().to_string();
    assert_eq!(body["is_complete"], json!(false));
    assert_eq!(body["plan"]["steps"][1]["status"], json!("awaiting_approval"));

    let response = client
        .post(format!("{base}/chat/resume"))
        .json(&json!({"thread_id": thread_id, "action": "approve"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["is_complete"], json!(true));
    assert_eq!(body["plan"]["steps"][1]["status"], json!("completed"));
}

#[tokio::test]
async fn resume_validates_action_and_state() {
    let base = spawn_server(gateway_arc(MockGateway::new()), search_tokens()).await;
    let client = reqwest::Client::new();

    // Unknown action is schema-invalid input.
    let response = client
        .post(format!("{base}/chat/resume"))
        .json(&json!({"thread_id": "t", "action": "shrug"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Missing thread id.
    let response = client
        .post(format!("{base}/chat/resume"))
        .json(&json!({"action": "approve"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // A thread that is not awaiting approval conflicts.
    let body: Value = client
        .post(format!("{base}/chat"))
        .json(&json!({"request": "plain request"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let response = client
        .post(format!("{base}/chat/resume"))
        .json(&json!({"thread_id": body["thread_id"], "action": "approve"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn retry_validates_step_bounds() {
    let base = spawn_server(gateway_arc(MockGateway::new()), search_tokens()).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/chat"))
        .json(&json!({"request": "one step"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let thread_id = body["thread_id"].as_str().unwrap();

    let response = client
        .post(format!("{base}/chat/retry"))
        .json(&json!({"thread_id": thread_id, "step_number": 99}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{base}/chat/retry"))
        .json(&json!({"thread_id": thread_id, "step_number": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{base}/chat/retry"))
        .json(&json!({"thread_id": "no-such-thread", "step_number": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn history_maps_unknown_threads_to_404() {
    let base = spawn_server(gateway_arc(MockGateway::new()), search_tokens()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/chat/history/missing-thread"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = client
        .post(format!("{base}/chat"))
        .json(&json!({"request": "keep this"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let thread_id = body["thread_id"].as_str().unwrap();

    let response = client
        .get(format!("{base}/chat/history/{thread_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let history: Value = response.json().await.unwrap();
    assert!(history["plan"]["is_complete"].as_bool().unwrap());
    assert!(history["messages"].as_array().unwrap().len() >= 2);
    assert!(history["current_step_index"].as_u64().is_some());
}

#[tokio::test]
async fn stream_endpoint_emits_sse_frames() {
    let base = spawn_server(
        gateway_arc(MockGateway::new().emitting_tokens()),
        search_tokens(),
    )
    .await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/chat/stream"))
        .json(&json!({"request": "stream me a summary"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-cache"
    );

    // The workflow completes, so the whole stream can be read to the end.
    let body = response.text().await.unwrap();
    let frames: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert!(frames.len() >= 4);
    assert_eq!(frames[0]["type"], "thinking");
    assert_eq!(frames[1]["type"], "integrations_ready");
    assert_eq!(frames[2]["type"], "progress");
    assert_eq!(frames.last().unwrap()["type"], "done");
}
