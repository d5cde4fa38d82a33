use std::sync::Arc;
use std::time::Duration;

use planweave::gateway::GatewayError;
use planweave::registry::ToolRegistry;
use planweave::runtime::{
    Checkpointer, GraphError, InMemoryCheckpointer, ResumeDecision, RunEvents, RunOutcome,
    WorkflowGraph, WorkflowEvent,
};
use serde_json::json;

mod common;
use common::*;

fn graph_with(gateway: Arc<MockGateway>) -> (WorkflowGraph, Arc<InMemoryCheckpointer>) {
    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let graph = WorkflowGraph::new(gateway, checkpointer.clone(), Duration::from_secs(5));
    (graph, checkpointer)
}

fn event_kind(event: &WorkflowEvent) -> &'static str {
    match event {
        WorkflowEvent::Thinking { .. } => "thinking",
        WorkflowEvent::IntegrationsReady { .. } => "integrations_ready",
        WorkflowEvent::IntegrationAdded { .. } => "integration_added",
        WorkflowEvent::Progress { .. } => "progress",
        WorkflowEvent::StepThinking { .. } => "step_thinking",
        WorkflowEvent::Token { .. } => "token",
        WorkflowEvent::ApprovalRequired { .. } => "approval_required",
    }
}

#[tokio::test]
async fn fresh_two_step_run_completes() {
    let gateway = gateway_arc(MockGateway::new().with_plan(Ok(draft(&[
        ("search for the doc", &["web_search"], false, "read-only"),
        ("summarize the findings", &[], false, "read-only"),
    ]))));
    let (graph, checkpointer) = graph_with(gateway.clone());
    let mut registry = ToolRegistry::build(&search_tokens());
    let (events, rx) = RunEvents::channel();

    let outcome = graph
        .start(&mut registry, "t1", "search for the doc and summarize it", &events)
        .await
        .unwrap();
    drop(events);

    let state = match outcome {
        RunOutcome::Complete(state) => state,
        other => panic!("expected complete, got {other:?}"),
    };
    assert!(state.is_complete);
    let plan = state.plan.as_ref().unwrap();
    assert!(plan.is_complete);
    assert!(plan.final_summary.is_some());
    assert!(plan
        .steps
        .iter()
        .all(|s| s.status == planweave::plan::StepStatus::Completed));
    assert_eq!(gateway.executed_steps.lock().clone(), vec![1, 2]);

    // Event order: thinking before everything, then the registry
    // announcement, then only canonical progress/step events.
    let events: Vec<_> = rx.drain().collect();
    let kinds: Vec<_> = events.iter().map(event_kind).collect();
    assert_eq!(&kinds[..3], &["thinking", "integrations_ready", "progress"]);
    // planner + 2x(in_progress, completed) + synthesizer.
    assert_eq!(kinds.iter().filter(|k| **k == "progress").count(), 6);

    // Every progress snapshot satisfies the plan invariants.
    for event in &events {
        if let WorkflowEvent::Progress { state } = event {
            if let Some(plan) = &state.plan {
                plan.check_invariants().unwrap();
            }
        }
    }

    // The checkpoint lineage is a single-root linked list.
    let lineage = checkpointer.list("t1").await.unwrap();
    assert_eq!(lineage.len(), 6);
    for pair in lineage.windows(2) {
        assert_eq!(
            pair[0].parent_checkpoint_id.as_deref(),
            Some(pair[1].checkpoint_id.as_str())
        );
    }
    assert!(lineage.last().unwrap().parent_checkpoint_id.is_none());
}

fn mail_plan() -> Result<planweave::gateway::PlanDraft, GatewayError> {
    Ok(draft(&[
        ("research the topic", &["web_search"], false, "read-only"),
        ("email the summary to a@b.com", &["send_mail"], false, ""),
    ]))
}

#[tokio::test]
async fn mandatory_tool_suspends_and_approve_completes() {
    let gateway = gateway_arc(MockGateway::new().with_plan(mail_plan()));
    let (graph, checkpointer) = graph_with(gateway.clone());
    let mut registry = ToolRegistry::build(&all_tokens());
    let (events, rx) = RunEvents::channel();

    let outcome = graph
        .start(&mut registry, "t1", "research the topic and email the summary", &events)
        .await
        .unwrap();
    drop(events);

    let state = match outcome {
        RunOutcome::Suspended(state) => state,
        other => panic!("expected suspension, got {other:?}"),
    };
    assert!(state.awaiting_approval);
    assert_eq!(state.awaiting_step_number(), Some(2));
    assert_eq!(gateway.executed_steps.lock().clone(), vec![1]);

    let events: Vec<_> = rx.drain().collect();
    let interrupt = events
        .iter()
        .find_map(|e| match e {
            WorkflowEvent::ApprovalRequired {
                step_number,
                interrupt,
                ..
            } => Some((*step_number, interrupt.clone())),
            _ => None,
        })
        .expect("approval event emitted");
    assert_eq!(interrupt.0, 2);
    assert_eq!(interrupt.1.reason, "sending mail requires confirmation");
    assert_eq!(interrupt.1.actions, vec!["approve", "edit", "skip"]);

    // The suspension survives process loss: resume through a fresh graph
    // over the same store.
    let fresh_graph = WorkflowGraph::new(
        gateway.clone(),
        checkpointer.clone(),
        Duration::from_secs(5),
    );
    let mut registry = ToolRegistry::build(&all_tokens());
    let outcome = fresh_graph
        .resume(&mut registry, "t1", ResumeDecision::Approve, &RunEvents::disabled())
        .await
        .unwrap();
    let state = match outcome {
        RunOutcome::Complete(state) => state,
        other => panic!("expected complete, got {other:?}"),
    };
    assert!(state.is_complete);
    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].status, planweave::plan::StepStatus::Completed);
    assert_eq!(gateway.executed_steps.lock().clone(), vec![1, 2]);
}

#[tokio::test]
async fn skip_decision_never_executes_the_step() {
    let gateway = gateway_arc(MockGateway::new().with_plan(mail_plan()));
    let (graph, _checkpointer) = graph_with(gateway.clone());
    let mut registry = ToolRegistry::build(&all_tokens());

    let outcome = graph
        .start(
            &mut registry,
            "t1",
            "research and email it",
            &RunEvents::disabled(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Suspended(_)));

    let outcome = graph
        .resume(&mut registry, "t1", ResumeDecision::Skip, &RunEvents::disabled())
        .await
        .unwrap();
    let state = match outcome {
        RunOutcome::Complete(state) => state,
        other => panic!("expected complete, got {other:?}"),
    };
    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].status, planweave::plan::StepStatus::Skipped);
    assert_eq!(plan.steps[1].result.as_deref(), Some("Skipped by user"));
    assert!(state.is_complete);
    // Only step 1 ever reached the gateway.
    assert_eq!(gateway.executed_steps.lock().clone(), vec![1]);
}

#[tokio::test]
async fn edit_decision_substitutes_payload() {
    let gateway = gateway_arc(MockGateway::new().with_plan(mail_plan()));
    let (graph, _checkpointer) = graph_with(gateway.clone());
    let mut registry = ToolRegistry::build(&all_tokens());

    graph
        .start(&mut registry, "t1", "research and email it", &RunEvents::disabled())
        .await
        .unwrap();
    let payload = json!({"to": "a@b.com", "body": "edited body"});
    graph
        .resume(
            &mut registry,
            "t1",
            ResumeDecision::Edit(payload.clone()),
            &RunEvents::disabled(),
        )
        .await
        .unwrap();

    let payloads = gateway.approved_payloads.lock().clone();
    assert_eq!(payloads.last().unwrap().as_ref(), Some(&payload));
}

#[tokio::test]
async fn failed_step_checkpoints_then_retry_reruns() {
    let gateway = gateway_arc(
        MockGateway::new()
            .with_plan(Ok(draft(&[
                ("fetch data", &["web_search"], false, "read-only"),
                ("summarize data", &[], false, "read-only"),
            ])))
            .with_step(step_ok("fetched"))
            .with_step(Err(GatewayError::Network("connection reset".into()))),
    );
    let (graph, checkpointer) = graph_with(gateway.clone());
    let mut registry = ToolRegistry::build(&search_tokens());

    let err = graph
        .start(&mut registry, "t1", "fetch and summarize", &RunEvents::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Execution { step: 2, .. }));

    // The failure is durable: the latest checkpoint holds the failed step
    // and an unmoved cursor.
    let latest = checkpointer.get_latest("t1").await.unwrap().unwrap();
    let plan = latest.state.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].status, planweave::plan::StepStatus::Failed);
    assert!(plan.steps[1].error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(latest.state.current_step, 1);
    assert!(latest.state.last_error.is_some());

    let outcome = graph
        .retry(&mut registry, "t1", 2, &RunEvents::disabled())
        .await
        .unwrap();
    let state = match outcome {
        RunOutcome::Complete(state) => state,
        other => panic!("expected complete, got {other:?}"),
    };
    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].status, planweave::plan::StepStatus::Completed);
    assert!(state.last_error.is_none());
    assert_eq!(gateway.executed_steps.lock().clone(), vec![1, 2, 2]);
}

#[tokio::test]
async fn retry_rejects_out_of_range_steps() {
    let gateway = gateway_arc(MockGateway::new());
    let (graph, _checkpointer) = graph_with(gateway);
    let mut registry = ToolRegistry::build(&search_tokens());

    graph
        .start(&mut registry, "t1", "do one thing", &RunEvents::disabled())
        .await
        .unwrap();

    let err = graph
        .retry(&mut registry, "t1", 99, &RunEvents::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidStep { step: 99, len: 1 }));
    let err = graph
        .retry(&mut registry, "t1", 0, &RunEvents::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidStep { step: 0, .. }));
}

#[tokio::test]
async fn resume_requires_an_awaiting_thread() {
    let gateway = gateway_arc(MockGateway::new());
    let (graph, _checkpointer) = graph_with(gateway);
    let mut registry = ToolRegistry::build(&search_tokens());

    // Unknown thread: nothing to resume.
    let err = graph
        .resume(&mut registry, "missing", ResumeDecision::Approve, &RunEvents::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::NoCheckpoint { .. }));

    // A completed thread is not awaiting approval.
    graph
        .start(&mut registry, "t1", "just do it", &RunEvents::disabled())
        .await
        .unwrap();
    let err = graph
        .resume(&mut registry, "t1", ResumeDecision::Approve, &RunEvents::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::StateMismatch { .. }));
}

#[tokio::test]
async fn second_request_keeps_history_and_feeds_planner_context() {
    let gateway = gateway_arc(MockGateway::new());
    let (graph, _checkpointer) = graph_with(gateway.clone());
    let mut registry = ToolRegistry::build(&search_tokens());

    graph
        .start(&mut registry, "t1", "research rust workflow engines", &RunEvents::disabled())
        .await
        .unwrap();

    let mut registry = ToolRegistry::build(&search_tokens());
    let outcome = graph
        .start(&mut registry, "t1", "email those results to a@b.com", &RunEvents::disabled())
        .await
        .unwrap();

    // Message history from the first turn is preserved under the new plan.
    let state = outcome.state();
    assert_eq!(state.latest_request(), Some("email those results to a@b.com"));
    assert!(state
        .messages
        .iter()
        .any(|m| m.content == "research rust workflow engines"));

    // The planner saw a context summary of the prior turns.
    let calls = gateway.plan_calls.lock().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].history_summary.is_none());
    let summary = calls[1].history_summary.as_ref().expect("history summary");
    assert!(summary.contains("research rust workflow engines"));
}

#[tokio::test]
async fn unclassified_integration_loads_incrementally() {
    // The request classifies only web_search, but the plan's second step
    // hints at a credentialed gmail tool.
    let gateway = gateway_arc(MockGateway::new().with_plan(Ok(draft(&[
        ("research the topic", &["web_search"], false, "read-only"),
        ("mail it out", &["send_mail"], false, ""),
    ]))));
    let (graph, _checkpointer) = graph_with(gateway);
    let mut registry = ToolRegistry::build(&all_tokens());
    let (events, rx) = RunEvents::channel();

    let outcome = graph
        .start(&mut registry, "t1", "research the topic", &events)
        .await
        .unwrap();
    drop(events);

    let state = match outcome {
        RunOutcome::Suspended(state) => state,
        other => panic!("expected suspension, got {other:?}"),
    };
    let events: Vec<_> = rx.drain().collect();
    let ready = events
        .iter()
        .find_map(|e| match e {
            WorkflowEvent::IntegrationsReady { integrations } => Some(integrations.clone()),
            _ => None,
        })
        .unwrap();
    assert!(ready.iter().all(|i| i.id != "gmail"));
    let added = events
        .iter()
        .find_map(|e| match e {
            WorkflowEvent::IntegrationAdded { integration } => Some(integration.clone()),
            _ => None,
        })
        .expect("incremental load announced");
    assert_eq!(added.id, "gmail");
    assert!(state.loaded_integrations.iter().any(|i| i.id == "gmail"));
}

#[tokio::test]
async fn planner_failure_leaves_thread_unchanged() {
    let gateway = gateway_arc(MockGateway::new().with_plan(Err(GatewayError::Schema {
        attempts: 3,
        message: "not json".into(),
    })));
    let (graph, checkpointer) = graph_with(gateway);
    let mut registry = ToolRegistry::build(&search_tokens());

    let err = graph
        .start(&mut registry, "t1", "do something", &RunEvents::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Planner { .. }));
    // No checkpoint was written: the thread stays usable for a new request.
    assert!(checkpointer.get_latest("t1").await.unwrap().is_none());
}
