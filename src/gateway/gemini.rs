//! Gemini-backed gateway implementation.
//!
//! All model calls go through the `streamGenerateContent` SSE endpoint, so
//! both operations yield partials on top of their structured results: step
//! execution forwards each text chunk as a `token` event as it arrives, and
//! plan generation decodes the `thinking` field incrementally out of the
//! streamed JSON ([`ThinkingScanner`]) and emits it as it is produced.
//!
//! Plan generation uses `responseSchema`-constrained JSON output, re-asking
//! with a corrective prompt when the model returns something that does not
//! parse. Step execution binds the authorized tools as function
//! declarations and loops call → dispatch → feed result back, capped at
//! [`TOOL_LOOP_CAP`](super::TOOL_LOOP_CAP) iterations.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::{
    message::Message,
    plan::{truncate_chars, PlannedStep, SearchHit},
    registry::{ToolDispatcher, ToolError, ToolRegistry},
    runtime::event::{RunEvents, WorkflowEvent},
};

use super::{
    retry_transient,
    types::{
        Candidate, Content, FunctionDeclaration, FunctionResponse, GeminiError, GeminiTool,
        GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part, StreamChunk,
    },
    GatewayError, LlmGateway, PlanDraft, PlanRequest, StepOutcome, StepRequest,
    PLAN_SCHEMA_ATTEMPTS, TOOL_LOOP_CAP,
};
use async_trait::async_trait;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const PLANNER_SYSTEM_PROMPT: &str = "\
You are a workflow planner. Analyze the user's request and create a step-by-step execution plan.

RULES:
1. Each step is a single, atomic action.
2. Steps are in execution order, dependencies first.
3. Name the tool ids a step will use in expected_tools when known.
4. Keep steps concise but clear.

For EACH step decide requires_approval:
- true for anything that creates, updates, deletes, sends, or publishes.
- false for read-only operations: searching, reading, listing, summarizing.
Give a short approval_reason either way.";

const EXECUTOR_SYSTEM_PROMPT: &str = "\
You are a workflow executor. Execute ONLY the step given to you using the
available tools, then report what you accomplished, including any outputs
(links, ids, titles) later steps may need.";

fn plan_response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "thinking": {"type": "string"},
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": {"type": "string"},
                        "expected_tools": {
                            "type": "array",
                            "items": {"type": "string"}
                        },
                        "requires_approval": {"type": "boolean"},
                        "approval_reason": {"type": "string"}
                    },
                    "required": ["description", "requires_approval", "approval_reason"]
                }
            }
        },
        "required": ["thinking", "steps"]
    })
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    thinking: String,
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    description: String,
    #[serde(default)]
    expected_tools: Vec<String>,
    requires_approval: bool,
    #[serde(default)]
    approval_reason: String,
}

/// Shared Gemini client. One instance serves all requests; credentials for
/// tool dispatch stay per-request in the registry.
pub struct GeminiGateway {
    client: reqwest::Client,
    api_key: String,
    model: String,
    call_timeout: Duration,
    dispatcher: Arc<dyn ToolDispatcher>,
}

impl GeminiGateway {
    /// Build a gateway with the given provider key, model id, per-call
    /// timeout, and tool dispatcher.
    pub fn new(
        api_key: &str,
        model: &str,
        call_timeout: Duration,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(call_timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            call_timeout,
            dispatcher,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                seconds: self.call_timeout.as_secs(),
            }
        } else {
            GatewayError::Network(e.to_string())
        }
    }

    /// Stream one generation over SSE, invoking `on_text` for each text
    /// chunk as it arrives, and assemble the final structured response from
    /// the accumulated parts.
    async fn generate_streamed(
        &self,
        request: &GenerateContentRequest,
        mut on_text: impl FnMut(&str) + Send,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            BASE_URL, self.model, self.api_key
        );
        debug!(model = %self.model, "gemini stream_generate_content");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| GatewayError::Network(e.to_string()))?;
            let message = serde_json::from_str::<GeminiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(GatewayError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let mut bytes_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut call_parts: Vec<Part> = Vec::new();
        let mut finish_reason = None;

        while let Some(chunk) = bytes_stream.next().await {
            let bytes = chunk.map_err(|e| self.request_error(e))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // Process complete SSE events.
            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                buffer.drain(..pos + 2);

                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        continue;
                    }
                    let chunk: StreamChunk = serde_json::from_str(data)
                        .map_err(|e| GatewayError::Malformed(e.to_string()))?;
                    let Some(candidate) =
                        chunk.candidates.as_ref().and_then(|c| c.first())
                    else {
                        continue;
                    };
                    for part in &candidate.content.parts {
                        match part {
                            Part::Text { text: delta } => {
                                on_text(delta);
                                text.push_str(delta);
                            }
                            Part::FunctionCall { .. } => call_parts.push(part.clone()),
                            Part::FunctionResponse { .. } => {}
                        }
                    }
                    if candidate.finish_reason.is_some() {
                        finish_reason = candidate.finish_reason.clone();
                    }
                }
            }
        }

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(Part::Text { text });
        }
        parts.extend(call_parts);
        Ok(GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: "model".to_string(),
                    parts,
                },
                finish_reason,
            }],
        })
    }

    fn declarations(tools: &[crate::registry::ToolDescriptor]) -> Option<Vec<GeminiTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.id.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }])
    }
}

#[async_trait]
impl LlmGateway for GeminiGateway {
    #[instrument(skip(self, request, events), err)]
    async fn plan(
        &self,
        request: PlanRequest<'_>,
        events: &RunEvents,
    ) -> Result<PlanDraft, GatewayError> {
        let tool_digest = request
            .tools
            .iter()
            .map(|t| format!("- {} ({}): {}", t.id, t.integration, t.description))
            .collect::<Vec<_>>()
            .join("\n");
        let mut user_prompt = String::new();
        if let Some(summary) = request.history_summary {
            user_prompt.push_str(&format!("Conversation so far:\n{summary}\n"));
        }
        user_prompt.push_str(&format!(
            "Available tools:\n{tool_digest}\n\nCreate a plan for: {}",
            request.request
        ));

        let mut contents = vec![Content::text("user", user_prompt)];
        let mut last_error = String::new();

        for attempt in 1..=PLAN_SCHEMA_ATTEMPTS {
            let wire_request = GenerateContentRequest {
                contents: contents.clone(),
                system_instruction: Some(Content::text("system", PLANNER_SYSTEM_PROMPT)),
                generation_config: Some(GenerationConfig {
                    response_mime_type: Some("application/json".into()),
                    response_schema: Some(plan_response_schema()),
                    ..Default::default()
                }),
                tools: None,
            };
            // The schema puts `thinking` first, so its value can be decoded
            // and emitted while the rest of the plan is still streaming.
            let response = retry_transient(|| {
                let mut scanner = ThinkingScanner::default();
                self.generate_streamed(&wire_request, move |chunk| {
                    if let Some(delta) = scanner.push(chunk) {
                        events.emit(WorkflowEvent::Thinking {
                            content: delta,
                            duration_hint: 0,
                        });
                    }
                })
            })
            .await?;
            let text = response.text();
            match serde_json::from_str::<RawPlan>(strip_fences(&text)) {
                Ok(raw) => {
                    return Ok(PlanDraft {
                        thinking: raw.thinking,
                        steps: raw
                            .steps
                            .into_iter()
                            .map(|s| PlannedStep {
                                description: s.description,
                                expected_tools: s.expected_tools,
                                requires_approval: s.requires_approval,
                                approval_reason: s.approval_reason,
                            })
                            .collect(),
                    });
                }
                Err(err) => {
                    debug!(attempt, error = %err, "plan output failed schema validation");
                    last_error = err.to_string();
                    contents.push(Content::text("model", text));
                    contents.push(Content::text(
                        "user",
                        format!(
                            "That reply was not valid plan JSON ({last_error}). \
                             Respond with JSON only, matching the requested schema exactly."
                        ),
                    ));
                }
            }
        }

        Err(GatewayError::Schema {
            attempts: PLAN_SCHEMA_ATTEMPTS,
            message: last_error,
        })
    }

    #[instrument(skip(self, request, registry, events), err)]
    async fn execute_step(
        &self,
        request: StepRequest<'_>,
        registry: &ToolRegistry,
        events: &RunEvents,
    ) -> Result<StepOutcome, GatewayError> {
        let step = request.step;
        let mut system_prompt = format!(
            "{EXECUTOR_SYSTEM_PROMPT}\n\nCURRENT STEP: {}\nSTEP {} OF {}\n\nPREVIOUS STEPS COMPLETED:\n{}",
            step.description, step.step_number, request.total_steps, request.previous_results
        );
        if let Some(note) = request.advisory_note {
            system_prompt.push_str(&format!("\n\nADVISORY: {note}"));
        }

        let mut user_prompt = format!(
            "Execute step {}: {}",
            step.step_number, step.description
        );
        if let Some(payload) = request.approved_payload {
            user_prompt.push_str(&format!(
                "\n\nUse this approved content:\n{}",
                serde_json::to_string_pretty(payload)
                    .unwrap_or_else(|_| payload.to_string())
            ));
        }

        let mut contents = vec![Content::text("user", user_prompt)];
        let tools = Self::declarations(request.tools);
        let mut outcome = StepOutcome::default();
        let mut transcript = String::new();

        for iteration in 0..TOOL_LOOP_CAP {
            let wire_request = GenerateContentRequest {
                contents: contents.clone(),
                system_instruction: Some(Content::text("system", system_prompt.clone())),
                generation_config: None,
                tools: tools.clone(),
            };
            let step_number = step.step_number;
            let response = retry_transient(|| {
                self.generate_streamed(&wire_request, move |chunk| {
                    events.token(step_number, chunk);
                })
            })
            .await?;

            let text = response.text();
            transcript.push_str(&text);

            let calls: Vec<_> = response
                .function_calls()
                .into_iter()
                .cloned()
                .collect();
            if calls.is_empty() {
                break;
            }
            if iteration + 1 == TOOL_LOOP_CAP {
                debug!(step = step.step_number, "tool loop cap reached, completing step");
                break;
            }

            // Echo the model turn (text + calls) back into the transcript.
            if let Some(candidate) = response.candidates.first() {
                contents.push(candidate.content.clone());
            }

            for call in calls {
                let descriptor = request
                    .tools
                    .iter()
                    .find(|t| t.id == call.name)
                    .ok_or_else(|| {
                        GatewayError::Tool(ToolError::UnknownTool {
                            tool: call.name.clone(),
                        })
                    })?;
                let bearer = registry.token_for(descriptor);
                let result = self
                    .dispatcher
                    .invoke(descriptor, bearer, call.args.clone())
                    .await?;

                events.token(
                    step.step_number,
                    truncate_chars(&result.to_string(), 400),
                );
                if outcome.search_hits.is_none() {
                    outcome.search_hits = extract_search_hits(&result);
                }
                if !outcome.tools_used.contains(&descriptor.id) {
                    outcome.tools_used.push(descriptor.id.clone());
                }
                outcome.tool_messages.push(Message::tool(
                    &descriptor.id,
                    call.args.clone(),
                    &truncate_chars(&result.to_string(), 2000),
                ));
                contents.push(Content {
                    role: "user".to_string(),
                    parts: vec![Part::FunctionResponse {
                        function_response: FunctionResponse {
                            name: call.name.clone(),
                            response: result,
                        },
                    }],
                });
            }
        }

        outcome.result = if transcript.is_empty() {
            "Step completed".to_string()
        } else {
            transcript
        };
        Ok(outcome)
    }
}

/// Incrementally decodes the `thinking` field out of streamed plan JSON.
///
/// Feed raw response chunks in arrival order; each call returns the newly
/// decoded portion of the field's value, so rationale reaches the client
/// before the full draft has even finished streaming. Decoding stops at the
/// field's closing quote; incomplete escape sequences at a chunk boundary
/// are held until the next chunk completes them.
#[derive(Debug, Default)]
struct ThinkingScanner {
    buffer: String,
    pos: usize,
    in_value: bool,
    done: bool,
}

impl ThinkingScanner {
    fn push(&mut self, chunk: &str) -> Option<String> {
        if self.done {
            return None;
        }
        self.buffer.push_str(chunk);
        if !self.in_value && !self.locate_value() {
            return None;
        }

        let mut decoded = String::new();
        loop {
            let rest = &self.buffer[self.pos..];
            let Some(c) = rest.chars().next() else {
                break;
            };
            if c == '"' {
                self.done = true;
                break;
            }
            if c != '\\' {
                decoded.push(c);
                self.pos += c.len_utf8();
                continue;
            }
            let mut after_backslash = rest.chars();
            after_backslash.next();
            let Some(esc) = after_backslash.next() else {
                // Escape split across chunks; wait for its tail.
                break;
            };
            match esc {
                'n' => decoded.push('\n'),
                't' => decoded.push('\t'),
                'r' => decoded.push('\r'),
                'u' => {
                    let Some(hex) = rest.get(2..6) else {
                        break;
                    };
                    let code = u32::from_str_radix(hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .unwrap_or(char::REPLACEMENT_CHARACTER);
                    decoded.push(code);
                    self.pos += 6;
                    continue;
                }
                other => decoded.push(other),
            }
            self.pos += 1 + esc.len_utf8();
        }

        if decoded.is_empty() {
            None
        } else {
            Some(decoded)
        }
    }

    fn locate_value(&mut self) -> bool {
        const KEY: &str = "\"thinking\"";
        let Some(key) = self.buffer.find(KEY) else {
            return false;
        };
        let after_key = key + KEY.len();
        let Some(colon) = self.buffer[after_key..].find(':') else {
            return false;
        };
        let after_colon = after_key + colon + 1;
        let Some(quote) = self.buffer[after_colon..].find('"') else {
            return false;
        };
        self.pos = after_colon + quote + 1;
        self.in_value = true;
        true
    }
}

/// Strip a ```json fence if the model wrapped its output in one.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim().strip_suffix("```").unwrap_or(rest).trim()
}

/// Extract structured search results from tool output.
///
/// Search tools return JSON with a `results` array (or a bare array) of
/// objects carrying at least a `url`.
#[must_use]
pub fn extract_search_hits(value: &Value) -> Option<Vec<SearchHit>> {
    let results = match value {
        Value::Object(map) => map.get("results")?.as_array()?,
        Value::Array(items) => items,
        _ => return None,
    };
    let mut hits = Vec::new();
    for item in results.iter().take(10) {
        let Some(url) = item.get("url").and_then(Value::as_str) else {
            continue;
        };
        let domain = domain_of(url);
        hits.push(SearchHit {
            title: item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(&domain)
                .to_string(),
            url: url.to_string(),
            favicon: Some(format!(
                "https://www.google.com/s2/favicons?domain={domain}&sz=32"
            )),
            date: item
                .get("published_date")
                .or_else(|| item.get("date"))
                .and_then(Value::as_str)
                .map(str::to_string),
            domain,
        });
    }
    if hits.is_empty() {
        None
    } else {
        Some(hits)
    }
}

fn domain_of(url: &str) -> String {
    url.split("//")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("")
        .trim_start_matches("www.")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_scanner_emits_deltas_across_chunks() {
        let mut scanner = ThinkingScanner::default();
        assert!(scanner.push("{\"thin").is_none());
        assert_eq!(scanner.push("king\": \"Break ").as_deref(), Some("Break "));
        assert_eq!(
            scanner.push("it\\ninto steps\", \"steps\": []}").as_deref(),
            Some("it\ninto steps")
        );
        // Closing quote reached; later chunks produce nothing.
        assert!(scanner.push("tail").is_none());
    }

    #[test]
    fn thinking_scanner_holds_split_escapes() {
        let mut scanner = ThinkingScanner::default();
        assert_eq!(scanner.push("{\"thinking\": \"a\\").as_deref(), Some("a"));
        assert_eq!(scanner.push("\"b\"}").as_deref(), Some("\"b"));
    }

    #[test]
    fn thinking_scanner_decodes_unicode_escapes() {
        let mut scanner = ThinkingScanner::default();
        assert_eq!(
            scanner.push("{\"thinking\": \"x\\u0041y\"}").as_deref(),
            Some("xAy")
        );
    }

    #[test]
    fn strip_fences_handles_plain_and_fenced() {
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn extracts_hits_from_results_array() {
        let value = json!({
            "results": [
                {"title": "Rust", "url": "https://www.rust-lang.org/learn", "published_date": "2024-01-01"},
                {"url": "https://docs.rs/tokio"},
                {"title": "no url"}
            ]
        });
        let hits = extract_search_hits(&value).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].domain, "rust-lang.org");
        assert_eq!(hits[0].date.as_deref(), Some("2024-01-01"));
        assert_eq!(hits[1].title, "docs.rs");
    }

    #[test]
    fn non_search_output_yields_none() {
        assert!(extract_search_hits(&json!({"ok": true})).is_none());
        assert!(extract_search_hits(&json!("text")).is_none());
    }
}
