//! Per-request tool registry.
//!
//! The registry presents the set of integrations the caller is authorized to
//! use, built once per request from the supplied bearer tokens. Integrations
//! whose credentials are missing are omitted. The planner receives the
//! registry's tool descriptors as hints; the router consults tool approval
//! classes; the executor resolves hints back into callable descriptors.
//!
//! Classification of which integrations a request needs is pattern-based and
//! instant (no LLM call). When a step hint later resolves to a tool in a
//! credentialed-but-unloaded integration, the integration is loaded
//! incrementally and surfaced to the client mid-stream.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Policy property of a tool deciding whether a step using it needs a human
/// decision first.
///
/// Ordered by strictness so an integration's class is the strongest of its
/// tools'.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalClass {
    /// Read-only operations; execute without ceremony.
    Silent,
    /// Execute, but attach an advisory note to the executor.
    Advisory,
    /// Force the step to `awaiting_approval` regardless of the planner's
    /// suggestion.
    Mandatory,
}

/// Callable tool descriptor handed to the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Stable tool identifier (what planner hints reference).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub description: String,
    /// Owning integration id.
    pub integration: String,
    pub approval: ApprovalClass,
    /// Reason surfaced to the approver when this tool forces a suspension.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub approval_note: Option<String>,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

/// Which credential an integration requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    GmailToken,
    NotionToken,
    SlackToken,
    TavilyApiKey,
}

/// Bag of per-integration bearer tokens supplied with a request.
///
/// Never serialized, never logged; the `Debug` impl redacts values.
#[derive(Clone, Default)]
pub struct IntegrationTokens {
    pub gmail_token: Option<String>,
    pub notion_token: Option<String>,
    pub slack_token: Option<String>,
    pub tavily_api_key: Option<String>,
}

impl IntegrationTokens {
    /// Token for the given credential kind, if present and non-empty.
    #[must_use]
    pub fn get(&self, kind: CredentialKind) -> Option<&str> {
        let token = match kind {
            CredentialKind::GmailToken => self.gmail_token.as_deref(),
            CredentialKind::NotionToken => self.notion_token.as_deref(),
            CredentialKind::SlackToken => self.slack_token.as_deref(),
            CredentialKind::TavilyApiKey => self.tavily_api_key.as_deref(),
        };
        token.filter(|t| !t.is_empty())
    }

    /// Overlay: request-supplied tokens win over defaults.
    #[must_use]
    pub fn merged_over(self, defaults: &IntegrationTokens) -> Self {
        Self {
            gmail_token: self.gmail_token.or_else(|| defaults.gmail_token.clone()),
            notion_token: self.notion_token.or_else(|| defaults.notion_token.clone()),
            slack_token: self.slack_token.or_else(|| defaults.slack_token.clone()),
            tavily_api_key: self
                .tavily_api_key
                .or_else(|| defaults.tavily_api_key.clone()),
        }
    }
}

impl std::fmt::Debug for IntegrationTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mark(t: &Option<String>) -> &'static str {
            if t.is_some() {
                "<set>"
            } else {
                "<none>"
            }
        }
        f.debug_struct("IntegrationTokens")
            .field("gmail_token", &mark(&self.gmail_token))
            .field("notion_token", &mark(&self.notion_token))
            .field("slack_token", &mark(&self.slack_token))
            .field("tavily_api_key", &mark(&self.tavily_api_key))
            .finish()
    }
}

/// Static description of one integration in the catalog.
pub struct IntegrationSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub icon: &'static str,
    pub credential: CredentialKind,
    /// Lowercased substrings that mark a request as needing this integration.
    pub request_patterns: &'static [&'static str],
    pub tools: Vec<ToolDescriptor>,
}

fn tool(
    id: &str,
    name: &str,
    description: &str,
    integration: &str,
    approval: ApprovalClass,
    approval_note: Option<&str>,
    parameters: Value,
) -> ToolDescriptor {
    ToolDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        integration: integration.to_string(),
        approval,
        approval_note: approval_note.map(str::to_string),
        parameters,
    }
}

/// The built-in integration catalog.
#[must_use]
pub fn catalog() -> Vec<IntegrationSpec> {
    vec![
        IntegrationSpec {
            id: "web_search",
            display_name: "Web Search",
            icon: "search",
            credential: CredentialKind::TavilyApiKey,
            request_patterns: &["search", "research", "find", "look up", "news", "latest"],
            tools: vec![tool(
                "web_search",
                "Web Search",
                "Search the web and return ranked results with titles and URLs",
                "web_search",
                ApprovalClass::Silent,
                None,
                json!({
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"]
                }),
            )],
        },
        IntegrationSpec {
            id: "gmail",
            display_name: "Gmail",
            icon: "mail",
            credential: CredentialKind::GmailToken,
            request_patterns: &["email", "mail", "inbox", "gmail"],
            tools: vec![
                tool(
                    "search_mail",
                    "Search Mail",
                    "Search the caller's mailbox",
                    "gmail",
                    ApprovalClass::Silent,
                    None,
                    json!({
                        "type": "object",
                        "properties": {"query": {"type": "string"}},
                        "required": ["query"]
                    }),
                ),
                tool(
                    "send_mail",
                    "Send Mail",
                    "Send an email on the caller's behalf",
                    "gmail",
                    ApprovalClass::Mandatory,
                    Some("sending mail requires confirmation"),
                    json!({
                        "type": "object",
                        "properties": {
                            "to": {"type": "string"},
                            "subject": {"type": "string"},
                            "body": {"type": "string"}
                        },
                        "required": ["to", "body"]
                    }),
                ),
            ],
        },
        IntegrationSpec {
            id: "docs",
            display_name: "Docs",
            icon: "document",
            credential: CredentialKind::NotionToken,
            request_patterns: &["doc", "notion", "page", "notes", "write up"],
            tools: vec![
                tool(
                    "search_docs",
                    "Search Docs",
                    "Search the caller's workspace documents",
                    "docs",
                    ApprovalClass::Silent,
                    None,
                    json!({
                        "type": "object",
                        "properties": {"query": {"type": "string"}},
                        "required": ["query"]
                    }),
                ),
                tool(
                    "read_doc",
                    "Read Doc",
                    "Fetch a document's content by id",
                    "docs",
                    ApprovalClass::Silent,
                    None,
                    json!({
                        "type": "object",
                        "properties": {"doc_id": {"type": "string"}},
                        "required": ["doc_id"]
                    }),
                ),
                tool(
                    "update_doc",
                    "Update Doc",
                    "Append content to an existing document",
                    "docs",
                    ApprovalClass::Advisory,
                    Some("updates an existing document"),
                    json!({
                        "type": "object",
                        "properties": {
                            "doc_id": {"type": "string"},
                            "content": {"type": "string"}
                        },
                        "required": ["doc_id", "content"]
                    }),
                ),
                tool(
                    "create_doc",
                    "Create Doc",
                    "Publish a new document in the caller's workspace",
                    "docs",
                    ApprovalClass::Mandatory,
                    Some("publishing a document requires confirmation"),
                    json!({
                        "type": "object",
                        "properties": {
                            "title": {"type": "string"},
                            "content": {"type": "string"}
                        },
                        "required": ["title", "content"]
                    }),
                ),
            ],
        },
        IntegrationSpec {
            id: "slack",
            display_name: "Slack",
            icon: "slack",
            credential: CredentialKind::SlackToken,
            request_patterns: &["slack", "channel", "team chat"],
            tools: vec![tool(
                "post_message",
                "Post Message",
                "Post a message to a channel",
                "slack",
                ApprovalClass::Mandatory,
                Some("posting to a channel requires confirmation"),
                json!({
                    "type": "object",
                    "properties": {
                        "channel": {"type": "string"},
                        "text": {"type": "string"}
                    },
                    "required": ["channel", "text"]
                }),
            )],
        },
    ]
}

/// Display metadata for one loaded integration, safe to persist in state
/// snapshots (shape only, no secrets).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationInfo {
    pub id: String,
    pub display_name: String,
    pub icon: String,
    pub tool_count: usize,
    pub approval: ApprovalClass,
}

struct LoadedIntegration {
    spec: IntegrationSpec,
    token: String,
    loaded: bool,
}

impl LoadedIntegration {
    fn info(&self) -> IntegrationInfo {
        IntegrationInfo {
            id: self.spec.id.to_string(),
            display_name: self.spec.display_name.to_string(),
            icon: self.spec.icon.to_string(),
            tool_count: self.spec.tools.len(),
            approval: self
                .spec
                .tools
                .iter()
                .map(|t| t.approval)
                .max()
                .unwrap_or(ApprovalClass::Silent),
        }
    }
}

/// Per-request registry of authorized integrations and their tools.
///
/// Immutable for the duration of a request apart from incremental loading,
/// which only widens the loaded subset.
pub struct ToolRegistry {
    integrations: Vec<LoadedIntegration>,
    tool_index: FxHashMap<String, usize>,
}

impl ToolRegistry {
    /// Build the registry from a token bag. Integrations without a usable
    /// credential are omitted entirely.
    #[must_use]
    pub fn build(tokens: &IntegrationTokens) -> Self {
        let mut integrations = Vec::new();
        for spec in catalog() {
            if let Some(token) = tokens.get(spec.credential) {
                integrations.push(LoadedIntegration {
                    spec,
                    token: token.to_string(),
                    loaded: false,
                });
            }
        }
        let mut tool_index = FxHashMap::default();
        for (i, integration) in integrations.iter().enumerate() {
            for t in &integration.spec.tools {
                tool_index.insert(t.id.clone(), i);
            }
        }
        Self {
            integrations,
            tool_index,
        }
    }

    /// Classify which integrations a request needs and mark them loaded.
    ///
    /// Pattern matching over the request text, with intent-based defaults
    /// when nothing matches. Returns the loaded subset's display info.
    pub fn load_for_request(&mut self, request: &str) -> Vec<IntegrationInfo> {
        let request_lower = request.to_lowercase();
        let mut any = false;
        for integration in self.integrations.iter_mut() {
            if integration
                .spec
                .request_patterns
                .iter()
                .any(|p| request_lower.contains(p))
            {
                integration.loaded = true;
                any = true;
            }
        }
        if !any {
            let fallback = if ["what ", "who ", "when ", "where ", "why ", "how "]
                .iter()
                .any(|q| request_lower.starts_with(q))
            {
                "web_search"
            } else if request_lower.starts_with("send") {
                "gmail"
            } else {
                "web_search"
            };
            for integration in self.integrations.iter_mut() {
                if integration.spec.id == fallback {
                    integration.loaded = true;
                    any = true;
                }
            }
            // No credential for the fallback either: load everything we have.
            if !any {
                for integration in self.integrations.iter_mut() {
                    integration.loaded = true;
                }
            }
        }
        self.snapshot()
    }

    /// Restore the loaded subset from a persisted snapshot (resume path).
    pub fn load_from_snapshot(&mut self, snapshot: &[IntegrationInfo]) {
        for integration in self.integrations.iter_mut() {
            if snapshot.iter().any(|info| info.id == integration.spec.id) {
                integration.loaded = true;
            }
        }
    }

    /// Display info for the currently loaded subset.
    #[must_use]
    pub fn snapshot(&self) -> Vec<IntegrationInfo> {
        self.integrations
            .iter()
            .filter(|i| i.loaded)
            .map(LoadedIntegration::info)
            .collect()
    }

    /// Callable descriptors for a step, resolved from its tool-id hints.
    ///
    /// Unknown hints are dropped (the executor lets the LLM decide against
    /// the authorized set); empty hints yield every loaded tool.
    #[must_use]
    pub fn tools_for(&self, hints: &[String]) -> Vec<ToolDescriptor> {
        if hints.is_empty() {
            return self
                .integrations
                .iter()
                .filter(|i| i.loaded)
                .flat_map(|i| i.spec.tools.iter().cloned())
                .collect();
        }
        let mut tools = Vec::new();
        for hint in hints {
            if let Some(&idx) = self.tool_index.get(hint) {
                let integration = &self.integrations[idx];
                if integration.loaded {
                    if let Some(t) = integration.spec.tools.iter().find(|t| &t.id == hint) {
                        tools.push(t.clone());
                    }
                }
            }
        }
        tools
    }

    /// Load the integration owning `hint` if it is credentialed but not yet
    /// loaded. Returns its info so the caller can announce the addition.
    pub fn load_incrementally(&mut self, hint: &str) -> Option<IntegrationInfo> {
        let &idx = self.tool_index.get(hint)?;
        let integration = &mut self.integrations[idx];
        if integration.loaded {
            return None;
        }
        integration.loaded = true;
        Some(integration.info())
    }

    /// The strongest approval class among the given tools.
    #[must_use]
    pub fn strongest_class(tools: &[ToolDescriptor]) -> ApprovalClass {
        tools
            .iter()
            .map(|t| t.approval)
            .max()
            .unwrap_or(ApprovalClass::Silent)
    }

    /// Bearer token for the integration owning a tool.
    #[must_use]
    pub fn token_for(&self, tool: &ToolDescriptor) -> Option<&str> {
        self.integrations
            .iter()
            .find(|i| i.spec.id == tool.integration)
            .map(|i| i.token.as_str())
    }
}

/// Errors from tool invocation.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("tool '{tool}' not available in any loaded integration")]
    #[diagnostic(code(planweave::registry::unknown_tool))]
    UnknownTool { tool: String },

    #[error("tool '{tool}' call failed: {message}")]
    #[diagnostic(code(planweave::registry::invocation))]
    Invocation { tool: String, message: String },

    #[error("tool transport error: {0}")]
    #[diagnostic(
        code(planweave::registry::transport),
        help("Check the tool server endpoint and network reachability.")
    )]
    Transport(String),
}

/// Capability seam for invoking external tool servers.
///
/// The gateway's tool-call loop dispatches through this trait; tests supply
/// a scripted implementation.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn invoke(
        &self,
        tool: &ToolDescriptor,
        bearer: Option<&str>,
        arguments: Value,
    ) -> Result<Value, ToolError>;
}

/// HTTP dispatcher posting `arguments` to
/// `{base_url}/{integration}/{tool_id}` with the integration's bearer token.
pub struct HttpToolDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpToolDispatcher {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ToolDispatcher for HttpToolDispatcher {
    async fn invoke(
        &self,
        tool: &ToolDescriptor,
        bearer: Option<&str>,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        let url = format!("{}/{}/{}", self.base_url, tool.integration, tool.id);
        let mut request = self.client.post(&url).json(&arguments);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ToolError::Invocation {
                tool: tool.id.clone(),
                message: body.to_string(),
            });
        }
        Ok(body)
    }
}
