use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message in a conversation thread, containing a role, text content, and
/// optional tool-call metadata.
///
/// Messages are the append-only record of a thread: the user's requests, the
/// assistant's plan announcements and step results, and the raw outputs of
/// tool invocations performed during step execution.
///
/// # Examples
///
/// ```
/// use planweave::message::Message;
///
/// let user_msg = Message::user("Summarize the launch doc");
/// let assistant_msg = Message::assistant("Here is the summary...");
/// assert_eq!(user_msg.role, Message::USER);
/// assert!(assistant_msg.tool_call.is_none());
/// ```
///
/// # Serialization
///
/// Messages serialize to JSON for checkpoint payloads and the history
/// endpoint. `tool_call` is omitted when absent.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender (`user`, `assistant`, `system`, `tool`).
    pub role: String,
    /// The text content of the message.
    pub content: String,
    /// Metadata linking a `tool` message back to the call that produced it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call: Option<ToolCallMeta>,
}

/// Metadata describing one tool invocation attached to a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallMeta {
    /// Identifier of the tool that was invoked.
    pub tool_id: String,
    /// Arguments the tool was called with.
    #[serde(default)]
    pub arguments: Value,
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// AI assistant response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";
    /// Tool output message role.
    pub const TOOL: &'static str = "tool";

    /// Creates a new message with the specified role and content.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            tool_call: None,
        }
    }

    /// Creates a user message with the specified content.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message with the specified content.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message with the specified content.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Creates a tool-output message carrying the invocation metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// use planweave::message::Message;
    /// use serde_json::json;
    ///
    /// let msg = Message::tool("web_search", json!({"query": "rust sse"}), "{...}");
    /// assert_eq!(msg.role, Message::TOOL);
    /// assert_eq!(msg.tool_call.unwrap().tool_id, "web_search");
    /// ```
    #[must_use]
    pub fn tool(tool_id: &str, arguments: Value, content: &str) -> Self {
        Self {
            role: Self::TOOL.to_string(),
            content: content.to_string(),
            tool_call: Some(ToolCallMeta {
                tool_id: tool_id.to_string(),
                arguments,
            }),
        }
    }

    /// Returns `true` if this message came from the user.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == Self::USER
    }
}

impl From<&str> for Message {
    /// Convert a string slice into a user message (the most common case).
    fn from(content: &str) -> Self {
        Self::user(content)
    }
}

impl From<(&str, &str)> for Message {
    /// Convert a `(role, content)` tuple into a message with that role.
    fn from((role, content): (&str, &str)) -> Self {
        Self::new(role, content)
    }
}
