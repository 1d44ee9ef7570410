//! Canonical, provider-agnostic message model.
//!
//! A [`Message`] is one turn of a thread. Its content is an ordered list of
//! [`ContentPart`]s rather than a flat string: providers that emit thinking
//! blocks expect them echoed back verbatim and in their original position,
//! and tool calls/results travel as structured parts alongside text.
//!
//! The [`codec`] submodule converts messages to and from each provider's wire
//! shape.

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Separator between server id and tool name in qualified tool names.
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// Stable identifier of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ThreadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a persisted message.
pub type MessageId = String;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from the model to invoke a tool on a specific tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, echoed back in the matching [`ToolResult`].
    pub id: String,
    /// Tool server identifier from the registry.
    pub server: String,
    /// Tool name as the server knows it.
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Set when the provider sent arguments that are not a JSON object.
    /// The call is kept so it can be answered with a failed result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_error: Option<String>,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        server: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            server: server.into(),
            name: name.into(),
            arguments,
            argument_error: None,
        }
    }

    /// Build a request from a `<server>__<tool>` name as seen on the wire.
    ///
    /// A name without the separator yields an empty server id, which the
    /// dispatcher reports as an unknown server.
    pub fn from_qualified(
        id: impl Into<String>,
        qualified: &str,
        arguments: Map<String, Value>,
    ) -> Self {
        let (server, name) = qualified
            .split_once(TOOL_NAME_SEPARATOR)
            .unwrap_or(("", qualified));
        Self::new(id, server, name, arguments)
    }

    /// The `<server>__<tool>` name advertised to providers.
    pub fn qualified_name(&self) -> String {
        qualify_tool_name(&self.server, &self.name)
    }
}

/// Join a server id and tool name into the name advertised to providers.
pub fn qualify_tool_name(server: &str, tool: &str) -> String {
    if server.is_empty() {
        tool.to_string()
    } else {
        format!("{server}{TOOL_NAME_SEPARATOR}{tool}")
    }
}

/// Outcome of a tool invocation, matched to its request by `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    /// Result text on success, human-readable error text on failure.
    pub payload: String,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            payload: payload.into(),
        }
    }

    pub fn failed(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            payload: error.into(),
        }
    }
}

/// One ordered piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Provider reasoning. `signature` is the opaque token some providers
    /// require to accept the block back on the next request.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Reasoning the provider only hands out encrypted.
    RedactedThinking {
        data: String,
    },
    ToolCall(ToolCallRequest),
    ToolResult(ToolResult),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A single turn in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Cached token estimate, filled in once by the token accountant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// Position in the thread, assigned by the store on append.
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(thread_id: ThreadId, role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            thread_id,
            role,
            parts,
            token_count: None,
            seq: 0,
            created_at: Utc::now(),
        }
    }

    pub fn user(thread_id: ThreadId, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(thread_id: ThreadId, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn system(thread_id: ThreadId, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::System, vec![ContentPart::text(text)])
    }

    pub fn tool_result(thread_id: ThreadId, result: ToolResult) -> Self {
        Self::new(thread_id, Role::Tool, vec![ContentPart::ToolResult(result)])
    }

    /// Concatenated text parts, separated by blank lines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Tool-call requests in the order the provider emitted them.
    pub fn tool_calls(&self) -> Vec<&ToolCallRequest> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::ToolCall(_)))
    }

    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Same role and same ordered parts. Ids, positions and timestamps are
    /// ignored.
    pub fn equivalent(&self, other: &Message) -> bool {
        self.role == other.role && self.parts == other.parts
    }

    /// Short single-line excerpt of the text content.
    pub fn excerpt(&self, max_chars: usize) -> String {
        excerpt(&self.text(), max_chars)
    }
}

/// First `max_chars` characters of `text` on one line, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
