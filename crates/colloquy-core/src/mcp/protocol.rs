//! JSON-RPC 2.0 and MCP message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{McpError, ToolOutput};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    /// Absent on notifications and server-initiated requests.
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// Extract the result from a response, converting errors to [`McpError`].
pub fn extract_result(server: &str, response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Server {
            server: server.to_string(),
            code: err.code,
            message: err.message,
        });
    }
    response.result.ok_or_else(|| McpError::Server {
        server: server.to_string(),
        code: -32603,
        message: "response missing both result and error".into(),
    })
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

/// Parse a `tools/list` result into its tools and the next page cursor.
pub fn parse_tools_list(result: Value) -> Result<(Vec<ToolDefinition>, Option<String>), serde_json::Error> {
    let parsed: ListToolsResult = serde_json::from_value(result)?;
    Ok((parsed.tools, parsed.next_cursor))
}

/// Flatten a `tools/call` result.
///
/// Text items are joined with newlines. Other content kinds are noted by
/// type so the model knows something was returned.
pub fn parse_call_result(result: &Value) -> ToolOutput {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut texts = Vec::new();
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = item.get("text").and_then(Value::as_str) {
                        texts.push(t.to_string());
                    }
                }
                Some("resource") => {
                    let text = item.pointer("/resource/text").and_then(Value::as_str);
                    let uri = item.pointer("/resource/uri").and_then(Value::as_str);
                    match (text, uri) {
                        (Some(t), _) => texts.push(t.to_string()),
                        (None, Some(u)) => texts.push(format!("[resource {u}]")),
                        _ => {}
                    }
                }
                Some(other) => texts.push(format!("[{other} content]")),
                None => {}
            }
        }
    }

    if texts.is_empty() {
        if let Some(structured) = result.get("structuredContent") {
            texts.push(structured.to_string());
        }
    }

    ToolOutput {
        text: texts.join("\n"),
        is_error,
    }
}
