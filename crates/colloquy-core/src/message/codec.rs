//! Conversion between [`Message`] and provider wire shapes.
//!
//! Each adapter kind has its own JSON representation:
//!
//! - [`AdapterKind::MessageList`]: one `{role, content: [blocks]}` object in
//!   the Anthropic Messages format.
//! - [`AdapterKind::StatelessResponses`]: an array of OpenAI Responses input
//!   items (`message`, `reasoning`, `function_call`, `function_call_output`).
//! - [`AdapterKind::StatefulThread`]: one Assistants-style thread message
//!   `{role, content: [parts]}`.
//!
//! Encoding and then decoding yields an equivalent message; part order is
//! preserved in every format.

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;

use super::{ContentPart, Message, Role, ThreadId, ToolCallRequest, ToolResult};
use crate::provider::AdapterKind;

/// Prefix marking a failed tool result in formats without an error flag.
pub const TOOL_ERROR_TAG: &str = "[tool error] ";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: AdapterKind, reason: String },
}

fn malformed(kind: AdapterKind, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        kind,
        reason: reason.into(),
    }
}

impl Message {
    /// Encode this message in the wire shape of `kind`.
    pub fn to_provider_format(&self, kind: AdapterKind) -> Value {
        match kind {
            AdapterKind::MessageList => encode_message_list(self),
            AdapterKind::StatelessResponses => Value::Array(encode_response_items(self)),
            AdapterKind::StatefulThread => encode_thread_message(self),
        }
    }

    /// Decode a provider payload into a message owned by `thread_id`.
    pub fn from_provider_format(
        kind: AdapterKind,
        raw: &Value,
        thread_id: ThreadId,
    ) -> Result<Self, CodecError> {
        let (role, parts) = match kind {
            AdapterKind::MessageList => decode_message_list(raw)?,
            AdapterKind::StatelessResponses => decode_response_items(raw)?,
            AdapterKind::StatefulThread => decode_thread_message(raw)?,
        };
        Ok(Message::new(thread_id, role, parts))
    }
}

fn parse_arguments(kind: AdapterKind, raw: &Value) -> Result<Map<String, Value>, CodecError> {
    match raw {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => serde_json::from_str::<Map<String, Value>>(s)
            .map_err(|e| malformed(kind, format!("tool arguments are not a JSON object: {e}"))),
        other => Err(malformed(kind, format!("unexpected tool arguments: {other}"))),
    }
}

/// Build a tool call from wire fields. Unparsable arguments are recorded on
/// the call instead of failing the whole message.
fn decode_call(kind: AdapterKind, id: &str, qualified: &str, raw_args: &Value) -> ToolCallRequest {
    match parse_arguments(kind, raw_args) {
        Ok(args) => ToolCallRequest::from_qualified(id, qualified, args),
        Err(e) => {
            warn!(tool = qualified, error = %e, "Keeping tool call with unparsable arguments");
            let mut call = ToolCallRequest::from_qualified(id, qualified, Map::new());
            call.argument_error = Some(e.to_string());
            call
        }
    }
}

fn arguments_string(call: &ToolCallRequest) -> String {
    serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".into())
}

fn role_from_str(kind: AdapterKind, role: &str) -> Result<Role, CodecError> {
    match role {
        "user" => Ok(Role::User),
        "assistant" | "model" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        "system" | "developer" => Ok(Role::System),
        other => Err(malformed(kind, format!("unknown role '{other}'"))),
    }
}

/// Flatten tool-result content that may be a string or a list of text blocks.
fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── Message list (Anthropic) ────────────────────────────────────────

fn encode_message_list(msg: &Message) -> Value {
    let role = match msg.role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };

    let content: Vec<Value> = msg
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": "text", "text": text}),
            ContentPart::Thinking {
                thinking,
                signature,
            } => {
                let mut block = json!({"type": "thinking", "thinking": thinking});
                if let Some(sig) = signature {
                    block["signature"] = Value::String(sig.clone());
                }
                block
            }
            ContentPart::RedactedThinking { data } => {
                json!({"type": "redacted_thinking", "data": data})
            }
            ContentPart::ToolCall(call) => json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.qualified_name(),
                "input": Value::Object(call.arguments.clone()),
            }),
            ContentPart::ToolResult(result) => json!({
                "type": "tool_result",
                "tool_use_id": result.call_id,
                "content": result.payload,
                "is_error": !result.success,
            }),
        })
        .collect();

    json!({"role": role, "content": content})
}

fn decode_message_list(raw: &Value) -> Result<(Role, Vec<ContentPart>), CodecError> {
    let kind = AdapterKind::MessageList;
    let role = raw
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(kind, "missing role"))?;
    let mut role = role_from_str(kind, role)?;

    let mut parts = Vec::new();
    match raw.get("content") {
        Some(Value::String(text)) => parts.push(ContentPart::text(text.clone())),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(part) = decode_message_list_block(block)? {
                    parts.push(part);
                }
            }
        }
        _ => return Err(malformed(kind, "missing content")),
    }

    if role == Role::User
        && !parts.is_empty()
        && parts.iter().all(|p| matches!(p, ContentPart::ToolResult(_)))
    {
        role = Role::Tool;
    }

    Ok((role, parts))
}

fn decode_message_list_block(block: &Value) -> Result<Option<ContentPart>, CodecError> {
    let kind = AdapterKind::MessageList;
    let str_field = |name: &str| -> Result<String, CodecError> {
        block
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed(kind, format!("block missing '{name}'")))
    };

    let part = match block.get("type").and_then(Value::as_str) {
        Some("text") => ContentPart::Text {
            text: str_field("text")?,
        },
        Some("thinking") => ContentPart::Thinking {
            thinking: str_field("thinking")?,
            signature: block
                .get("signature")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        Some("redacted_thinking") => ContentPart::RedactedThinking {
            data: str_field("data")?,
        },
        Some("tool_use") => ContentPart::ToolCall(decode_call(
            kind,
            &str_field("id")?,
            &str_field("name")?,
            block.get("input").unwrap_or(&Value::Null),
        )),
        Some("tool_result") => {
            let success = !block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            ContentPart::ToolResult(ToolResult {
                call_id: str_field("tool_use_id")?,
                success,
                payload: content_text(block.get("content").unwrap_or(&Value::Null)),
            })
        }
        other => {
            warn!(block_type = ?other, "Skipping unsupported content block");
            return Ok(None);
        }
    };
    Ok(Some(part))
}

// ── Stateless responses (OpenAI Responses) ──────────────────────────

fn encode_response_items(msg: &Message) -> Vec<Value> {
    let role = match msg.role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    let text_type = if msg.role == Role::Assistant {
        "output_text"
    } else {
        "input_text"
    };

    msg.parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({
                "type": "message",
                "role": role,
                "content": [{"type": text_type, "text": text}],
            }),
            ContentPart::Thinking {
                thinking,
                signature,
            } => {
                let mut item = json!({
                    "type": "reasoning",
                    "summary": [{"type": "summary_text", "text": thinking}],
                });
                if let Some(sig) = signature {
                    item["encrypted_content"] = Value::String(sig.clone());
                }
                item
            }
            ContentPart::RedactedThinking { data } => json!({
                "type": "reasoning",
                "summary": [],
                "encrypted_content": data,
            }),
            ContentPart::ToolCall(call) => json!({
                "type": "function_call",
                "call_id": call.id,
                "name": call.qualified_name(),
                "arguments": arguments_string(call),
            }),
            ContentPart::ToolResult(result) => {
                let output = if result.success {
                    result.payload.clone()
                } else {
                    format!("{TOOL_ERROR_TAG}{}", result.payload)
                };
                json!({
                    "type": "function_call_output",
                    "call_id": result.call_id,
                    "output": output,
                })
            }
        })
        .collect()
}

fn decode_response_items(raw: &Value) -> Result<(Role, Vec<ContentPart>), CodecError> {
    let kind = AdapterKind::StatelessResponses;
    let items = match raw {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get("output")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed(kind, "expected an item array or an `output` array"))?,
        _ => return Err(malformed(kind, "expected an item array")),
    };

    let mut role: Option<Role> = None;
    let mut parts = Vec::new();

    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                if role.is_none() {
                    let r = item.get("role").and_then(Value::as_str).unwrap_or("assistant");
                    role = Some(role_from_str(kind, r)?);
                }
                let content = item.get("content").cloned().unwrap_or(Value::Null);
                match content {
                    Value::String(text) => parts.push(ContentPart::text(text)),
                    Value::Array(blocks) => {
                        for block in blocks {
                            let text = block
                                .get("text")
                                .or_else(|| block.get("refusal"))
                                .and_then(Value::as_str);
                            if let Some(text) = text {
                                parts.push(ContentPart::text(text));
                            }
                        }
                    }
                    _ => return Err(malformed(kind, "message item without content")),
                }
            }
            Some("reasoning") => {
                // An empty summary array marks redacted reasoning. A summary
                // entry with empty text is still readable thinking.
                let summary: Vec<&str> = item
                    .get("summary")
                    .and_then(Value::as_array)
                    .map(|s| {
                        s.iter()
                            .filter_map(|t| t.get("text").and_then(Value::as_str))
                            .collect()
                    })
                    .unwrap_or_default();
                let encrypted = item
                    .get("encrypted_content")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match (summary.is_empty(), encrypted) {
                    (true, Some(data)) => parts.push(ContentPart::RedactedThinking { data }),
                    (_, signature) => parts.push(ContentPart::Thinking {
                        thinking: summary.join("\n"),
                        signature,
                    }),
                }
            }
            Some("function_call") => {
                let call_id = item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "function_call without call_id"))?;
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "function_call without name"))?;
                parts.push(ContentPart::ToolCall(decode_call(
                    kind,
                    call_id,
                    name,
                    item.get("arguments").unwrap_or(&Value::Null),
                )));
            }
            Some("function_call_output") => {
                let call_id = item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "function_call_output without call_id"))?;
                let output = content_text(item.get("output").unwrap_or(&Value::Null));
                let result = match output.strip_prefix(TOOL_ERROR_TAG) {
                    Some(error) => ToolResult::failed(call_id, error),
                    None => ToolResult::ok(call_id, output),
                };
                parts.push(ContentPart::ToolResult(result));
            }
            other => warn!(item_type = ?other, "Skipping unsupported response item"),
        }
    }

    let role = match role {
        Some(Role::User)
            if parts.iter().all(|p| matches!(p, ContentPart::ToolResult(_))) =>
        {
            Role::Tool
        }
        Some(role) => role,
        None if !parts.is_empty()
            && parts.iter().all(|p| matches!(p, ContentPart::ToolResult(_))) =>
        {
            Role::Tool
        }
        None => Role::Assistant,
    };

    Ok((role, parts))
}

// ── Stateful thread (Assistants) ────────────────────────────────────

fn encode_thread_message(msg: &Message) -> Value {
    let content: Vec<Value> = msg
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({
                "type": "text",
                "text": {"value": text, "annotations": []},
            }),
            ContentPart::Thinking {
                thinking,
                signature,
            } => {
                let mut reasoning = json!({"text": thinking});
                if let Some(sig) = signature {
                    reasoning["signature"] = Value::String(sig.clone());
                }
                json!({"type": "reasoning", "reasoning": reasoning})
            }
            ContentPart::RedactedThinking { data } => json!({
                "type": "reasoning",
                "reasoning": {"encrypted": data},
            }),
            ContentPart::ToolCall(call) => json!({
                "type": "tool_call",
                "tool_call": {
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.qualified_name(), "arguments": arguments_string(call)},
                },
            }),
            ContentPart::ToolResult(result) => json!({
                "type": "tool_output",
                "tool_output": {
                    "tool_call_id": result.call_id,
                    "output": result.payload,
                    "is_error": !result.success,
                },
            }),
        })
        .collect();

    json!({"role": msg.role.as_str(), "content": content})
}

fn decode_thread_message(raw: &Value) -> Result<(Role, Vec<ContentPart>), CodecError> {
    let kind = AdapterKind::StatefulThread;
    let role = raw
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(kind, "missing role"))?;
    let role = role_from_str(kind, role)?;

    let blocks = match raw.get("content") {
        Some(Value::Array(blocks)) => blocks,
        Some(Value::String(text)) => return Ok((role, vec![ContentPart::text(text.clone())])),
        _ => return Err(malformed(kind, "missing content")),
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block
                    .get("text")
                    .and_then(|t| t.get("value").or(Some(t)))
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "text part without value"))?;
                parts.push(ContentPart::text(text));
            }
            Some("reasoning") => {
                let reasoning = block.get("reasoning").unwrap_or(&Value::Null);
                if let Some(data) = reasoning.get("encrypted").and_then(Value::as_str) {
                    parts.push(ContentPart::RedactedThinking {
                        data: data.to_string(),
                    });
                } else {
                    parts.push(ContentPart::Thinking {
                        thinking: reasoning
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        signature: reasoning
                            .get("signature")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
            Some("tool_call") => {
                let call = block.get("tool_call").unwrap_or(&Value::Null);
                parts.push(ContentPart::ToolCall(decode_function_tool_call(kind, call)?));
            }
            Some("tool_output") => {
                let output = block.get("tool_output").unwrap_or(&Value::Null);
                let call_id = output
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(kind, "tool_output without tool_call_id"))?;
                parts.push(ContentPart::ToolResult(ToolResult {
                    call_id: call_id.to_string(),
                    success: !output
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    payload: content_text(output.get("output").unwrap_or(&Value::Null)),
                }));
            }
            other => warn!(part_type = ?other, "Skipping unsupported thread content part"),
        }
    }

    Ok((role, parts))
}

/// Decode an OpenAI `{id, type: "function", function: {name, arguments}}` call.
pub(crate) fn decode_function_tool_call(
    kind: AdapterKind,
    call: &Value,
) -> Result<ToolCallRequest, CodecError> {
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(kind, "tool call without id"))?;
    let function = call
        .get("function")
        .ok_or_else(|| malformed(kind, "tool call without function"))?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(kind, "tool call without function name"))?;
    Ok(decode_call(
        kind,
        id,
        name,
        function.get("arguments").unwrap_or(&Value::Null),
    ))
}
