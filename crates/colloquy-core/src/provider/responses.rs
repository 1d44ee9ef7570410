//! Stateless adapter for the OpenAI Responses API.
//!
//! Every call carries the full truncated history. Responses are not stored
//! server-side (`store: false`); reasoning is round-tripped through
//! `encrypted_content` instead.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::http::{base_url, send_json};
use super::{AdapterKind, ProviderAdapter, ProviderError, ProviderReply, SendRequest, Usage};
use crate::mcp::ToolSpec;
use crate::message::Message;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct ResponsesAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl ResponsesAdapter {
    pub fn new(client: Client, api_key: &str, api_base: Option<&str>, model: Option<&str>) -> Self {
        let base_url = base_url(api_base, DEFAULT_BASE_URL);
        debug!(base_url = %base_url, "Initialized responses adapter");
        Self {
            client,
            api_key: api_key.to_string(),
            base_url,
            default_model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }

    pub(crate) fn build_body(&self, request: &SendRequest<'_>) -> Value {
        let input: Vec<Value> = request
            .history
            .iter()
            .flat_map(|m| match m.to_provider_format(AdapterKind::StatelessResponses) {
                Value::Array(items) => items,
                other => vec![other],
            })
            .filter(|item| {
                // Reasoning is only accepted back with its encrypted payload.
                item.get("type").and_then(Value::as_str) != Some("reasoning")
                    || item.get("encrypted_content").is_some()
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "input": input,
            "store": false,
            "max_output_tokens": request.budget.response_tokens_or(DEFAULT_MAX_OUTPUT_TOKENS),
        });

        if !request.instructions.is_empty() {
            body["instructions"] = Value::String(request.instructions.to_string());
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(function_tool).collect());
        }
        if request.thinking.enabled() {
            body["reasoning"] = json!({"effort": request.thinking.effort(), "summary": "auto"});
            body["include"] = json!(["reasoning.encrypted_content"]);
        }
        body
    }

    pub(crate) fn parse_reply(
        request: &SendRequest<'_>,
        body: &Value,
    ) -> Result<ProviderReply, ProviderError> {
        if let Some(status) = body.get("status").and_then(Value::as_str) {
            if status == "failed" {
                let reason = body
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("response failed");
                return Err(ProviderError::Transient(reason.to_string()));
            }
        }

        let message = Message::from_provider_format(
            AdapterKind::StatelessResponses,
            body,
            request.thread.clone(),
        )?;
        let usage = Usage {
            input_tokens: token_field(body, "/usage/input_tokens"),
            output_tokens: token_field(body, "/usage/output_tokens"),
        };
        Ok(ProviderReply::new(message, usage))
    }
}

fn token_field(body: &Value, pointer: &str) -> u32 {
    body.pointer(pointer).and_then(Value::as_u64).unwrap_or(0) as u32
}

fn function_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "name": spec.qualified_name(),
        "description": spec.description,
        "parameters": spec.input_schema,
    })
}

#[async_trait]
impl ProviderAdapter for ResponsesAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::StatelessResponses
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send(&self, request: SendRequest<'_>) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/responses", self.base_url);
        let body = self.build_body(&request);
        debug!(
            thread = %request.thread,
            model = request.model,
            items = body["input"].as_array().map_or(0, Vec::len),
            "Sending responses request"
        );

        let response = send_json(
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let reply = Self::parse_reply(&request, &response)?;
        debug!(
            tool_calls = reply.tool_requests.len(),
            tokens = reply.usage.total(),
            "Received responses reply"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentPart, Role, ThreadId, ToolCallRequest, ToolResult};
    use crate::provider::{BudgetPolicy, ThinkingConfig};

    fn adapter() -> ResponsesAdapter {
        ResponsesAdapter::new(Client::new(), "sk-test", None, None)
    }

    fn request<'a>(
        thread: &'a ThreadId,
        history: &'a [Message],
        tools: &'a [ToolSpec],
        thinking: ThinkingConfig,
    ) -> SendRequest<'a> {
        SendRequest {
            thread,
            handle: None,
            history,
            pending: &history[history.len() - 1..],
            instructions: "You are a helpful assistant.",
            tools,
            budget: BudgetPolicy::new(10_000, 0),
            thinking,
            model: "o4-mini",
        }
    }

    #[test]
    fn test_body_contains_full_history_and_tools() {
        let tid = ThreadId::from("t");
        let history = vec![
            Message::user(tid.clone(), "list files"),
            Message::new(
                tid.clone(),
                Role::Assistant,
                vec![ContentPart::ToolCall(ToolCallRequest::new(
                    "call_1",
                    "files",
                    "list",
                    Default::default(),
                ))],
            ),
            Message::tool_result(tid.clone(), ToolResult::ok("call_1", "a.txt")),
        ];
        let tools = vec![ToolSpec {
            server: "files".into(),
            name: "list".into(),
            description: "List files".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = adapter().build_body(&request(&tid, &history, &tools, ThinkingConfig::new(2)));

        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(body["tools"][0]["name"], "files__list");
        assert_eq!(body["reasoning"]["effort"], "high");
        assert_eq!(body["store"], false);
        assert_eq!(body["max_output_tokens"], DEFAULT_MAX_OUTPUT_TOKENS);
    }

    #[test]
    fn test_unsigned_reasoning_is_not_sent_back() {
        let tid = ThreadId::from("t");
        let history = vec![Message::new(
            tid.clone(),
            Role::Assistant,
            vec![
                ContentPart::Thinking {
                    thinking: "from another provider".into(),
                    signature: None,
                },
                ContentPart::text("hello"),
            ],
        )];
        let body = adapter().build_body(&request(&tid, &history, &[], ThinkingConfig::default()));
        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 1);
        assert_eq!(input[0]["type"], "message");
        assert!(body.get("reasoning").is_none());
    }

    #[test]
    fn test_parse_reply_with_tool_call_and_usage() {
        let tid = ThreadId::from("t");
        let history = vec![Message::user(tid.clone(), "hi")];
        let req = request(&tid, &history, &[], ThinkingConfig::default());
        let body = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "Looking."}]},
                {"type": "function_call", "call_id": "call_2", "name": "web__search", "arguments": "{\"q\":\"rust\"}"}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 30}
        });
        let reply = ResponsesAdapter::parse_reply(&req, &body).unwrap();
        assert_eq!(reply.message.text(), "Looking.");
        assert_eq!(reply.tool_requests.len(), 1);
        assert_eq!(reply.tool_requests[0].server, "web");
        assert_eq!(reply.usage.total(), 150);
    }

    #[test]
    fn test_failed_status_is_transient() {
        let tid = ThreadId::from("t");
        let history = vec![Message::user(tid.clone(), "hi")];
        let req = request(&tid, &history, &[], ThinkingConfig::default());
        let body = json!({"status": "failed", "error": {"message": "server_error"}, "output": []});
        let err = ResponsesAdapter::parse_reply(&req, &body).unwrap_err();
        assert!(err.is_transient());
    }
}
