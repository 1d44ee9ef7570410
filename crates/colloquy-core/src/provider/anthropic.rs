//! Message-list adapter for the Anthropic Messages API.
//!
//! The API is stateless but strict: roles must alternate starting with a
//! user turn, system text goes in a top-level field, and signed thinking
//! blocks must be echoed back unchanged.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::http::{base_url, send_json};
use super::{AdapterKind, ProviderAdapter, ProviderError, ProviderReply, SendRequest, Usage};
use crate::message::{Message, Role};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_THINKING_MAX_TOKENS: u32 = 16_000;
/// Smallest thinking budget the API accepts.
const MIN_THINKING_BUDGET: u32 = 1024;
const CONTINUATION_PROMPT: &str = "(continuing the conversation)";

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, api_key: &str, api_base: Option<&str>, model: Option<&str>) -> Self {
        let base_url = base_url(api_base, DEFAULT_BASE_URL);
        debug!(base_url = %base_url, "Initialized anthropic adapter");
        Self {
            client,
            api_key: api_key.to_string(),
            base_url,
            default_model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }

    pub(crate) fn build_body(&self, request: &SendRequest<'_>) -> Value {
        let mut system: Vec<String> = Vec::new();
        if !request.instructions.is_empty() {
            system.push(request.instructions.to_string());
        }

        let mut messages: Vec<Value> = Vec::new();
        for msg in request.history {
            if msg.role == Role::System {
                system.push(msg.text());
                continue;
            }
            let mut encoded = msg.to_provider_format(AdapterKind::MessageList);
            if let Some(blocks) = encoded["content"].as_array_mut() {
                blocks.retain(|b| {
                    b.get("type").and_then(Value::as_str) != Some("thinking")
                        || b.get("signature").is_some()
                });
                if blocks.is_empty() {
                    continue;
                }
            }
            push_merged(&mut messages, encoded);
        }

        if messages
            .first()
            .is_some_and(|m| m["role"] == "assistant")
        {
            messages.insert(
                0,
                json!({"role": "user", "content": [{"type": "text", "text": CONTINUATION_PROMPT}]}),
            );
        }

        let max_tokens = if request.thinking.enabled() {
            request.budget.response_tokens_or(DEFAULT_THINKING_MAX_TOKENS)
        } else {
            request.budget.response_tokens_or(DEFAULT_MAX_TOKENS)
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": max_tokens,
            "messages": messages,
        });

        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.qualified_name(),
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect(),
            );
        }

        if request.thinking.enabled() {
            let budget = request.thinking.budget_tokens(max_tokens).max(MIN_THINKING_BUDGET);
            if budget < max_tokens {
                body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
            } else {
                debug!(max_tokens, "Response allowance too small for thinking, skipping");
            }
        }

        body
    }

    pub(crate) fn parse_reply(
        request: &SendRequest<'_>,
        body: &Value,
    ) -> Result<ProviderReply, ProviderError> {
        let message =
            Message::from_provider_format(AdapterKind::MessageList, body, request.thread.clone())?;
        if message.role != Role::Assistant {
            return Err(ProviderError::Malformed(format!(
                "expected an assistant reply, got {}",
                message.role
            )));
        }
        let usage = Usage {
            input_tokens: body
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            output_tokens: body
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        };
        debug!(
            stop_reason = body["stop_reason"].as_str().unwrap_or("unknown"),
            "Received anthropic reply"
        );
        Ok(ProviderReply::new(message, usage))
    }
}

/// Append `next`, folding it into the previous message when roles repeat.
fn push_merged(messages: &mut Vec<Value>, next: Value) {
    if let Some(prev) = messages.last_mut() {
        if prev["role"] == next["role"] {
            if let (Some(prev_blocks), Some(next_blocks)) =
                (prev["content"].as_array_mut(), next["content"].as_array())
            {
                prev_blocks.extend(next_blocks.iter().cloned());
                return;
            }
        }
    }
    messages.push(next);
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::MessageList
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send(&self, request: SendRequest<'_>) -> Result<ProviderReply, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_body(&request);
        debug!(
            thread = %request.thread,
            model = request.model,
            messages = body["messages"].as_array().map_or(0, Vec::len),
            "Sending messages request"
        );

        let response = send_json(
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body),
        )
        .await?;

        Self::parse_reply(&request, &response)
    }
}
