//! Stateful adapter for the OpenAI Assistants v2 thread API.
//!
//! The provider owns the conversation under a thread handle. Each `send`
//! posts only the messages it has not delivered yet and starts a run, or,
//! when the previous run stopped for tool outputs, submits the results to
//! that run. Runs are polled until they settle.
//!
//! A run id is remembered until the run is seen settled, so a retried
//! `send` resumes the same run instead of posting to a busy thread. A run
//! left waiting for tool outputs by an aborted turn is cancelled before
//! the next turn starts a new one.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::http::{base_url, send_json};
use super::{AdapterKind, ProviderAdapter, ProviderError, ProviderReply, SendRequest, Usage};
use crate::message::codec::decode_function_tool_call;
use crate::message::{ContentPart, Message, MessageId, Role, ToolResult};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-handle bookkeeping kept for the life of the process.
#[derive(Default)]
struct HandleState {
    /// Run waiting on `submit_tool_outputs`.
    pending_run: Option<String>,
    /// Run started or resumed but not yet seen settled.
    active_run: Option<ActiveRun>,
    /// Local messages already posted to the thread.
    delivered: HashSet<MessageId>,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    id: String,
    /// Pending messages the run was started for.
    answers: Vec<MessageId>,
}

pub struct AssistantsAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    instructions: String,
    configured_assistant: Option<String>,
    assistant_id: OnceCell<String>,
    handles: Mutex<HashMap<String, HandleState>>,
}

impl AssistantsAdapter {
    pub fn new(
        client: Client,
        api_key: &str,
        api_base: Option<&str>,
        model: Option<&str>,
        assistant_id: Option<String>,
        instructions: String,
    ) -> Self {
        let base_url = base_url(api_base, DEFAULT_BASE_URL);
        debug!(base_url = %base_url, "Initialized assistants adapter");
        Self {
            client,
            api_key: api_key.to_string(),
            base_url,
            default_model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            instructions,
            configured_assistant: assistant_id.filter(|id| !id.is_empty()),
            assistant_id: OnceCell::new(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    fn with_handles<T>(&self, f: impl FnOnce(&mut HashMap<String, HandleState>) -> T) -> T {
        let mut guard = match self.handles.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Map a 404 on a thread-scoped call to an invalid handle.
    async fn thread_call(&self, builder: RequestBuilder, handle: &str) -> Result<Value, ProviderError> {
        match send_json(self.authed(builder)).await {
            Err(ProviderError::Rejected { status: 404, message }) => {
                self.with_handles(|h| h.remove(handle));
                Err(ProviderError::InvalidHandle(format!("{handle}: {message}")))
            }
            other => other,
        }
    }

    async fn assistant_id(&self, model: &str) -> Result<&str, ProviderError> {
        let id = self
            .assistant_id
            .get_or_try_init(|| async {
                if let Some(id) = &self.configured_assistant {
                    return Ok(id.clone());
                }
                let created = send_json(self.authed(
                    self.client
                        .post(format!("{}/assistants", self.base_url))
                        .json(&json!({
                            "model": model,
                            "name": "colloquy",
                            "instructions": self.instructions,
                        })),
                ))
                .await?;
                let id = created["id"]
                    .as_str()
                    .ok_or_else(|| ProviderError::Malformed("assistant without id".into()))?
                    .to_string();
                info!(assistant = %id, "Created assistant");
                Ok::<_, ProviderError>(id)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn post_message(&self, handle: &str, msg: &Message) -> Result<(), ProviderError> {
        let delivered = self.with_handles(|h| {
            h.get(handle)
                .is_some_and(|s| s.delivered.contains(&msg.id))
        });
        if delivered {
            return Ok(());
        }

        let content = thread_text(msg);
        if !content.is_empty() {
            let role = if msg.role == Role::Assistant { "assistant" } else { "user" };
            self.thread_call(
                self.client
                    .post(format!("{}/threads/{handle}/messages", self.base_url))
                    .json(&json!({"role": role, "content": content})),
                handle,
            )
            .await?;
        }

        self.with_handles(|h| {
            h.entry(handle.to_string())
                .or_default()
                .delivered
                .insert(msg.id.clone());
        });
        Ok(())
    }

    async fn create_run(&self, handle: &str, request: &SendRequest<'_>) -> Result<Value, ProviderError> {
        let assistant_id = self.assistant_id(request.model).await?;
        let mut body = json!({
            "assistant_id": assistant_id,
            "model": request.model,
        });
        if !request.instructions.is_empty() {
            body["instructions"] = Value::String(request.instructions.to_string());
        }
        if request.budget.max_response_tokens > 0 {
            body["max_completion_tokens"] = json!(request.budget.max_response_tokens);
        }
        if request.budget.max_history_tokens > 0 {
            body["max_prompt_tokens"] = json!(request.budget.max_history_tokens);
        }
        if request.thinking.enabled() {
            body["reasoning_effort"] = Value::String(request.thinking.effort().into());
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.qualified_name(),
                                "description": t.description,
                                "parameters": t.input_schema,
                            },
                        })
                    })
                    .collect(),
            );
        }

        self.thread_call(
            self.client
                .post(format!("{}/threads/{handle}/runs", self.base_url))
                .json(&body),
            handle,
        )
        .await
    }

    async fn start_run(
        &self,
        handle: &str,
        request: &SendRequest<'_>,
        answers: Vec<MessageId>,
    ) -> Result<Value, ProviderError> {
        for msg in request.pending {
            self.post_message(handle, msg).await?;
        }
        let run = self.create_run(handle, request).await?;
        self.track_run(handle, &run, answers);
        Ok(run)
    }

    async fn submit_outputs(
        &self,
        handle: &str,
        run_id: &str,
        results: &[&ToolResult],
    ) -> Result<Value, ProviderError> {
        let outputs: Vec<Value> = results
            .iter()
            .map(|r| {
                let output = if r.success {
                    r.payload.clone()
                } else {
                    format!("Error executing tool: {}", r.payload)
                };
                json!({"tool_call_id": r.call_id, "output": output})
            })
            .collect();
        self.thread_call(
            self.client
                .post(format!(
                    "{}/threads/{handle}/runs/{run_id}/submit_tool_outputs",
                    self.base_url
                ))
                .json(&json!({"tool_outputs": outputs})),
            handle,
        )
        .await
    }

    async fn fetch_run(&self, handle: &str, run_id: &str) -> Result<Value, ProviderError> {
        self.thread_call(
            self.client
                .get(format!("{}/threads/{handle}/runs/{run_id}", self.base_url)),
            handle,
        )
        .await
    }

    /// Cancel a run and wait until the thread accepts messages again.
    async fn cancel_run(&self, handle: &str, run_id: &str) -> Result<(), ProviderError> {
        debug!(handle, run = %run_id, "Cancelling abandoned run");
        let cancelled = self
            .thread_call(
                self.client.post(format!(
                    "{}/threads/{handle}/runs/{run_id}/cancel",
                    self.base_url
                )),
                handle,
            )
            .await;
        match cancelled {
            Ok(run) => {
                self.wait_for_run(handle, run).await?;
            }
            // Already finished on the provider side.
            Err(ProviderError::Rejected { status: 400, .. }) => {}
            Err(e) => return Err(e),
        }
        self.with_handles(|h| {
            if let Some(state) = h.get_mut(handle) {
                state.pending_run = None;
                state.active_run = None;
            }
        });
        Ok(())
    }

    fn track_run(&self, handle: &str, run: &Value, answers: Vec<MessageId>) {
        if let Some(id) = run["id"].as_str() {
            self.with_handles(|h| {
                h.entry(handle.to_string()).or_default().active_run = Some(ActiveRun {
                    id: id.to_string(),
                    answers,
                });
            });
        }
    }

    fn finish_run(&self, handle: &str) {
        self.with_handles(|h| {
            if let Some(state) = h.get_mut(handle) {
                state.active_run = None;
            }
        });
    }

    async fn wait_for_run(&self, handle: &str, mut run: Value) -> Result<Value, ProviderError> {
        loop {
            let status = run["status"].as_str().unwrap_or_default();
            if is_settled(status) {
                return Ok(run);
            }
            let run_id = run["id"]
                .as_str()
                .ok_or_else(|| ProviderError::Malformed("run without id".into()))?
                .to_string();
            tokio::time::sleep(POLL_INTERVAL).await;
            run = self.fetch_run(handle, &run_id).await?;
        }
    }

    async fn latest_message(&self, handle: &str, request: &SendRequest<'_>) -> Result<Message, ProviderError> {
        let list = self
            .thread_call(
                self.client
                    .get(format!("{}/threads/{handle}/messages", self.base_url))
                    .query(&[("order", "desc"), ("limit", "1")]),
                handle,
            )
            .await?;
        let raw = list
            .pointer("/data/0")
            .ok_or_else(|| ProviderError::Malformed("thread has no messages".into()))?;
        Ok(Message::from_provider_format(
            AdapterKind::StatefulThread,
            raw,
            request.thread.clone(),
        )?)
    }

    /// Turn a settled run into a reply.
    pub(crate) fn settle(
        &self,
        handle: &str,
        run: &Value,
        request: &SendRequest<'_>,
    ) -> Result<Option<ProviderReply>, ProviderError> {
        let usage = run_usage(run);

        match run["status"].as_str().unwrap_or_default() {
            "requires_action" => {
                let calls = run
                    .pointer("/required_action/submit_tool_outputs/tool_calls")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ProviderError::Malformed("requires_action without tool calls".into()))?;
                let mut parts = Vec::with_capacity(calls.len());
                for call in calls {
                    parts.push(ContentPart::ToolCall(decode_function_tool_call(
                        AdapterKind::StatefulThread,
                        call,
                    )?));
                }
                let run_id = run["id"].as_str().unwrap_or_default().to_string();
                self.with_handles(|h| {
                    let state = h.entry(handle.to_string()).or_default();
                    state.active_run = None;
                    state.pending_run = Some(run_id);
                });
                let message = Message::new(request.thread.clone(), Role::Assistant, parts);
                Ok(Some(ProviderReply::new(message, usage)))
            }
            "completed" => Ok(None),
            status => {
                self.finish_run(handle);
                let code = run
                    .pointer("/last_error/code")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let reason = run
                    .pointer("/last_error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("no details");
                let message = format!("run {status}: {reason}");
                if status == "expired" || matches!(code, "server_error" | "rate_limit_exceeded") {
                    Err(ProviderError::Transient(message))
                } else {
                    Err(ProviderError::Rejected { status: 0, message })
                }
            }
        }
    }
}

fn run_usage(run: &Value) -> Usage {
    let field = |name: &str| {
        run.pointer(&format!("/usage/{name}"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };
    Usage {
        input_tokens: field("prompt_tokens"),
        output_tokens: field("completion_tokens"),
    }
}

fn is_settled(status: &str) -> bool {
    matches!(
        status,
        "completed" | "requires_action" | "failed" | "cancelled" | "expired" | "incomplete"
    )
}

/// Plain-text rendering of a local message for a provider thread.
///
/// Threads accept only user and assistant text, so tool traffic from
/// replayed history is written out inline.
fn thread_text(msg: &Message) -> String {
    msg.parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.clone()),
            ContentPart::ToolCall(call) => Some(format!(
                "[called {} with {}]",
                call.qualified_name(),
                Value::Object(call.arguments.clone())
            )),
            ContentPart::ToolResult(result) if result.success => {
                Some(format!("[result of {}] {}", result.call_id, result.payload))
            }
            ContentPart::ToolResult(result) => {
                Some(format!("[error from {}] {}", result.call_id, result.payload))
            }
            ContentPart::Thinking { .. } | ContentPart::RedactedThinking { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl ProviderAdapter for AssistantsAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::StatefulThread
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn open_handle(&self) -> Result<String, ProviderError> {
        let thread = send_json(self.authed(
            self.client
                .post(format!("{}/threads", self.base_url))
                .json(&json!({})),
        ))
        .await?;
        let id = thread["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("thread without id".into()))?
            .to_string();
        info!(handle = %id, "Opened provider thread");
        Ok(id)
    }

    async fn replay(&self, handle: &str, history: &[Message]) -> Result<(), ProviderError> {
        debug!(handle, messages = history.len(), "Replaying history into provider thread");
        for msg in history.iter().filter(|m| m.role != Role::System) {
            self.post_message(handle, msg).await?;
        }
        Ok(())
    }

    async fn send(&self, request: SendRequest<'_>) -> Result<ProviderReply, ProviderError> {
        let handle = request
            .handle
            .ok_or_else(|| ProviderError::InvalidHandle("no handle on thread".into()))?;

        let results: Vec<&ToolResult> = request
            .pending
            .iter()
            .flat_map(|m| m.tool_results())
            .collect();
        let answers: Vec<MessageId> = request.pending.iter().map(|m| m.id.clone()).collect();
        let (pending_run, active_run) = self.with_handles(|h| {
            h.get(handle)
                .map(|s| (s.pending_run.clone(), s.active_run.clone()))
                .unwrap_or_default()
        });

        let run = match (active_run, pending_run) {
            (Some(active), _) if active.answers == answers => {
                debug!(handle, run = %active.id, "Resuming run");
                self.fetch_run(handle, &active.id).await?
            }
            (Some(active), _) => {
                self.cancel_run(handle, &active.id).await?;
                self.start_run(handle, &request, answers).await?
            }
            (None, Some(run_id)) if !results.is_empty() => {
                debug!(handle, run = %run_id, outputs = results.len(), "Submitting tool outputs");
                let run = self.submit_outputs(handle, &run_id, &results).await?;
                self.with_handles(|h| {
                    let state = h.entry(handle.to_string()).or_default();
                    state.pending_run = None;
                    for msg in request.pending {
                        state.delivered.insert(msg.id.clone());
                    }
                });
                self.track_run(handle, &run, answers);
                run
            }
            (None, Some(run_id)) => {
                self.cancel_run(handle, &run_id).await?;
                self.start_run(handle, &request, answers).await?
            }
            (None, None) => self.start_run(handle, &request, answers).await?,
        };

        let run = self.wait_for_run(handle, run).await?;
        if let Some(reply) = self.settle(handle, &run, &request)? {
            return Ok(reply);
        }

        let message = self.latest_message(handle, &request).await?;
        self.finish_run(handle);
        if message.role != Role::Assistant {
            return Err(ProviderError::Malformed(format!(
                "latest thread message is from {}",
                message.role
            )));
        }
        Ok(ProviderReply::new(message, run_usage(&run)))
    }
}
