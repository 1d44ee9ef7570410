//! Scripted providers, fake tool servers and a faulty store for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::mcp::config::ServerSpec;
use crate::mcp::protocol::ToolDefinition;
use crate::mcp::{McpError, ServerLauncher, ToolOutput, ToolServer};
use crate::message::{ContentPart, Message, MessageId, Role, ThreadId, ToolCallRequest};
use crate::provider::{
    AdapterKind, ProviderAdapter, ProviderError, ProviderReply, SendRequest, Usage,
};
use crate::store::{HistoryStore, NewThread, StoreError, Thread};

// ── Scripted provider ───────────────────────────────────────────────

/// What the scripted adapter does on one `send`.
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    /// Ask for a tool; `(server, tool, arguments)`.
    ToolCall(String, String, Value),
    Transient,
    InvalidHandle,
    Rejected,
}

impl Step {
    pub fn text(text: &str) -> Self {
        Self::Text(text.into())
    }

    pub fn tool(server: &str, tool: &str, args: Value) -> Self {
        Self::ToolCall(server.into(), tool.into(), args)
    }
}

/// One observed `send`.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub handle: Option<String>,
    pub history: Vec<Message>,
    pub pending: Vec<Message>,
    pub tool_names: Vec<String>,
}

/// Adapter that replays a fixed script. The last step repeats once the
/// script runs out.
pub struct ScriptedAdapter {
    kind: AdapterKind,
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    delay: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    replays: Mutex<Vec<(String, usize)>>,
    handles: AtomicU32,
    tool_ids: AtomicU32,
}

impl ScriptedAdapter {
    pub fn new(kind: AdapterKind, steps: Vec<Step>) -> Self {
        Self {
            kind,
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            replays: Mutex::new(Vec::new()),
            handles: AtomicU32::new(0),
            tool_ids: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// `(handle, message count)` for every replay.
    pub fn replays(&self) -> Vec<(String, usize)> {
        self.replays.lock().unwrap().clone()
    }

    pub fn handles_opened(&self) -> u32 {
        self.handles.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(step) = steps.pop_front() {
            *last = Some(step.clone());
            step
        } else {
            last.clone().unwrap_or_else(|| Step::text("ok"))
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn default_model(&self) -> &str {
        "gpt-4o"
    }

    async fn open_handle(&self) -> Result<String, ProviderError> {
        let n = self.handles.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("handle_{n}"))
    }

    async fn replay(&self, handle: &str, history: &[Message]) -> Result<(), ProviderError> {
        self.replays
            .lock()
            .unwrap()
            .push((handle.to_string(), history.len()));
        Ok(())
    }

    async fn send(&self, request: SendRequest<'_>) -> Result<ProviderReply, ProviderError> {
        self.calls.lock().unwrap().push(RecordedCall {
            handle: request.handle.map(String::from),
            history: request.history.to_vec(),
            pending: request.pending.to_vec(),
            tool_names: request.tools.iter().map(|t| t.qualified_name()).collect(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
        };
        let thread = request.thread.clone();
        match self.next_step() {
            Step::Text(text) => Ok(ProviderReply::new(Message::assistant(thread, text), usage)),
            Step::ToolCall(server, tool, args) => {
                let n = self.tool_ids.fetch_add(1, Ordering::SeqCst) + 1;
                let arguments = match args {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let call = ToolCallRequest::new(format!("call_{n}"), server, tool, arguments);
                let message = Message::new(thread, Role::Assistant, vec![ContentPart::ToolCall(call)]);
                Ok(ProviderReply::new(message, usage))
            }
            Step::Transient => Err(ProviderError::Transient("503 service unavailable".into())),
            Step::InvalidHandle => Err(ProviderError::InvalidHandle("thread not found".into())),
            Step::Rejected => Err(ProviderError::Rejected {
                status: 400,
                message: "bad request".into(),
            }),
        }
    }
}

// ── Fake tool servers ───────────────────────────────────────────────

#[derive(Clone)]
enum Behaviour {
    Echo,
    Fail(String),
}

/// In-process tool server exposing a single `echo` tool.
#[derive(Clone)]
pub struct FakeToolServer {
    behaviour: Behaviour,
    delay: Duration,
}

impl FakeToolServer {
    /// Returns the `text` argument.
    pub fn echo() -> Self {
        Self {
            behaviour: Behaviour::Echo,
            delay: Duration::ZERO,
        }
    }

    /// Reports a tool-level error with the given text.
    pub fn failing(message: &str) -> Self {
        Self {
            behaviour: Behaviour::Fail(message.into()),
            delay: Duration::ZERO,
        }
    }

    /// Delay every `call_tool`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ToolServer for FakeToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        Ok(vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo the text argument".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        }])
    }

    async fn call_tool(&self, _name: &str, arguments: Map<String, Value>) -> Result<ToolOutput, McpError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(match &self.behaviour {
            Behaviour::Echo => ToolOutput {
                text: arguments
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_error: false,
            },
            Behaviour::Fail(message) => ToolOutput {
                text: message.clone(),
                is_error: true,
            },
        })
    }
}

/// Hands out [`FakeToolServer`]s by name and counts launches.
#[derive(Default)]
pub struct FakeLauncher {
    servers: HashMap<String, FakeToolServer>,
    launches: Mutex<HashMap<String, usize>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, name: &str, server: FakeToolServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    pub fn launches(&self, name: &str) -> usize {
        self.launches.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, name: &str, _spec: &ServerSpec) -> Result<Arc<dyn ToolServer>, McpError> {
        *self.launches.lock().unwrap().entry(name.to_string()).or_default() += 1;
        match self.servers.get(name) {
            Some(server) => Ok(Arc::new(server.clone())),
            None => Err(McpError::Spawn {
                name: name.to_string(),
                reason: "no such binary".into(),
            }),
        }
    }
}

// ── Faulty store ────────────────────────────────────────────────────

/// Wraps a store and fails appends of assistant messages once armed.
pub struct FailingStore<S> {
    inner: S,
    fail_assistant_appends: AtomicBool,
}

impl<S: HistoryStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_assistant_appends: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.fail_assistant_appends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: HistoryStore> HistoryStore for FailingStore<S> {
    async fn create_thread(&self, new: NewThread) -> Result<ThreadId, StoreError> {
        self.inner.create_thread(new).await
    }

    async fn append(&self, thread: &ThreadId, message: Message) -> Result<MessageId, StoreError> {
        if message.role == Role::Assistant && self.fail_assistant_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.append(thread, message).await
    }

    async fn list_messages(
        &self,
        thread: &ThreadId,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        self.inner.list_messages(thread, before, limit).await
    }

    async fn get_thread(&self, thread: &ThreadId) -> Result<Option<Thread>, StoreError> {
        self.inner.get_thread(thread).await
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError> {
        self.inner.list_threads().await
    }

    async fn delete_thread(&self, thread: &ThreadId) -> Result<bool, StoreError> {
        self.inner.delete_thread(thread).await
    }

    async fn update_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        self.inner.update_thread(thread).await
    }

    async fn schema_version(&self) -> Result<u32, StoreError> {
        self.inner.schema_version().await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.inner.migrate().await
    }
}
