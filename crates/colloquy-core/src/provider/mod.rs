//! Provider adapters and the registry that selects them.
//!
//! Every backend implements [`ProviderAdapter`]. The three kinds differ in
//! who owns the history:
//!
//! - [`AdapterKind::StatefulThread`]: the provider keeps the conversation
//!   under a handle; only new messages are sent (`assistants`).
//! - [`AdapterKind::StatelessResponses`]: the full truncated history goes
//!   out on every call (`responses`).
//! - [`AdapterKind::MessageList`]: stateless, with strict role alternation
//!   and thinking blocks that must be echoed back (`anthropic`).
//!
//! Adapters make exactly one logical call per `send`. Retries, handle
//! recovery and timeouts are driven by the orchestrator.

pub mod anthropic;
pub mod assistants;
pub(crate) mod http;
pub mod responses;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::mcp::ToolSpec;
use crate::message::codec::CodecError;
use crate::message::{Message, ThreadId, ToolCallRequest};

pub use anthropic::AnthropicAdapter;
pub use assistants::AssistantsAdapter;
pub use responses::ResponsesAdapter;

/// Which wire protocol family an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    StatefulThread,
    StatelessResponses,
    MessageList,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatefulThread => "stateful-thread",
            Self::StatelessResponses => "stateless-responses",
            Self::MessageList => "message-list",
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Self::StatefulThread)
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider, adapter kind and model bound to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub provider: String,
    pub adapter: AdapterKind,
    pub model: String,
}

impl ProviderSelection {
    pub fn new(provider: impl Into<String>, adapter: AdapterKind, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            adapter,
            model: model.into(),
        }
    }
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self::new("openai", AdapterKind::StatelessResponses, "gpt-4o")
    }
}

impl fmt::Display for ProviderSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Token limits supplied by the caller for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPolicy {
    /// Upper bound on history sent per call. `0` disables truncation.
    pub max_history_tokens: u32,
    /// Upper bound on reply length. `0` uses the adapter default.
    pub max_response_tokens: u32,
}

impl BudgetPolicy {
    pub fn new(max_history_tokens: u32, max_response_tokens: u32) -> Self {
        Self {
            max_history_tokens,
            max_response_tokens,
        }
    }

    pub fn response_tokens_or(&self, default: u32) -> u32 {
        if self.max_response_tokens == 0 {
            default
        } else {
            self.max_response_tokens
        }
    }
}

/// Extended thinking level: 0 off, 1 medium, 2 high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThinkingConfig {
    pub level: u8,
}

impl ThinkingConfig {
    pub fn new(level: u8) -> Self {
        Self { level: level.min(2) }
    }

    pub fn enabled(&self) -> bool {
        self.level > 0
    }

    /// Thinking budget carved out of the response allowance.
    pub fn budget_tokens(&self, max_response_tokens: u32) -> u32 {
        (max_response_tokens / 4) * 3
    }

    /// OpenAI reasoning effort.
    pub fn effort(&self) -> &'static str {
        match self.level {
            0 => "low",
            1 => "medium",
            _ => "high",
        }
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Everything an adapter needs for one call.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest<'a> {
    pub thread: &'a ThreadId,
    /// Stateful handle, if the thread has one.
    pub handle: Option<&'a str>,
    /// Truncated history including the messages in `pending`.
    pub history: &'a [Message],
    /// Messages the provider has not seen yet (stateful adapters send only these).
    pub pending: &'a [Message],
    pub instructions: &'a str,
    pub tools: &'a [ToolSpec],
    pub budget: BudgetPolicy,
    pub thinking: ThinkingConfig,
    pub model: &'a str,
}

/// Adapter output for one call.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// The assistant message, tool-call parts included.
    pub message: Message,
    pub tool_requests: Vec<ToolCallRequest>,
    pub usage: Usage,
}

impl ProviderReply {
    pub fn new(message: Message, usage: Usage) -> Self {
        let tool_requests = message.tool_calls().into_iter().cloned().collect();
        Self {
            message,
            tool_requests,
            usage,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, timeout, 429 or 5xx. Safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The stateful handle no longer exists on the provider side.
    #[error("provider handle is invalid: {0}")]
    InvalidHandle(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("unsupported by this adapter: {0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<CodecError> for ProviderError {
    fn from(err: CodecError) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// A conversation backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn default_model(&self) -> &str;

    /// Create a server-side conversation handle. Stateful adapters only.
    async fn open_handle(&self) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported("handles".into()))
    }

    /// Load locally persisted history into a fresh handle.
    async fn replay(&self, _handle: &str, _history: &[Message]) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Make one call and return the assistant reply.
    async fn send(&self, request: SendRequest<'_>) -> Result<ProviderReply, ProviderError>;
}

/// Adapters by provider name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve a provider name and optional model into a selection.
    pub fn selection(&self, provider: &str, model: Option<&str>) -> Option<ProviderSelection> {
        let adapter = self.adapters.get(provider)?;
        let model = model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| adapter.default_model());
        Some(ProviderSelection::new(provider, adapter.kind(), model))
    }

    /// Build every provider that has an API key configured.
    pub fn from_config(config: &Config, client: Client) -> Self {
        let mut registry = Self::new();
        let providers = &config.providers;

        if let Some(key) = providers.openai.resolved_api_key("OPENAI_API_KEY") {
            registry.register(
                "openai",
                Arc::new(ResponsesAdapter::new(
                    client.clone(),
                    &key,
                    providers.openai.api_base.as_deref(),
                    providers.openai.model.as_deref(),
                )),
            );
        }

        if let Some(key) = providers.assistants.resolved_api_key("OPENAI_API_KEY") {
            registry.register(
                "assistants",
                Arc::new(AssistantsAdapter::new(
                    client.clone(),
                    &key,
                    providers.assistants.api_base.as_deref(),
                    providers.assistants.model.as_deref(),
                    providers.assistants.assistant_id.clone(),
                    config.agents.defaults.instructions.clone(),
                )),
            );
        }

        if let Some(key) = providers.anthropic.resolved_api_key("ANTHROPIC_API_KEY") {
            registry.register(
                "anthropic",
                Arc::new(AnthropicAdapter::new(
                    client,
                    &key,
                    providers.anthropic.api_base.as_deref(),
                    providers.anthropic.model.as_deref(),
                )),
            );
        }

        debug!(providers = ?registry.names(), "Provider registry built");
        registry
    }
}
