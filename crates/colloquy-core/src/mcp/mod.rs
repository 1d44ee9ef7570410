//! Tool dispatch to external MCP tool servers.
//!
//! [`ToolDispatcher`] owns the process-wide registry built from `mcp.json`.
//! Servers are launched the first time one of their tools is needed and the
//! connection is reused afterwards. Every failure on the way to a tool
//! result (unknown server, unknown tool, spawn error, timeout, transport
//! error) comes back as a failed [`ToolResult`], never as an error.

pub mod config;
pub mod protocol;
pub mod stdio;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

pub use config::{McpConfig, ServerSpec};
pub use protocol::ToolDefinition;
pub use stdio::{StdioLauncher, StdioServer};

use crate::message::{qualify_tool_name, ToolCallRequest, ToolResult};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum McpError {
    #[error("unknown tool server '{0}'")]
    UnknownServer(String),

    #[error("server '{server}' has no tool '{tool}'")]
    UnknownTool { server: String, tool: String },

    #[error("failed to spawn server '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("server '{name}' initialization failed: {reason}")]
    Init { name: String, reason: String },

    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    #[error("server '{server}' returned error [{code}]: {message}")]
    Server {
        server: String,
        code: i32,
        message: String,
    },

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool call '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("config error: {reason}")]
    Config { reason: String },
}

/// Flattened tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

/// A tool as advertised to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn qualified_name(&self) -> String {
        qualify_tool_name(&self.server, &self.name)
    }
}

/// A connected tool server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError>;

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<ToolOutput, McpError>;
}

/// Turns a launch spec into a connected server.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, name: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServer>, McpError>;
}

type Connection = Arc<OnceCell<Arc<dyn ToolServer>>>;

#[derive(Default)]
struct Registry {
    specs: HashMap<String, ServerSpec>,
    connections: HashMap<String, Connection>,
}

pub struct ToolDispatcher {
    registry: RwLock<Registry>,
    launcher: Arc<dyn ServerLauncher>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(config: McpConfig, launcher: Arc<dyn ServerLauncher>, timeout: Duration) -> Self {
        let mut registry = Registry::default();
        for (name, spec) in config.servers {
            registry.connections.insert(name.clone(), Arc::default());
            registry.specs.insert(name, spec);
        }
        Self {
            registry: RwLock::new(registry),
            launcher,
            timeout,
        }
    }

    /// Dispatcher over stdio child processes.
    pub fn stdio(config: McpConfig, timeout: Duration) -> Self {
        Self::new(config, Arc::new(StdioLauncher), timeout)
    }

    /// Dispatcher with no servers.
    pub fn empty() -> Self {
        Self::stdio(McpConfig::default(), DEFAULT_TOOL_TIMEOUT)
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().await.specs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.specs.is_empty()
    }

    /// Connected handle for `server_id`, launching the server on first use.
    pub async fn resolve(&self, server_id: &str) -> Result<Arc<dyn ToolServer>, McpError> {
        let (spec, cell) = {
            let registry = self.registry.read().await;
            let spec = registry
                .specs
                .get(server_id)
                .cloned()
                .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;
            let cell = registry
                .connections
                .get(server_id)
                .cloned()
                .unwrap_or_default();
            (spec, cell)
        };

        let server = cell
            .get_or_try_init(|| async {
                debug!(server = server_id, command = %spec.command, "Launching tool server");
                self.launcher.launch(server_id, &spec).await
            })
            .await?;
        Ok(server.clone())
    }

    /// Tools offered by one server.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolSpec>, McpError> {
        let server = self.resolve(server_id).await?;
        let tools = tokio::time::timeout(self.timeout, server.list_tools())
            .await
            .map_err(|_| McpError::Timeout {
                tool: format!("{server_id}/tools/list"),
                seconds: self.timeout.as_secs(),
            })??;
        Ok(tools
            .into_iter()
            .map(|t| ToolSpec {
                server: server_id.to_string(),
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect())
    }

    /// Tools from every server that can be reached. Unreachable servers are
    /// logged and left out.
    pub async fn tool_specs(&self) -> Vec<ToolSpec> {
        let ids = self.server_ids().await;
        let listed = futures::future::join_all(ids.iter().map(|id| self.list_tools(id))).await;

        let mut specs = Vec::new();
        for (id, result) in ids.iter().zip(listed) {
            match result {
                Ok(tools) => specs.extend(tools),
                Err(e) => warn!(server = %id, error = %e, "Tool server unavailable, skipping its tools"),
            }
        }
        specs
    }

    /// Run one tool call. Failures become a failed result.
    pub async fn invoke(&self, request: &ToolCallRequest) -> ToolResult {
        match self.try_invoke(request).await {
            Ok(output) if output.is_error => ToolResult::failed(&request.id, output.text),
            Ok(output) => ToolResult::ok(&request.id, output.text),
            Err(e) => {
                warn!(
                    server = %request.server,
                    tool = %request.name,
                    error = %e,
                    "Tool invocation failed"
                );
                ToolResult::failed(&request.id, format!("Error executing tool: {e}"))
            }
        }
    }

    async fn try_invoke(&self, request: &ToolCallRequest) -> Result<ToolOutput, McpError> {
        if let Some(reason) = &request.argument_error {
            return Err(McpError::InvalidArguments {
                tool: request.qualified_name(),
                reason: reason.clone(),
            });
        }

        let timed_out = || McpError::Timeout {
            tool: request.qualified_name(),
            seconds: self.timeout.as_secs(),
        };

        let server = tokio::time::timeout(self.timeout, self.resolve(&request.server))
            .await
            .map_err(|_| timed_out())??;

        let known = tokio::time::timeout(self.timeout, server.list_tools())
            .await
            .map_err(|_| timed_out())??;
        if !known.iter().any(|t| t.name == request.name) {
            return Err(McpError::UnknownTool {
                server: request.server.clone(),
                tool: request.name.clone(),
            });
        }

        tokio::time::timeout(
            self.timeout,
            server.call_tool(&request.name, request.arguments.clone()),
        )
        .await
        .map_err(|_| timed_out())?
    }

    /// Swap in a new registry. Connections whose launch spec is unchanged
    /// are kept; the rest are dropped, which stops their processes.
    pub async fn reload(&self, config: McpConfig) {
        let mut registry = self.registry.write().await;
        let mut connections = HashMap::new();
        for (name, spec) in &config.servers {
            let reuse = registry.specs.get(name) == Some(spec);
            let cell = match registry.connections.remove(name) {
                Some(cell) if reuse => cell,
                _ => Arc::default(),
            };
            connections.insert(name.clone(), cell);
        }
        let dropped = registry.connections.len();
        registry.specs = config.servers.into_iter().collect();
        registry.connections = connections;
        info!(servers = registry.specs.len(), dropped, "Tool registry reloaded");
    }
}
