//! Tool servers spawned as child processes, speaking line-delimited
//! JSON-RPC over stdin/stdout.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::ServerSpec;
use super::protocol::{
    extract_result, parse_call_result, parse_tools_list, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ToolDefinition, PROTOCOL_VERSION,
};
use super::{McpError, ServerLauncher, ToolOutput, ToolServer};

/// Handshake and initial `tools/list` must finish within this window.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on `tools/list` pagination.
const MAX_TOOL_PAGES: usize = 20;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A connected stdio server.
///
/// Requests on one server are serialized: a request holds the pipes until
/// its response arrives, so concurrent callers never read each other's
/// replies.
pub struct StdioServer {
    name: String,
    pipes: Mutex<Pipes>,
    tools: Vec<ToolDefinition>,
    _child: Child,
}

impl StdioServer {
    /// Spawn the process and complete the MCP handshake.
    pub async fn spawn(name: &str, spec: &ServerSpec) -> Result<Self, McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(crate::config::expand_home(cwd));
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            name: name.to_string(),
            reason: format!("{}: {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{line}");
                }
            });
        }

        let mut server = Self {
            name: name.to_string(),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            tools: Vec::new(),
            _child: child,
        };

        let tools = tokio::time::timeout(INIT_TIMEOUT, server.initialize())
            .await
            .map_err(|_| McpError::Init {
                name: name.to_string(),
                reason: format!("no response within {}s", INIT_TIMEOUT.as_secs()),
            })??;
        info!(server = name, tools = tools.len(), "Connected to tool server");
        server.tools = tools;
        Ok(server)
    }

    async fn initialize(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let init = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "colloquy", "version": env!("CARGO_PKG_VERSION")},
                })),
            )
            .await
            .map_err(|e| McpError::Init {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        let server_info = init.get("serverInfo").cloned().unwrap_or_default();
        debug!(server = %self.name, info = %server_info, "Initialize response");
        self.notify("notifications/initialized", None).await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let result = self.request("tools/list", params).await?;
            let (page, next) = parse_tools_list(result).map_err(|e| McpError::Init {
                name: self.name.clone(),
                reason: format!("bad tools/list result: {e}"),
            })?;
            tools.extend(page);
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(tools)
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.name.clone(),
            reason,
        }
    }

    async fn write_line(&self, pipes: &mut Pipes, line: String) -> Result<(), McpError> {
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    /// Send a request and wait for the response with the same id.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = next_request_id();
        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        line.push('\n');

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, line).await?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let read = pipes
                .stdout
                .read_line(&mut buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;
            if read == 0 {
                return Err(self.transport_error("server stdout closed (process may have exited)".into()));
            }

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return extract_result(&self.name, resp),
                Ok(_) => continue,
                Err(_) => {
                    debug!(server = %self.name, line = trimmed, "Ignoring non-JSON-RPC output");
                }
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let mut line = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        line.push('\n');
        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, line).await
    }
}

#[async_trait]
impl ToolServer for StdioServer {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<ToolOutput, McpError> {
        debug!(server = %self.name, tool = name, "Calling tool");
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": name, "arguments": Value::Object(arguments)})),
            )
            .await?;
        let output = parse_call_result(&result);
        if output.is_error {
            warn!(server = %self.name, tool = name, "Tool reported an error");
        }
        Ok(output)
    }
}

/// Launches servers as local child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioLauncher;

#[async_trait]
impl ServerLauncher for StdioLauncher {
    async fn launch(&self, name: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServer>, McpError> {
        Ok(Arc::new(StdioServer::spawn(name, spec).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let spec = ServerSpec {
            command: "/nonexistent/colloquy-test-server".into(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        };
        let err = StdioServer::spawn("ghost", &spec).await.err().unwrap();
        assert!(matches!(err, McpError::Spawn { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    /// Minimal MCP server: answers by echoing the request id back.
    const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"echo","version":"1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf 'log line from the server\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_and_call() {
        let spec = ServerSpec {
            command: "sh".into(),
            args: vec!["-c".into(), ECHO_SERVER.into()],
            env: Default::default(),
            cwd: None,
        };
        let server = StdioServer::spawn("echo", &spec).await.unwrap();

        let tools = server.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let output = server.call_tool("echo", Map::new()).await.unwrap();
        assert_eq!(output.text, "pong");
        assert!(!output.is_error);
    }
}
