//! Tool-server registry file (`mcp.json`).
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"] },
//!     "git":   { "command": "uvx", "args": ["mcp-server-git"], "env": { "GIT_PAGER": "cat" } }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::McpError;

/// Launch spec for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerSpec>,
}

impl McpConfig {
    /// Load from `path`. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).map_err(|e| McpError::Config {
                reason: format!("{}: {e}", path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(McpError::Config {
                reason: format!("failed to read {}: {e}", path.display()),
            }),
        }
    }

    pub fn parse(content: &str) -> Result<Self, McpError> {
        let config: Self = serde_json::from_str(content).map_err(|e| McpError::Config {
            reason: format!("invalid MCP configuration: {e}"),
        })?;
        if let Some((name, _)) = config.servers.iter().find(|(_, s)| s.command.trim().is_empty()) {
            return Err(McpError::Config {
                reason: format!("server '{name}' has an empty command"),
            });
        }
        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server_ids(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }
}
