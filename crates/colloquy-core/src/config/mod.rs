//! Configuration module for colloquy.
//!
//! Loads typed configuration from `~/.colloquy/config.json`.
//! All fields use `serde` defaults so a partial file is always valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::provider::{BudgetPolicy, ThinkingConfig};

/// Instructions used when none are configured.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant.";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub agents: AgentsConfig,
    pub tools: ToolsConfig,
    pub storage: StorageConfig,
    pub channels: ChannelsConfig,
}

impl Config {
    /// Load configuration from the default path (`~/.colloquy/config.json`).
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Get the default config directory path.
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".colloquy")
    }

    /// Resolved thread storage directory.
    pub fn storage_path(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    /// Resolved MCP registry file.
    pub fn mcp_config_path(&self) -> PathBuf {
        expand_home(&self.tools.mcp_config)
    }

    /// Budget applied to turns unless the caller overrides it.
    pub fn budget(&self) -> BudgetPolicy {
        let d = &self.agents.defaults;
        BudgetPolicy::new(d.max_history_tokens, d.max_response_tokens)
    }

    pub fn thinking(&self) -> ThinkingConfig {
        ThinkingConfig::new(self.agents.defaults.thinking)
    }

    /// Validate the configuration and return a list of human-readable
    /// problems, if any.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let configured = [
            ("openai", &self.providers.openai, "OPENAI_API_KEY"),
            ("assistants", &self.providers.assistants, "OPENAI_API_KEY"),
            ("anthropic", &self.providers.anthropic, "ANTHROPIC_API_KEY"),
        ];
        if configured
            .iter()
            .all(|(_, entry, env)| entry.resolved_api_key(env).is_none())
        {
            errors.push(
                "No provider has an API key. Set providers.<name>.apiKey in config.json \
                 or export OPENAI_API_KEY / ANTHROPIC_API_KEY."
                    .into(),
            );
        }

        let default_provider = &self.agents.defaults.provider;
        if !configured.iter().any(|(name, _, _)| name == default_provider) {
            errors.push(format!(
                "agents.defaults.provider '{default_provider}' is not one of openai, assistants, anthropic."
            ));
        }

        if self.agents.defaults.max_tool_rounds == 0 {
            errors.push("agents.defaults.maxToolRounds must be at least 1.".into());
        }
        if self.agents.defaults.history_page_size == 0 {
            errors.push("agents.defaults.historyPageSize must be at least 1.".into());
        }
        if self.agents.defaults.thinking > 2 {
            errors.push("agents.defaults.thinking must be 0, 1 or 2.".into());
        }

        let tg = &self.channels.telegram;
        if tg.enabled && (tg.token.is_empty() || tg.token.contains("YOUR_")) {
            errors.push(
                "Telegram is enabled but the bot token is missing or a placeholder. \
                 Set channels.telegram.token in config.json."
                    .into(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Write the default config template to disk.
    pub fn write_default_template() -> anyhow::Result<PathBuf> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = serde_json::json!({
            "providers": {
                "openai": { "apiKey": "sk-YOUR_KEY_HERE" },
                "anthropic": { "apiKey": "" }
            },
            "agents": {
                "defaults": {
                    "provider": "openai",
                    "model": "gpt-4o",
                    "instructions": DEFAULT_INSTRUCTIONS,
                    "maxHistoryTokens": 16000
                }
            },
            "tools": { "enabled": true, "mcpConfig": "~/.colloquy/mcp.json" }
        });

        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(raw)
    }
}

// ── Provider Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderEntry {
    pub api_key: String,
    pub api_base: Option<String>,
    /// Default model for this provider.
    pub model: Option<String>,
    /// Existing assistant to run threads against (assistants only).
    pub assistant_id: Option<String>,
}

impl ProviderEntry {
    /// Configured key, falling back to the environment variable `env`.
    pub fn resolved_api_key(&self, env: &str) -> Option<String> {
        if !self.api_key.is_empty() && !self.api_key.contains("YOUR_") {
            return Some(self.api_key.clone());
        }
        std::env::var(env).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Stateless Responses API.
    pub openai: ProviderEntry,
    /// Stateful Assistants threads.
    pub assistants: ProviderEntry,
    pub anthropic: ProviderEntry,
}

// ── Agent Configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    pub provider: String,
    /// Empty means the provider's default model.
    pub model: String,
    pub instructions: String,
    pub max_history_tokens: u32,
    pub max_response_tokens: u32,
    pub max_tool_rounds: u32,
    pub thinking: u8,
    pub history_page_size: usize,
    pub provider_timeout_seconds: u64,
    pub provider_retries: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: String::new(),
            instructions: DEFAULT_INSTRUCTIONS.into(),
            max_history_tokens: 16_000,
            max_response_tokens: 0,
            max_tool_rounds: 8,
            thinking: 0,
            history_page_size: 200,
            provider_timeout_seconds: 120,
            provider_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

// ── Tools Configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    pub enabled: bool,
    pub mcp_config: String,
    pub timeout_seconds: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mcp_config: "~/.colloquy/mcp.json".into(),
            timeout_seconds: 60,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

// ── Storage Configuration ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "~/.colloquy/threads".into(),
        }
    }
}

// ── Channels Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
}
