//! colloquy-core: provider-agnostic LLM conversations.
//!
//! - [`message`]: Canonical message model and per-provider wire codec
//! - [`tokens`]: Token estimation and history truncation
//! - [`store`]: Thread and message persistence (in-memory, JSONL)
//! - [`provider`]: Adapters for stateless, stateful and message-list APIs
//! - [`mcp`]: Tool dispatch to MCP servers over stdio
//! - [`orchestrator`]: The turn pipeline behind every front end
//! - [`config`]: Typed configuration loading from JSON
//! - [`bus`] / [`gateway`]: Chat-bot transport plumbing
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use colloquy_core::config::Config;
//! use colloquy_core::mcp::{McpConfig, ToolDispatcher};
//! use colloquy_core::orchestrator::{Orchestrator, OrchestratorSettings, ThreadSelector};
//! use colloquy_core::provider::ProviderRegistry;
//! use colloquy_core::store::JsonlStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(JsonlStore::open(config.storage_path()).await?);
//! let providers = ProviderRegistry::from_config(&config, reqwest::Client::new());
//! let tools = ToolDispatcher::stdio(McpConfig::load(&config.mcp_config_path())?, config.tools.timeout());
//! let orchestrator = Orchestrator::new(
//!     store,
//!     providers,
//!     Arc::new(tools),
//!     OrchestratorSettings::from_config(&config),
//! );
//!
//! let outcome = orchestrator
//!     .handle_turn(ThreadSelector::New, "Hello!", config.budget(), None, CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.message.text());
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod gateway;
pub mod mcp;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod tokens;

#[cfg(test)]
pub(crate) mod testing;
