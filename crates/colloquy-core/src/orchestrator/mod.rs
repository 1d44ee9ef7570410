//! Conversation orchestrator.
//!
//! [`Orchestrator::handle_turn`] runs one user turn through a fixed state
//! machine:
//!
//! ```text
//! AWAITING_INPUT → BUILDING_CONTEXT → CALLING_PROVIDER
//!     → (TOOL_ROUND ⇄ CALLING_PROVIDER)* → PERSISTING → DONE
//! ```
//!
//! Any state but `DONE` can end in `FAILED`, which surfaces as a
//! [`TurnError`]. Turns on the same thread are serialized; turns on
//! different threads run in parallel.

mod locks;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::mcp::{ToolDispatcher, ToolSpec};
use crate::message::{ContentPart, Message, Role, ThreadId, ToolResult};
use crate::provider::{
    BudgetPolicy, ProviderAdapter, ProviderError, ProviderRegistry, ProviderReply,
    ProviderSelection, SendRequest, ThinkingConfig, Usage,
};
use crate::store::{HistoryStore, NewThread, StoreError, Thread};
use crate::tokens::TokenAccountant;

pub use locks::{KeyedLocks, ThreadLocks};

/// Which thread a turn belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadSelector {
    New,
    Existing(ThreadId),
}

impl From<Option<ThreadId>> for ThreadSelector {
    fn from(id: Option<ThreadId>) -> Self {
        id.map_or(Self::New, Self::Existing)
    }
}

/// Non-fatal conditions attached to a completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnWarning {
    /// The most recent context alone did not fit the history budget and
    /// was sent anyway.
    BudgetExceeded { used: u32, budget: u32 },
}

impl fmt::Display for TurnWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded { used, budget } => {
                write!(f, "context of ~{used} tokens exceeds the {budget}-token budget")
            }
        }
    }
}

/// A completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: ThreadId,
    /// Final assistant message, as persisted.
    pub message: Message,
    pub warnings: Vec<TurnWarning>,
    pub tool_rounds: u32,
    pub usage: Usage,
}

/// Whole-turn failures.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),

    #[error("provider '{0}' is not configured")]
    UnknownProvider(String),

    #[error("provider unavailable after {attempts} attempts: {source}")]
    ProviderUnavailable {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("provider request failed: {0}")]
    ProviderRejected(#[source] ProviderError),

    #[error("tool loop exceeded after {rounds} rounds")]
    ToolLoopExceeded { rounds: u32 },

    /// The store failed. `unsaved_reply` carries the assistant reply when
    /// the failure happened while saving it.
    #[error("failed to persist turn: {reason}")]
    Persistence {
        reason: String,
        unsaved_reply: Option<Box<Message>>,
    },

    #[error("turn cancelled")]
    Cancelled,
}

/// A failed turn, with the thread it ran on when one exists.
///
/// A turn on a new thread creates the thread and stores the user message
/// before anything can fail, so callers should keep `thread_id` to retry
/// on the same thread.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TurnFailure {
    pub thread_id: Option<ThreadId>,
    pub error: TurnError,
}

impl From<TurnError> for TurnFailure {
    fn from(error: TurnError) -> Self {
        Self {
            thread_id: None,
            error,
        }
    }
}

impl TurnError {
    fn persistence(err: StoreError) -> Self {
        Self::Persistence {
            reason: err.to_string(),
            unsaved_reply: None,
        }
    }
}

/// Turn pipeline states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingInput,
    BuildingContext,
    CallingProvider,
    ToolRound,
    Persisting,
    Done,
    Failed,
}

/// Knobs for the turn pipeline.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_provider: String,
    /// Empty means the provider's default model.
    pub default_model: String,
    pub instructions: String,
    pub thinking: ThinkingConfig,
    pub max_tool_rounds: u32,
    pub history_page_size: usize,
    pub provider_timeout: Duration,
    /// Retries after the first attempt for transient provider errors.
    pub provider_retries: u32,
    pub retry_base_delay: Duration,
    pub tools_enabled: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_provider: "openai".into(),
            default_model: String::new(),
            instructions: crate::config::DEFAULT_INSTRUCTIONS.into(),
            thinking: ThinkingConfig::default(),
            max_tool_rounds: 8,
            history_page_size: 200,
            provider_timeout: Duration::from_secs(120),
            provider_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            tools_enabled: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let d = &config.agents.defaults;
        Self {
            default_provider: d.provider.clone(),
            default_model: d.model.clone(),
            instructions: d.instructions.clone(),
            thinking: config.thinking(),
            max_tool_rounds: d.max_tool_rounds.max(1),
            history_page_size: d.history_page_size.max(1),
            provider_timeout: Duration::from_secs(d.provider_timeout_seconds.max(1)),
            provider_retries: d.provider_retries,
            tools_enabled: config.tools.enabled,
            ..Self::default()
        }
    }
}

/// Mutable state carried through one turn.
struct Turn {
    thread: Thread,
    adapter: Arc<dyn ProviderAdapter>,
    accountant: TokenAccountant,
    budget: BudgetPolicy,
    tools: Vec<ToolSpec>,
    /// Persisted history window, oldest first.
    history: Vec<Message>,
    /// Messages a stateful provider has not been sent yet.
    pending: Vec<Message>,
    warnings: Vec<TurnWarning>,
    usage: Usage,
    rounds: u32,
    handle_rebuilt: bool,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    store: Arc<dyn HistoryStore>,
    providers: ProviderRegistry,
    tools: Arc<ToolDispatcher>,
    settings: OrchestratorSettings,
    locks: ThreadLocks,
    migrated: OnceCell<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        providers: ProviderRegistry,
        tools: Arc<ToolDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            providers,
            tools,
            settings,
            locks: ThreadLocks::default(),
            migrated: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn tools(&self) -> &Arc<ToolDispatcher> {
        &self.tools
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Provider selection used for new threads when the caller gives none.
    pub fn default_selection(&self) -> Result<ProviderSelection, TurnError> {
        self.select(&self.settings.default_provider, Some(self.settings.default_model.as_str()))
    }

    /// Resolve a provider name and optional model against the registry.
    pub fn select(&self, provider: &str, model: Option<&str>) -> Result<ProviderSelection, TurnError> {
        self.providers
            .selection(provider, model)
            .ok_or_else(|| TurnError::UnknownProvider(provider.to_string()))
    }

    /// Run the store's schema migration once per process.
    pub async fn ensure_migrated(&self) -> Result<(), TurnError> {
        self.migrated
            .get_or_try_init(|| async { self.store.migrate().await })
            .await
            .map_err(TurnError::persistence)?;
        Ok(())
    }

    /// Most recent messages of a thread, oldest first.
    pub async fn history(&self, thread: &ThreadId, limit: usize) -> Result<Vec<Message>, TurnError> {
        self.ensure_migrated().await?;
        if self
            .store
            .get_thread(thread)
            .await
            .map_err(TurnError::persistence)?
            .is_none()
        {
            return Err(TurnError::ThreadNotFound(thread.clone()));
        }
        self.store
            .list_messages(thread, None, Some(limit))
            .await
            .map_err(TurnError::persistence)
    }

    /// Run one user turn and return the final assistant message.
    pub async fn handle_turn(
        &self,
        selector: ThreadSelector,
        input: &str,
        budget: BudgetPolicy,
        selection: Option<ProviderSelection>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnFailure> {
        self.ensure_migrated().await?;
        trace_state(None, TurnState::AwaitingInput);

        let thread_id = match selector {
            ThreadSelector::Existing(id) => id,
            ThreadSelector::New => {
                let selection = match &selection {
                    Some(s) => s.clone(),
                    None => self.default_selection()?,
                };
                self.store
                    .create_thread(NewThread::from_prompt(selection, input))
                    .await
                    .map_err(TurnError::persistence)?
            }
        };

        let _guard = self.locks.acquire(&thread_id).await;
        self.run_turn(&thread_id, input, budget, selection, cancel)
            .await
            .map_err(|error| {
                trace_state(Some(&thread_id), TurnState::Failed);
                warn!(thread = %thread_id, error = %error, "Turn failed");
                TurnFailure {
                    thread_id: Some(thread_id.clone()),
                    error,
                }
            })
    }

    async fn run_turn(
        &self,
        thread_id: &ThreadId,
        input: &str,
        budget: BudgetPolicy,
        selection: Option<ProviderSelection>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        // ── BUILDING_CONTEXT ───────────────────────────────────────
        trace_state(Some(thread_id), TurnState::BuildingContext);
        let mut turn = self.build_context(thread_id, input, budget, selection, cancel).await?;

        // ── CALLING_PROVIDER ⇄ TOOL_ROUND ──────────────────────────
        let reply = loop {
            trace_state(Some(thread_id), TurnState::CallingProvider);
            let reply = self.call_provider(&mut turn).await?;
            turn.usage.add(reply.usage);

            if reply.tool_requests.is_empty() {
                break reply;
            }
            if turn.rounds >= self.settings.max_tool_rounds {
                return Err(TurnError::ToolLoopExceeded { rounds: turn.rounds });
            }

            trace_state(Some(thread_id), TurnState::ToolRound);
            self.tool_round(&mut turn, reply).await?;
        };

        // ── PERSISTING ─────────────────────────────────────────────
        trace_state(Some(thread_id), TurnState::Persisting);
        let mut message = reply.message;
        message.thread_id = thread_id.clone();
        turn.accountant.ensure_counted(&mut message);
        if let Err(e) = self.store.append(thread_id, message.clone()).await {
            return Err(TurnError::Persistence {
                reason: e.to_string(),
                unsaved_reply: Some(Box::new(message)),
            });
        }

        turn.thread.updated_at = chrono::Utc::now();
        if let Err(e) = self.store.update_thread(&turn.thread).await {
            warn!(thread = %thread_id, error = %e, "Failed to touch thread timestamp");
        }

        // Re-read so the caller sees the stored sequence number.
        let message = self
            .store
            .list_messages(thread_id, None, Some(1))
            .await
            .ok()
            .and_then(|mut m| m.pop())
            .filter(|m| m.id == message.id)
            .unwrap_or(message);

        trace_state(Some(thread_id), TurnState::Done);
        info!(
            thread = %thread_id,
            rounds = turn.rounds,
            tokens = turn.usage.total(),
            "Turn complete"
        );
        Ok(TurnOutcome {
            thread_id: thread_id.clone(),
            message,
            warnings: turn.warnings,
            tool_rounds: turn.rounds,
            usage: turn.usage,
        })
    }

    async fn build_context(
        &self,
        thread_id: &ThreadId,
        input: &str,
        budget: BudgetPolicy,
        selection: Option<ProviderSelection>,
        cancel: CancellationToken,
    ) -> Result<Turn, TurnError> {
        let mut thread = self
            .store
            .get_thread(thread_id)
            .await
            .map_err(TurnError::persistence)?
            .ok_or_else(|| TurnError::ThreadNotFound(thread_id.clone()))?;

        if let Some(selection) = selection {
            if selection != thread.provider {
                let same_backend = selection.provider == thread.provider.provider
                    && selection.adapter == thread.provider.adapter;
                info!(
                    thread = %thread_id,
                    from = %thread.provider,
                    to = %selection,
                    "Switching thread provider"
                );
                if !same_backend {
                    thread.provider_handle = None;
                }
                thread.provider = selection;
                self.store
                    .update_thread(&thread)
                    .await
                    .map_err(TurnError::persistence)?;
            }
        }

        let adapter = self
            .providers
            .get(&thread.provider.provider)
            .ok_or_else(|| TurnError::UnknownProvider(thread.provider.provider.clone()))?;
        let accountant = TokenAccountant::for_model(&thread.provider.model);

        let mut user = Message::user(thread_id.clone(), input);
        accountant.ensure_counted(&mut user);
        self.store
            .append(thread_id, user)
            .await
            .map_err(TurnError::persistence)?;

        let history = self
            .store
            .list_messages(thread_id, None, Some(self.settings.history_page_size))
            .await
            .map_err(TurnError::persistence)?;
        let pending = history.last().cloned().into_iter().collect();

        let tools = if self.settings.tools_enabled {
            self.tools.tool_specs().await
        } else {
            Vec::new()
        };
        debug!(
            thread = %thread_id,
            history = history.len(),
            tools = tools.len(),
            provider = %thread.provider,
            "Context built"
        );

        Ok(Turn {
            thread,
            adapter,
            accountant,
            budget,
            tools,
            history,
            pending,
            warnings: Vec::new(),
            usage: Usage::default(),
            rounds: 0,
            handle_rebuilt: false,
            cancel,
        })
    }

    /// Messages persisted before the ones still pending.
    fn delivered_history(turn: &Turn) -> &[Message] {
        let cut = turn.history.len().saturating_sub(turn.pending.len());
        &turn.history[..cut]
    }

    /// Create a provider-side handle and load local history into it.
    async fn rebuild_handle(&self, turn: &mut Turn) -> Result<(), TurnError> {
        let adapter = turn.adapter.clone();
        let handle = self
            .with_retries(turn, || adapter.open_handle())
            .await?;
        let prior = Self::delivered_history(turn).to_vec();
        let replay_handle = handle.clone();
        self.with_retries(turn, || adapter.replay(&replay_handle, &prior))
            .await?;

        info!(thread = %turn.thread.id, handle = %handle, replayed = prior.len(), "Provider handle ready");
        turn.thread.provider_handle = Some(handle);
        self.store
            .update_thread(&turn.thread)
            .await
            .map_err(TurnError::persistence)
    }

    async fn call_provider(&self, turn: &mut Turn) -> Result<ProviderReply, TurnError> {
        let stateful = turn.adapter.kind().is_stateful();
        if stateful && turn.thread.provider_handle.is_none() {
            self.rebuild_handle(turn).await?;
        }

        loop {
            let truncation = turn
                .accountant
                .truncate(turn.history.clone(), turn.budget.max_history_tokens);
            if truncation.budget_exceeded {
                let warning = TurnWarning::BudgetExceeded {
                    used: truncation.used,
                    budget: turn.budget.max_history_tokens,
                };
                warn!(thread = %turn.thread.id, %warning, "History budget exceeded");
                if !turn.warnings.contains(&warning) {
                    turn.warnings.push(warning);
                }
            }

            let adapter = turn.adapter.clone();
            let thread = turn.thread.clone();
            let pending = turn.pending.clone();
            let request = SendRequest {
                thread: &thread.id,
                handle: thread.provider_handle.as_deref(),
                history: &truncation.messages,
                pending: &pending,
                instructions: &self.settings.instructions,
                tools: &turn.tools,
                budget: turn.budget,
                thinking: self.settings.thinking,
                model: &thread.provider.model,
            };

            let result = self.with_retries(turn, || adapter.send(request)).await;
            match result {
                Err(TurnError::ProviderRejected(ProviderError::InvalidHandle(reason)))
                    if stateful && !turn.handle_rebuilt =>
                {
                    warn!(thread = %turn.thread.id, reason = %reason, "Provider handle invalid, rebuilding");
                    turn.handle_rebuilt = true;
                    self.rebuild_handle(turn).await?;
                }
                other => return other,
            }
        }
    }

    /// Run `op` with the call timeout, retrying transient failures with
    /// exponential backoff. Cancellation wins over everything.
    async fn with_retries<T, F, Fut>(&self, turn: &Turn, mut op: F) -> Result<T, TurnError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.settings.provider_retries + 1;
        for attempt in 1..=attempts {
            let call = tokio::time::timeout(self.settings.provider_timeout, op());
            let outcome = tokio::select! {
                _ = turn.cancel.cancelled() => return Err(TurnError::Cancelled),
                r = call => r,
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Transient(format!(
                    "no response within {}s",
                    self.settings.provider_timeout.as_secs()
                )),
            };

            if !err.is_transient() {
                return Err(TurnError::ProviderRejected(err));
            }
            if attempt == attempts {
                return Err(TurnError::ProviderUnavailable {
                    attempts,
                    source: err,
                });
            }

            let delay = self.settings.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            warn!(thread = %turn.thread.id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying provider call");
            tokio::select! {
                _ = turn.cancel.cancelled() => return Err(TurnError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Err(TurnError::ProviderUnavailable {
            attempts,
            source: ProviderError::Transient("no attempts made".into()),
        })
    }

    async fn tool_round(&self, turn: &mut Turn, reply: ProviderReply) -> Result<(), TurnError> {
        turn.rounds += 1;
        let thread_id = turn.thread.id.clone();

        let mut request_msg = reply.message;
        request_msg.thread_id = thread_id.clone();
        turn.accountant.ensure_counted(&mut request_msg);
        self.store
            .append(&thread_id, request_msg)
            .await
            .map_err(TurnError::persistence)?;

        debug!(thread = %thread_id, round = turn.rounds, calls = reply.tool_requests.len(), "Dispatching tools");
        let dispatch = join_all(reply.tool_requests.iter().map(|req| self.tools.invoke(req)));
        let (results, cancelled): (Vec<ToolResult>, bool) = tokio::select! {
            _ = turn.cancel.cancelled() => (
                reply
                    .tool_requests
                    .iter()
                    .map(|req| ToolResult::failed(&req.id, "Tool call cancelled"))
                    .collect(),
                true,
            ),
            results = dispatch => (results, false),
        };

        let mut result_msg = Message::new(
            thread_id.clone(),
            Role::Tool,
            results.into_iter().map(ContentPart::ToolResult).collect(),
        );
        turn.accountant.ensure_counted(&mut result_msg);
        self.store
            .append(&thread_id, result_msg)
            .await
            .map_err(TurnError::persistence)?;
        if cancelled {
            return Err(TurnError::Cancelled);
        }

        // Both messages now carry their store-assigned positions.
        let appended = self
            .store
            .list_messages(&thread_id, None, Some(2))
            .await
            .map_err(TurnError::persistence)?;
        turn.pending = appended.last().cloned().into_iter().collect();
        turn.history.extend(appended);
        let overflow = turn
            .history
            .len()
            .saturating_sub(self.settings.history_page_size);
        turn.history.drain(..overflow);
        Ok(())
    }
}

fn trace_state(thread: Option<&ThreadId>, state: TurnState) {
    match thread {
        Some(id) => debug!(thread = %id, ?state, "Turn state"),
        None => debug!(?state, "Turn state"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::mcp::config::{McpConfig, ServerSpec};
    use crate::provider::AdapterKind;
    use crate::store::InMemoryStore;
    use crate::testing::{FailingStore, FakeLauncher, FakeToolServer, ScriptedAdapter, Step};

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            provider_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(1),
            ..OrchestratorSettings::default()
        }
    }

    fn echo_tools() -> Arc<ToolDispatcher> {
        let mut config = McpConfig::default();
        config.servers.insert(
            "echo".into(),
            ServerSpec {
                command: "echo-server".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        );
        let launcher = Arc::new(FakeLauncher::new().with_server("echo", FakeToolServer::echo()));
        Arc::new(ToolDispatcher::new(config, launcher, Duration::from_secs(5)))
    }

    fn orchestrator(
        store: Arc<dyn HistoryStore>,
        adapter: Arc<ScriptedAdapter>,
        settings: OrchestratorSettings,
    ) -> Orchestrator {
        let mut providers = ProviderRegistry::new();
        providers.register("openai", adapter);
        Orchestrator::new(store, providers, echo_tools(), settings)
    }

    fn budget(max_history_tokens: u32) -> BudgetPolicy {
        BudgetPolicy::new(max_history_tokens, 0)
    }

    async fn turn(
        orch: &Orchestrator,
        selector: ThreadSelector,
        input: &str,
    ) -> Result<TurnOutcome, TurnFailure> {
        orch.handle_turn(selector, input, budget(16_000), None, CancellationToken::new())
            .await
    }

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn test_simple_turn_creates_thread() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::text("Hi there")],
        ));
        let orch = orchestrator(store.clone(), adapter.clone(), settings());

        let outcome = turn(&orch, ThreadSelector::New, "Hello, how are you today?")
            .await
            .unwrap();
        assert_eq!(outcome.message.text(), "Hi there");
        assert_eq!(outcome.message.seq, 2);
        assert_eq!(outcome.tool_rounds, 0);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.usage.total(), 15);

        let thread = store.get_thread(&outcome.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.label, "Hello, how are you today?");
        assert_eq!(thread.provider.provider, "openai");

        let messages = store.list_messages(&outcome.thread_id, None, None).await.unwrap();
        assert_eq!(roles(&messages), vec![Role::User, Role::Assistant]);
        assert!(messages.iter().all(|m| m.token_count.is_some()));
        assert_eq!(adapter.calls()[0].tool_names, vec!["echo__echo"]);
    }

    #[tokio::test]
    async fn test_history_within_budget_is_sent_whole() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::text("noted")],
        ));
        let orch = orchestrator(store.clone(), adapter.clone(), settings());

        let selection = ProviderSelection::new("openai", AdapterKind::StatelessResponses, "gpt-4o");
        let tid = store
            .create_thread(NewThread::from_prompt(selection, "long"))
            .await
            .unwrap();
        // Three prior messages of 3000 tokens each.
        let long = "a".repeat(12_000);
        store.append(&tid, Message::user(tid.clone(), long.clone())).await.unwrap();
        store.append(&tid, Message::assistant(tid.clone(), long.clone())).await.unwrap();
        store.append(&tid, Message::user(tid.clone(), long)).await.unwrap();

        let input = "b".repeat(800);
        let outcome = orch
            .handle_turn(
                ThreadSelector::Existing(tid.clone()),
                &input,
                budget(10_000),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.message.seq, 5);
        let call = &adapter.calls()[0];
        assert_eq!(call.history.len(), 4);
        assert_eq!(call.history[3].token_count, Some(200));
    }

    #[tokio::test]
    async fn test_oversized_input_warns_but_is_sent() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::text("ok")],
        ));
        let orch = orchestrator(store, adapter.clone(), settings());

        let input = "c".repeat(800);
        let outcome = orch
            .handle_turn(ThreadSelector::New, &input, budget(100), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.warnings,
            vec![TurnWarning::BudgetExceeded { used: 203, budget: 100 }]
        );
        assert_eq!(adapter.calls()[0].history.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![
                Step::tool("echo", "echo", json!({"text": "pong"})),
                Step::text("The tool said pong"),
            ],
        ));
        let orch = orchestrator(store.clone(), adapter.clone(), settings());

        let outcome = turn(&orch, ThreadSelector::New, "ping the tool").await.unwrap();
        assert_eq!(outcome.tool_rounds, 1);
        assert_eq!(outcome.message.text(), "The tool said pong");
        assert_eq!(outcome.message.seq, 4);
        assert_eq!(outcome.usage.total(), 30);

        let messages = store.list_messages(&outcome.thread_id, None, None).await.unwrap();
        assert_eq!(
            roles(&messages),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        let result = messages[2].tool_results()[0].clone();
        assert!(result.success);
        assert_eq!(result.payload, "pong");
        assert_eq!(result.call_id, messages[1].tool_calls()[0].id);

        let calls = adapter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].history.len(), 3);
        assert_eq!(calls[1].pending.len(), 1);
        assert_eq!(calls[1].pending[0].role, Role::Tool);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_result() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::tool("nowhere", "dig", json!({})), Step::text("sorry")],
        ));
        let orch = orchestrator(store.clone(), adapter, settings());

        let outcome = turn(&orch, ThreadSelector::New, "dig a hole").await.unwrap();
        let messages = store.list_messages(&outcome.thread_id, None, None).await.unwrap();
        let result = messages[2].tool_results()[0].clone();
        assert!(!result.success);
        assert!(result.payload.starts_with("Error executing tool:"));
        assert_eq!(outcome.message.text(), "sorry");
    }

    #[tokio::test]
    async fn test_tool_loop_is_capped() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::tool("echo", "echo", json!({"text": "again"}))],
        ));
        let orch = orchestrator(
            store.clone(),
            adapter.clone(),
            OrchestratorSettings {
                max_tool_rounds: 3,
                ..settings()
            },
        );

        let err = turn(&orch, ThreadSelector::New, "loop forever").await.unwrap_err().error;
        assert!(matches!(err, TurnError::ToolLoopExceeded { rounds: 3 }));
        assert_eq!(adapter.calls().len(), 4);

        let threads = store.list_threads().await.unwrap();
        let messages = store.list_messages(&threads[0].id, None, None).await.unwrap();
        assert_eq!(messages.len(), 7);
        assert_eq!(messages.last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::Transient, Step::Transient, Step::text("finally")],
        ));
        let orch = orchestrator(store.clone(), adapter.clone(), settings());

        let outcome = turn(&orch, ThreadSelector::New, "hello").await.unwrap();
        assert_eq!(outcome.message.text(), "finally");
        assert_eq!(adapter.calls().len(), 3);

        let messages = store.list_messages(&outcome.thread_id, None, None).await.unwrap();
        let assistants = messages.iter().filter(|m| m.role == Role::Assistant).count();
        assert_eq!(assistants, 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::Transient],
        ));
        let orch = orchestrator(
            store.clone(),
            adapter.clone(),
            OrchestratorSettings {
                provider_retries: 2,
                ..settings()
            },
        );

        let err = turn(&orch, ThreadSelector::New, "hello").await.unwrap_err().error;
        assert!(matches!(err, TurnError::ProviderUnavailable { attempts: 3, .. }));
        assert_eq!(adapter.calls().len(), 3);

        // The user message stays; nothing else was written.
        let threads = store.list_threads().await.unwrap();
        let messages = store.list_messages(&threads[0].id, None, None).await.unwrap();
        assert_eq!(roles(&messages), vec![Role::User]);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::Rejected],
        ));
        let orch = orchestrator(Arc::new(InMemoryStore::new()), adapter.clone(), settings());

        let err = turn(&orch, ThreadSelector::New, "hello").await.unwrap_err().error;
        assert!(matches!(err, TurnError::ProviderRejected(ProviderError::Rejected { status: 400, .. })));
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_turn_reports_its_thread() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::Rejected, Step::text("second try")],
        ));
        let orch = orchestrator(store.clone(), adapter, settings());

        let failure = turn(&orch, ThreadSelector::New, "hello").await.unwrap_err();
        assert!(matches!(failure.error, TurnError::ProviderRejected(_)));
        let tid = failure.thread_id.expect("created thread");

        let outcome = turn(&orch, ThreadSelector::Existing(tid.clone()), "hello again")
            .await
            .unwrap();
        assert_eq!(outcome.thread_id, tid);
        assert_eq!(store.list_threads().await.unwrap().len(), 1);
        let messages = store.list_messages(&tid, None, None).await.unwrap();
        assert_eq!(roles(&messages), vec![Role::User, Role::User, Role::Assistant]);

        // No thread exists to report when the provider is unknown.
        let empty = Orchestrator::new(
            Arc::new(InMemoryStore::new()),
            ProviderRegistry::new(),
            Arc::new(ToolDispatcher::empty()),
            settings(),
        );
        assert!(turn(&empty, ThreadSelector::New, "hi").await.unwrap_err().thread_id.is_none());
    }

    #[tokio::test]
    async fn test_stateful_tool_round_sends_only_new_messages() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatefulThread,
            vec![
                Step::tool("echo", "echo", json!({"text": "pong"})),
                Step::text("done"),
            ],
        ));
        let orch = orchestrator(store.clone(), adapter.clone(), settings());

        let outcome = turn(&orch, ThreadSelector::New, "use the tool").await.unwrap();
        assert_eq!(outcome.message.text(), "done");
        assert_eq!(adapter.handles_opened(), 1);
        assert_eq!(adapter.replays(), vec![("handle_1".to_string(), 0)]);

        let calls = adapter.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.handle.as_deref() == Some("handle_1")));
        assert_eq!(calls[0].pending.len(), 1);
        assert_eq!(calls[0].pending[0].role, Role::User);
        assert_eq!(calls[1].pending.len(), 1);
        assert_eq!(calls[1].pending[0].role, Role::Tool);
        assert_eq!(calls[1].pending[0].tool_results()[0].payload, "pong");
        assert_eq!(calls[1].pending[0].seq, 3);

        let messages = store.list_messages(&outcome.thread_id, None, None).await.unwrap();
        assert_eq!(
            roles(&messages),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn test_same_thread_turns_are_serialized() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(
            ScriptedAdapter::new(AdapterKind::StatelessResponses, vec![Step::text("reply")])
                .with_delay(Duration::from_millis(30)),
        );
        let orch = Arc::new(orchestrator(store.clone(), adapter.clone(), settings()));

        let first = turn(&orch, ThreadSelector::New, "start").await.unwrap();
        let tid = first.thread_id;

        let a = {
            let orch = orch.clone();
            let tid = tid.clone();
            tokio::spawn(async move { turn(&orch, ThreadSelector::Existing(tid), "one").await })
        };
        let b = {
            let orch = orch.clone();
            let tid = tid.clone();
            tokio::spawn(async move { turn(&orch, ThreadSelector::Existing(tid), "two").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let messages = store.list_messages(&tid, None, None).await.unwrap();
        assert_eq!(
            roles(&messages),
            vec![
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant
            ]
        );
        let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);

        let calls = adapter.calls();
        assert_eq!(calls[1].history.len(), 3);
        assert_eq!(calls[2].history.len(), 5);
    }

    #[tokio::test]
    async fn test_stateful_handle_is_created_and_rebuilt() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatefulThread,
            vec![Step::text("one"), Step::InvalidHandle, Step::text("two")],
        ));
        let orch = orchestrator(store.clone(), adapter.clone(), settings());

        let first = turn(&orch, ThreadSelector::New, "first").await.unwrap();
        let tid = first.thread_id;
        let thread = store.get_thread(&tid).await.unwrap().unwrap();
        assert_eq!(thread.provider_handle.as_deref(), Some("handle_1"));

        let second = turn(&orch, ThreadSelector::Existing(tid.clone()), "second")
            .await
            .unwrap();
        assert_eq!(second.message.text(), "two");

        let thread = store.get_thread(&tid).await.unwrap().unwrap();
        assert_eq!(thread.provider_handle.as_deref(), Some("handle_2"));
        assert_eq!(adapter.handles_opened(), 2);
        assert_eq!(
            adapter.replays(),
            vec![("handle_1".to_string(), 0), ("handle_2".to_string(), 2)]
        );

        let calls = adapter.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].handle.as_deref(), Some("handle_2"));
        assert_eq!(calls[2].pending.len(), 1);
        assert_eq!(calls[2].pending[0].text(), "second");
    }

    #[tokio::test]
    async fn test_provider_switch_keeps_history() {
        let store = Arc::new(InMemoryStore::new());
        let openai = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::text("from openai")],
        ));
        let anthropic = Arc::new(ScriptedAdapter::new(
            AdapterKind::MessageList,
            vec![Step::text("from claude")],
        ));
        let mut providers = ProviderRegistry::new();
        providers.register("openai", openai);
        providers.register("anthropic", anthropic.clone());
        let orch = Orchestrator::new(store.clone(), providers, echo_tools(), settings());

        let first = turn(&orch, ThreadSelector::New, "hi").await.unwrap();
        let selection = orch.select("anthropic", Some("claude-sonnet-4-5")).unwrap();
        let second = orch
            .handle_turn(
                ThreadSelector::Existing(first.thread_id.clone()),
                "still there?",
                budget(16_000),
                Some(selection),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(second.message.text(), "from claude");

        let thread = store.get_thread(&first.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.provider.provider, "anthropic");
        assert_eq!(thread.provider.model, "claude-sonnet-4-5");
        assert_eq!(anthropic.calls()[0].history.len(), 3);
    }

    #[tokio::test]
    async fn test_persistence_failure_returns_reply() {
        let store = Arc::new(FailingStore::new(InMemoryStore::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::text("saved"), Step::text("not saved")],
        ));
        let orch = orchestrator(store.clone(), adapter, settings());

        let first = turn(&orch, ThreadSelector::New, "one").await.unwrap();
        store.arm();
        let err = turn(&orch, ThreadSelector::Existing(first.thread_id.clone()), "two")
            .await
            .unwrap_err()
            .error;
        match err {
            TurnError::Persistence { unsaved_reply, .. } => {
                assert_eq!(unsaved_reply.unwrap().text(), "not saved");
            }
            other => panic!("unexpected error: {other}"),
        }

        let messages = store.list_messages(&first.thread_id, None, None).await.unwrap();
        assert_eq!(
            roles(&messages),
            vec![Role::User, Role::Assistant, Role::User]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_turn() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = Arc::new(
            ScriptedAdapter::new(AdapterKind::StatelessResponses, vec![Step::text("too late")])
                .with_delay(Duration::from_secs(5)),
        );
        let orch = orchestrator(store.clone(), adapter, settings());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = orch
            .handle_turn(ThreadSelector::New, "hello", budget(16_000), None, cancel)
            .await
            .unwrap_err()
            .error;
        assert!(matches!(err, TurnError::Cancelled));

        let threads = store.list_threads().await.unwrap();
        let messages = store.list_messages(&threads[0].id, None, None).await.unwrap();
        assert_eq!(roles(&messages), vec![Role::User]);
    }

    #[tokio::test]
    async fn test_unknown_thread_and_provider() {
        let adapter = Arc::new(ScriptedAdapter::new(AdapterKind::StatelessResponses, vec![]));
        let orch = orchestrator(Arc::new(InMemoryStore::new()), adapter, settings());
        let err = turn(&orch, ThreadSelector::Existing(ThreadId::from("missing")), "hi")
            .await
            .unwrap_err()
            .error;
        assert!(matches!(err, TurnError::ThreadNotFound(_)));

        let empty = Orchestrator::new(
            Arc::new(InMemoryStore::new()),
            ProviderRegistry::new(),
            Arc::new(ToolDispatcher::empty()),
            settings(),
        );
        let err = turn(&empty, ThreadSelector::New, "hi").await.unwrap_err().error;
        assert!(matches!(err, TurnError::UnknownProvider(name) if name == "openai"));
    }
}
