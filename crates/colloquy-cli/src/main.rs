//! 💬 colloquy CLI: interactive chat, thread management, bot mode.
//!
//! Usage:
//!   colloquy chat           : Start an interactive chat session
//!   colloquy threads list   : List saved threads
//!   colloquy bot            : Run the Telegram bot
//!   colloquy onboard        : Create a default configuration
//!   colloquy status         : Show current configuration and health

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use colloquy_core::config::Config;
use colloquy_core::mcp::{McpConfig, ToolDispatcher};
use colloquy_core::message::{excerpt, ContentPart, Message, Role, ThreadId};
use colloquy_core::orchestrator::{
    Orchestrator, OrchestratorSettings, ThreadSelector, TurnError, TurnFailure, TurnOutcome,
};
use colloquy_core::provider::{ProviderRegistry, ProviderSelection, ThinkingConfig};
use colloquy_core::store::{HistoryStore, JsonlStore};
#[cfg(feature = "telegram")]
use colloquy_core::gateway::channels::telegram::TelegramTransport;
#[cfg(feature = "telegram")]
use colloquy_core::gateway::{ChatBridge, ChatThreads};

#[derive(Parser)]
#[command(
    name = "colloquy",
    version,
    about = "Talk to LLM providers with durable, provider-agnostic threads",
    long_about = "💬 colloquy — one conversation history across OpenAI, Assistants and Anthropic,\nwith MCP tool servers available during every turn."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Continue an existing thread
        #[arg(short, long)]
        thread: Option<String>,

        /// Provider to use (openai, assistants, anthropic)
        #[arg(short, long)]
        provider: Option<String>,

        /// Model to use (overrides config)
        #[arg(short, long)]
        model: Option<String>,

        /// Reasoning effort: 0 off, 1 medium, 2 high
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
        thinking: Option<u8>,
    },

    /// Manage saved threads
    Threads {
        #[command(subcommand)]
        action: Option<ThreadCommands>,
    },

    /// Start the bot in background mode (Telegram)
    Bot,

    /// Create or reset the default configuration
    Onboard,

    /// Show configuration status and health
    Status,
}

#[derive(Subcommand)]
enum ThreadCommands {
    /// List all threads, most recent first
    List,
    /// Print a thread's messages
    Show {
        /// Thread id
        id: String,
    },
    /// Delete a thread
    Delete {
        /// Thread id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Chat output shares the terminal with logs, so stay quiet unless asked.
    let default_filter = if matches!(cli.command, Some(Commands::Bot)) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Some(Commands::Chat {
            thread,
            provider,
            model,
            thinking,
        }) => cmd_chat(thread, provider, model, thinking).await?,
        Some(Commands::Threads { action }) => cmd_threads(action.unwrap_or(ThreadCommands::List)).await?,
        Some(Commands::Bot) => cmd_bot().await?,
        Some(Commands::Onboard) => cmd_onboard()?,
        Some(Commands::Status) => cmd_status().await?,
        None => cmd_chat(None, None, None, None).await?,
    }

    Ok(())
}

// ── Shared Setup ────────────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        eprintln!("\n  \x1b[31m❌ Configuration errors:\x1b[0m");
        for e in &errors {
            eprintln!("     • {}", e);
        }
        eprintln!();
        anyhow::bail!("Fix the above {} error(s) in config.json", errors.len());
    }
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<JsonlStore>> {
    let store = JsonlStore::open(config.storage_path()).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

/// Load config, open the store, and wire providers and tools into an
/// orchestrator.
async fn setup_orchestrator(config: &Config, thinking: Option<u8>) -> Result<Arc<Orchestrator>> {
    let providers = ProviderRegistry::from_config(config, reqwest::Client::new());
    if providers.is_empty() {
        anyhow::bail!(
            "No LLM provider configured with a real API key. \
             Run `colloquy onboard` first, then edit config.json"
        );
    }

    let mcp = if config.tools.enabled {
        McpConfig::load(&config.mcp_config_path())?
    } else {
        McpConfig::default()
    };
    let tools = ToolDispatcher::stdio(mcp, config.tools.timeout());

    let mut settings = OrchestratorSettings::from_config(config);
    if let Some(level) = thinking {
        settings.thinking = ThinkingConfig::new(level);
    }

    let store = open_store(config).await?;
    let orchestrator = Orchestrator::new(store, providers, Arc::new(tools), settings);
    orchestrator.ensure_migrated().await?;
    Ok(Arc::new(orchestrator))
}

// ── Chat Command ────────────────────────────────────────────────────

async fn cmd_chat(
    thread: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    thinking: Option<u8>,
) -> Result<()> {
    let config = Config::load()?;
    validate_config(&config)?;
    let orchestrator = setup_orchestrator(&config, thinking).await?;
    let budget = config.budget();

    let mut current: Option<ThreadId> = thread.map(ThreadId::from);
    if let Some(id) = &current {
        if orchestrator.store().get_thread(id).await?.is_none() {
            anyhow::bail!("Thread {id} not found. Run `colloquy threads list` to see saved threads.");
        }
    }
    let selection = resolve_selection(&orchestrator, current.as_ref(), provider, model).await?;
    let shown = match &selection {
        Some(s) => s.clone(),
        None => orchestrator.default_selection()?,
    };

    // Print header
    println!();
    println!("  💬 colloquy v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Providers: {} | Using: {}",
        orchestrator.providers().names().join(", "),
        shown
    );
    match &current {
        Some(id) => println!("  Thread: {id}"),
        None => println!("  Thread: (new)"),
    }
    let servers = orchestrator.tools().server_ids().await;
    if !servers.is_empty() {
        println!("  Tool servers: {}", servers.join(", "));
    }
    println!();
    println!("  Type your message, /help for commands, or /quit to exit.");
    println!("  ─────────────────────────────────────");
    println!();

    // Interactive loop
    let mut lines = spawn_stdin_reader();
    let mut last_reply: Option<Message> = None;
    loop {
        print!("  \x1b[36m>\x1b[0m ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("  Goodbye! 👋");
                break;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let line = line?;
        let input = line.trim();

        if input.is_empty() {
            continue;
        }

        // Handle commands
        if let Some(command) = input.strip_prefix('/') {
            let (name, arg) = command
                .split_once(char::is_whitespace)
                .map_or((command, ""), |(n, a)| (n, a.trim()));
            match name {
                "quit" | "exit" | "q" => {
                    println!("  Goodbye! 👋");
                    break;
                }
                "help" => print_chat_help(),
                "new" => {
                    current = None;
                    last_reply = None;
                    println!("  🆕 Next message starts a new thread.\n");
                }
                "threads" => print_threads(orchestrator.store().as_ref()).await?,
                "thread" if !arg.is_empty() => {
                    let id = ThreadId::from(arg);
                    match orchestrator.store().get_thread(&id).await? {
                        Some(t) => {
                            println!("  🧵 Switched to {} ({})\n", t.id, t.label);
                            current = Some(id);
                            last_reply = None;
                        }
                        None => println!("  \x1b[31mThread {id} not found.\x1b[0m\n"),
                    }
                }
                "thread" => match &current {
                    Some(id) => println!("  🧵 {id}\n"),
                    None => println!("  No thread yet.\n"),
                },
                "last" => match last_assistant(&orchestrator, current.as_ref(), &last_reply).await? {
                    Some(text) => println!("  \x1b[32m{}\x1b[0m\n", text),
                    None => println!("  No reply yet.\n"),
                },
                _ => println!("  Unknown command. Type /help.\n"),
            }
            continue;
        }

        println!();
        let selector = ThreadSelector::from(current.clone());
        match run_turn(&orchestrator, selector, input, budget, selection.clone()).await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    println!("  \x1b[33m⚠️  {}\x1b[0m", warning);
                }
                println!("  \x1b[32m{}\x1b[0m\n", outcome.message.text());
                if outcome.tool_rounds > 0 {
                    println!("  \x1b[2m({} tool round(s))\x1b[0m\n", outcome.tool_rounds);
                }
                current = Some(outcome.thread_id);
                last_reply = Some(outcome.message);
            }
            Err(failure) => {
                // Stay on the thread the turn created so a retry continues it.
                if let Some(id) = failure.thread_id {
                    current = Some(id);
                }
                match failure.error {
                    TurnError::Cancelled => println!("  ⏹  Cancelled.\n"),
                    TurnError::Persistence {
                        reason,
                        unsaved_reply: Some(reply),
                    } => {
                        println!("  \x1b[32m{}\x1b[0m\n", reply.text());
                        eprintln!("  \x1b[31mThis reply was not saved: {}\x1b[0m\n", reason);
                    }
                    e => eprintln!("  \x1b[31mError: {}\x1b[0m\n", e),
                }
            }
        }
    }

    Ok(())
}

/// Read stdin lines on a dedicated thread so the chat loop can also wait
/// for Ctrl+C.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        loop {
            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
    rx
}

/// Run one turn; Ctrl+C cancels it instead of killing the session.
async fn run_turn(
    orchestrator: &Orchestrator,
    selector: ThreadSelector,
    input: &str,
    budget: colloquy_core::provider::BudgetPolicy,
    selection: Option<ProviderSelection>,
) -> Result<TurnOutcome, TurnFailure> {
    let cancel = CancellationToken::new();
    let turn = orchestrator.handle_turn(selector, input, budget, selection, cancel.clone());
    tokio::pin!(turn);
    tokio::select! {
        result = &mut turn => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            turn.await
        }
    }
}

/// Provider selection implied by `--provider` / `--model`.
///
/// `--model` alone keeps the thread's provider (or the default one).
async fn resolve_selection(
    orchestrator: &Orchestrator,
    thread: Option<&ThreadId>,
    provider: Option<String>,
    model: Option<String>,
) -> Result<Option<ProviderSelection>> {
    if provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let provider = match provider {
        Some(p) => p,
        None => match thread {
            Some(id) => match orchestrator.store().get_thread(id).await? {
                Some(t) => t.provider.provider,
                None => orchestrator.settings().default_provider.clone(),
            },
            None => orchestrator.settings().default_provider.clone(),
        },
    };
    Ok(Some(orchestrator.select(&provider, model.as_deref())?))
}

async fn last_assistant(
    orchestrator: &Orchestrator,
    thread: Option<&ThreadId>,
    cached: &Option<Message>,
) -> Result<Option<String>> {
    if let Some(message) = cached {
        return Ok(Some(message.text()));
    }
    let Some(id) = thread else {
        return Ok(None);
    };
    let page = orchestrator.settings().history_page_size;
    let history = orchestrator.history(id, page).await?;
    Ok(history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.text().is_empty())
        .map(Message::text))
}

fn print_chat_help() {
    println!("  /new            start a new thread");
    println!("  /threads        list saved threads");
    println!("  /thread <id>    switch to a thread (no id: show current)");
    println!("  /last           repeat the last reply");
    println!("  /quit           exit");
    println!("  Ctrl+C while waiting cancels the current turn; at the prompt it exits.");
    println!();
}

// ── Threads Command ─────────────────────────────────────────────────

async fn cmd_threads(action: ThreadCommands) -> Result<()> {
    let config = Config::load()?;
    let store = open_store(&config).await?;

    match action {
        ThreadCommands::List => print_threads(store.as_ref()).await?,
        ThreadCommands::Show { id } => {
            let id = ThreadId::from(id);
            let Some(thread) = store.get_thread(&id).await? else {
                anyhow::bail!("Thread {id} not found");
            };
            println!();
            println!("  🧵 {} — {}", thread.id, thread.label);
            println!("  Provider: {}", thread.provider);
            println!("  ─────────────────────────────────────");
            for message in store.list_messages(&id, None, None).await? {
                print_message(&message);
            }
            println!();
        }
        ThreadCommands::Delete { id } => {
            let id = ThreadId::from(id);
            if store.delete_thread(&id).await? {
                println!("  🗑  Deleted thread {id}");
            } else {
                println!("  Thread {id} not found.");
            }
        }
    }
    Ok(())
}

async fn print_threads(store: &dyn HistoryStore) -> Result<()> {
    let threads = store.list_threads().await?;
    if threads.is_empty() {
        println!("  No saved threads.\n");
        return Ok(());
    }
    println!();
    for t in threads {
        println!(
            "  {}  {}  {:<28}  {}",
            t.id,
            t.updated_at.format("%Y-%m-%d %H:%M"),
            t.provider.to_string(),
            t.label
        );
    }
    println!();
    Ok(())
}

fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => "\x1b[36myou\x1b[0m",
        Role::Assistant => "\x1b[32massistant\x1b[0m",
        Role::System => "\x1b[35msystem\x1b[0m",
        Role::Tool => "\x1b[33mtool\x1b[0m",
    };
    for part in &message.parts {
        match part {
            ContentPart::Text { text } => println!("  [{label}] {text}"),
            ContentPart::Thinking { thinking, .. } => {
                println!("  [{label}] \x1b[2m💭 {}\x1b[0m", excerpt(thinking, 120))
            }
            ContentPart::RedactedThinking { .. } => println!("  [{label}] \x1b[2m💭 (redacted)\x1b[0m"),
            ContentPart::ToolCall(call) => println!(
                "  [{label}] 🔧 {}({})",
                call.qualified_name(),
                excerpt(&serde_json::Value::Object(call.arguments.clone()).to_string(), 120)
            ),
            ContentPart::ToolResult(result) => println!(
                "  [{label}] {} {}",
                if result.success { "✅" } else { "❌" },
                excerpt(&result.payload, 120)
            ),
        }
    }
}

// ── Bot Command ─────────────────────────────────────────────────────

#[cfg(feature = "telegram")]
async fn cmd_bot() -> Result<()> {
    let config = Config::load()?;
    validate_config(&config)?;

    let tg = &config.channels.telegram;
    if !tg.enabled || tg.token.is_empty() {
        println!("  ⚠️ No bot channels enabled. Please check your config.");
        return Ok(());
    }

    let orchestrator = setup_orchestrator(&config, None).await?;
    let chats = Arc::new(ChatThreads::load(config.storage_path().join("chats.json")).await?);

    let (bus, receivers) = colloquy_core::bus::MessageBus::new(100);
    let bus_arc = Arc::new(bus);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // 1. Start the transport FIRST so it registers its outbound subscriber
    //    before the dispatch loop begins processing messages.
    {
        let transport = TelegramTransport::new(tg.token.clone(), Arc::clone(&bus_arc), tg.allow_from.clone());
        let cancel_tel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transport.run(cancel_tel).await {
                tracing::error!("Telegram transport failed: {}", e);
            }
        }));
    }

    // 2. Outbound Dispatcher: uses the shared subscriber map, no bus lock needed
    let subs = bus_arc.subscribers();
    tasks.push(tokio::spawn(async move {
        colloquy_core::bus::dispatch_outbound(subs, receivers.outbound_rx).await;
    }));

    // 3. Chat Bridge Task: with CancellationToken for graceful shutdown
    let bridge = Arc::new(ChatBridge::new(
        Arc::clone(&bus_arc),
        orchestrator,
        chats,
        config.budget(),
        cancel.clone(),
    ));
    let inbound_rx = receivers.inbound_rx;
    tasks.push(tokio::spawn(async move {
        if let Err(e) = bridge.run(inbound_rx).await {
            tracing::error!("Chat bridge failed: {}", e);
        }
    }));

    println!("  💬 colloquy bot mode starting...");
    println!("  Active channels: Telegram");
    if !tg.allow_from.is_empty() {
        println!("  Allowed users: {}", tg.allow_from.join(", "));
    }
    println!("  Press Ctrl+C for graceful shutdown.");
    println!("  ─────────────────────────────────────");

    // Wait for Ctrl+C, then cancel the bridge gracefully.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\n  ⏳ Shutting down gracefully...");
            cancel.cancel();
        }
        _ = async { futures::future::join_all(tasks).await } => {
            // All tasks finished on their own.
        }
    }

    println!("  ✅ Shutdown complete.");
    Ok(())
}

#[cfg(not(feature = "telegram"))]
async fn cmd_bot() -> Result<()> {
    anyhow::bail!("This build has no bot transports. Rebuild with `--features telegram`.")
}

// ── Onboard Command ─────────────────────────────────────────────────

fn cmd_onboard() -> Result<()> {
    let path = Config::write_default_template()?;
    println!();
    println!("  ✅ Configuration created at:");
    println!("     {}", path.display());
    println!();
    println!("  Next steps:");
    println!("  1. Edit the config file and add your API key");
    println!("  2. Optionally list MCP tool servers in ~/.colloquy/mcp.json");
    println!("  3. Run `colloquy chat` to start chatting");
    println!();
    Ok(())
}

// ── Status Command ──────────────────────────────────────────────────

async fn cmd_status() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load()?;

    println!();
    println!("  💬 colloquy status");
    println!("  ─────────────────────────────────────");

    // Config file
    if config_path.exists() {
        println!("  Config:    {}", config_path.display());
    } else {
        println!("  Config:    ❌ Not found (run `colloquy onboard`)");
        return Ok(());
    }

    // Providers
    let providers = ProviderRegistry::from_config(&config, reqwest::Client::new());
    if providers.is_empty() {
        println!("  Provider:  ❌ No provider configured");
    } else {
        println!("  Providers: ✅ {}", providers.names().join(", "));
    }
    let defaults = &config.agents.defaults;
    let model = if defaults.model.is_empty() {
        "(provider default)"
    } else {
        defaults.model.as_str()
    };
    println!("  Default:   {} / {}", defaults.provider, model);
    println!("  Budget:    {} history tokens", defaults.max_history_tokens);

    if let Err(errors) = config.validate() {
        for e in errors {
            println!("  ⚠️  {}", e);
        }
    }

    // Storage
    let storage = config.storage_path();
    if storage.exists() {
        let store = open_store(&config).await?;
        println!(
            "  Storage:   {} ✅ ({} threads, schema v{})",
            storage.display(),
            store.list_threads().await?.len(),
            store.schema_version().await?
        );
    } else {
        println!("  Storage:   {} ⚠️  (will be created)", storage.display());
    }

    // Tools
    if config.tools.enabled {
        match McpConfig::load(&config.mcp_config_path()) {
            Ok(mcp) if mcp.is_empty() => println!("  Tools:     none configured"),
            Ok(mcp) => println!("  Tools:     {}", mcp.server_ids().join(", ")),
            Err(e) => println!("  Tools:     ❌ {}", e),
        }
    } else {
        println!("  Tools:     disabled");
    }

    println!();
    Ok(())
}
