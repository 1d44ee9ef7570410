use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::events::{InboundMessage, OutboundMessage};
use crate::bus::MessageBus;
use crate::message::ThreadId;
use crate::orchestrator::{Orchestrator, ThreadSelector, TurnError};
use crate::provider::BudgetPolicy;

const HELP_TEXT: &str = "Send a message to talk to the assistant.\n\
/new - start a new thread\n\
/thread - show the current thread id\n\
/help - show this message";

/// A chat worker with nothing to do for this long exits.
const CHAT_IDLE: Duration = Duration::from_secs(300);

/// Which thread each chat is talking in, persisted as `chats.json`.
pub struct ChatThreads {
    path: Option<PathBuf>,
    map: Mutex<HashMap<String, ThreadId>>,
}

impl ChatThreads {
    /// Load the map from `path`; a missing file is an empty map.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("invalid chat map {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        Ok(Self {
            path: Some(path),
            map: Mutex::new(map),
        })
    }

    /// A map that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, chat_key: &str) -> Option<ThreadId> {
        self.map.lock().await.get(chat_key).cloned()
    }

    pub async fn set(&self, chat_key: &str, thread: ThreadId) -> Result<()> {
        let mut map = self.map.lock().await;
        map.insert(chat_key.to_string(), thread);
        self.save(&map).await
    }

    /// Forget the chat's thread. Returns whether one was mapped.
    pub async fn clear(&self, chat_key: &str) -> Result<bool> {
        let mut map = self.map.lock().await;
        let removed = map.remove(chat_key).is_some();
        if removed {
            self.save(&map).await?;
        }
        Ok(removed)
    }

    async fn save(&self, map: &HashMap<String, ThreadId>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(map)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Bridges the message bus with the orchestrator.
///
/// Every chat gets a worker task fed by its own queue, so different chats
/// proceed in parallel and messages from one chat are handled in arrival
/// order.
pub struct ChatBridge {
    bus: Arc<MessageBus>,
    orchestrator: Arc<Orchestrator>,
    chats: Arc<ChatThreads>,
    budget: BudgetPolicy,
    shutdown: CancellationToken,
}

impl ChatBridge {
    pub fn new(
        bus: Arc<MessageBus>,
        orchestrator: Arc<Orchestrator>,
        chats: Arc<ChatThreads>,
        budget: BudgetPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            orchestrator,
            chats,
            budget,
            shutdown,
        }
    }

    /// Run the bridge loop until the bus is closed or shutdown is requested.
    pub async fn run(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundMessage>) -> Result<()> {
        info!("Chat bridge started, waiting for inbound messages...");
        let mut queues: HashMap<String, mpsc::UnboundedSender<InboundMessage>> = HashMap::new();

        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = inbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            debug!(channel = %msg.channel, chat_id = %msg.chat_id, "Bridge received message");

            let key = msg.chat_key();
            let msg = match queues.get(&key) {
                Some(queue) => match queue.send(msg) {
                    Ok(()) => continue,
                    // The worker went idle and closed its queue.
                    Err(mpsc::error::SendError(msg)) => msg,
                },
                None => msg,
            };

            let (tx, rx) = mpsc::unbounded_channel();
            if tx.send(msg).is_ok() {
                let bridge = Arc::clone(&self);
                tokio::spawn(async move { bridge.chat_worker(rx).await });
                queues.insert(key, tx);
            }
        }

        info!("Chat bridge shutting down");
        Ok(())
    }

    /// Handle one chat's messages in order until the queue closes or idles.
    async fn chat_worker(&self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        loop {
            match tokio::time::timeout(CHAT_IDLE, rx.recv()).await {
                Ok(Some(msg)) => self.handle(msg).await,
                Ok(None) => return,
                Err(_) => {
                    // New messages now go to a fresh worker; finish what was queued.
                    rx.close();
                    while let Ok(msg) = rx.try_recv() {
                        self.handle(msg).await;
                    }
                    return;
                }
            }
        }
    }

    async fn handle(&self, msg: InboundMessage) {
        let key = msg.chat_key();

        let reply = match command(&msg.content) {
            Some("new") => match self.chats.clear(&key).await {
                Ok(_) => "🆕 Started a new thread.".to_string(),
                Err(e) => format!("⚠️ Error: {e}"),
            },
            Some("thread") => match self.chats.get(&key).await {
                Some(id) => format!("🧵 Current thread: {id}"),
                None => "No thread yet. Send a message to start one.".to_string(),
            },
            Some("start") | Some("help") => HELP_TEXT.to_string(),
            _ => self.converse(&msg, &key).await,
        };

        self.bus
            .publish_outbound(OutboundMessage::reply(msg.channel, msg.chat_id, reply))
            .await;
    }

    async fn converse(&self, msg: &InboundMessage, key: &str) -> String {
        self.bus
            .publish_outbound(OutboundMessage::typing(&msg.channel, &msg.chat_id))
            .await;

        let existing = self.chats.get(key).await;
        let selector = ThreadSelector::from(existing.clone());
        let result = self
            .orchestrator
            .handle_turn(selector, &msg.content, self.budget, None, self.shutdown.child_token())
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                // A failed first turn still created a thread; keep using it.
                if let (Some(id), false) = (
                    &failure.thread_id,
                    matches!(failure.error, TurnError::ThreadNotFound(_)),
                ) {
                    self.remember(key, existing.as_ref(), id).await;
                }
                return self.failure_reply(key, failure.error).await;
            }
        };

        self.remember(key, existing.as_ref(), &outcome.thread_id).await;
        for warning in &outcome.warnings {
            warn!(chat = key, thread = %outcome.thread_id, "{warning}");
        }
        let text = outcome.message.text();
        if text.trim().is_empty() {
            "(no text in reply)".to_string()
        } else {
            text
        }
    }

    async fn remember(&self, key: &str, existing: Option<&ThreadId>, thread: &ThreadId) {
        if existing != Some(thread) {
            if let Err(e) = self.chats.set(key, thread.clone()).await {
                error!(chat = key, "Failed to save chat map: {e:#}");
            }
        }
    }

    async fn failure_reply(&self, key: &str, error: TurnError) -> String {
        match error {
            TurnError::ThreadNotFound(id) => {
                warn!(chat = key, thread = %id, "Mapped thread is gone, resetting chat");
                if let Err(e) = self.chats.clear(key).await {
                    error!(chat = key, "Failed to save chat map: {e:#}");
                }
                "⚠️ This chat's thread no longer exists. Send your message again to start a new one."
                    .to_string()
            }
            TurnError::Persistence {
                reason,
                unsaved_reply: Some(reply),
            } => {
                error!(chat = key, "Reply not saved: {reason}");
                format!("{}\n\n⚠️ This reply could not be saved: {reason}", reply.text())
            }
            e => {
                error!(chat = key, "Error processing message: {e}");
                format!("⚠️ Error: {e}")
            }
        }
    }
}

/// Command name of a `/command` message, bot mention stripped.
fn command(content: &str) -> Option<&str> {
    let word = content.trim().strip_prefix('/')?.split_whitespace().next()?;
    Some(word.split('@').next().unwrap_or(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::dispatch_outbound;
    use crate::mcp::ToolDispatcher;
    use crate::orchestrator::OrchestratorSettings;
    use crate::provider::{AdapterKind, ProviderRegistry};
    use crate::store::{HistoryStore, InMemoryStore};
    use crate::testing::{ScriptedAdapter, Step};
    use std::time::Duration;

    struct Harness {
        tx: mpsc::Sender<InboundMessage>,
        replies: mpsc::UnboundedReceiver<(String, String)>,
        store: Arc<InMemoryStore>,
        chats: Arc<ChatThreads>,
        adapter: Arc<ScriptedAdapter>,
    }

    impl Harness {
        async fn new(chats: ChatThreads, steps: Vec<Step>) -> Self {
            Self::with_adapter(chats, ScriptedAdapter::new(AdapterKind::StatelessResponses, steps)).await
        }

        async fn with_adapter(chats: ChatThreads, adapter: ScriptedAdapter) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let adapter = Arc::new(adapter);
            let mut providers = ProviderRegistry::new();
            providers.register("openai", adapter.clone());
            let orchestrator = Arc::new(Orchestrator::new(
                store.clone(),
                providers,
                Arc::new(ToolDispatcher::empty()),
                OrchestratorSettings::default(),
            ));

            let (bus, receivers) = MessageBus::new(16);
            let bus = Arc::new(bus);
            let (reply_tx, replies) = mpsc::unbounded_channel();
            bus.subscribe_outbound("telegram", move |msg| {
                let reply_tx = reply_tx.clone();
                async move {
                    if let OutboundMessage::Reply { chat_id, content, .. } = msg {
                        let _ = reply_tx.send((chat_id, content));
                    }
                }
            })
            .await;
            tokio::spawn(dispatch_outbound(bus.subscribers(), receivers.outbound_rx));

            let chats = Arc::new(chats);
            let bridge = Arc::new(ChatBridge::new(
                bus.clone(),
                orchestrator,
                chats.clone(),
                BudgetPolicy::new(16_000, 0),
                CancellationToken::new(),
            ));
            tokio::spawn(bridge.run(receivers.inbound_rx));

            Self {
                tx: bus.inbound_sender(),
                replies,
                store,
                chats,
                adapter,
            }
        }

        async fn send(&self, chat: &str, text: &str) {
            self.tx
                .send(InboundMessage::new("telegram", chat, "7", text))
                .await
                .unwrap();
        }

        async fn reply(&mut self, chat: &str) -> String {
            let (chat_id, content) = tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chat_id, chat);
            content
        }

        async fn say(&mut self, chat: &str, text: &str) -> String {
            self.send(chat, text).await;
            self.reply(chat).await
        }
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(command("/new"), Some("new"));
        assert_eq!(command("  /new@colloquy_bot  "), Some("new"));
        assert_eq!(command("/thread abc"), Some("thread"));
        assert_eq!(command("hello /new"), None);
        assert_eq!(command("/"), None);
    }

    #[tokio::test]
    async fn test_chat_keeps_its_thread() {
        let mut h = Harness::new(
            ChatThreads::in_memory(),
            vec![Step::text("first"), Step::text("second")],
        )
        .await;

        assert_eq!(h.say("100", "hello").await, "first");
        assert_eq!(h.say("100", "again").await, "second");

        let threads = h.store.list_threads().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(h.chats.get("telegram:100").await, Some(threads[0].id.clone()));
        assert_eq!(h.adapter.calls()[1].history.len(), 3);
    }

    #[tokio::test]
    async fn test_new_command_starts_fresh_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let mut h = Harness::new(ChatThreads::load(path.clone()).await.unwrap(), vec![]).await;

        h.say("5", "one").await;
        let first = h.chats.get("telegram:5").await.unwrap();
        assert!(h.say("5", "/new").await.contains("new thread"));
        assert_eq!(h.chats.get("telegram:5").await, None);
        h.say("5", "two").await;
        let second = h.chats.get("telegram:5").await.unwrap();
        assert_ne!(first, second);

        // The mapping survives a reload.
        let reloaded = ChatThreads::load(path).await.unwrap();
        assert_eq!(reloaded.get("telegram:5").await, Some(second.clone()));
        assert!(h.say("5", "/thread").await.contains(second.as_str()));
    }

    #[tokio::test]
    async fn test_turn_errors_are_reported() {
        let mut h = Harness::new(ChatThreads::in_memory(), vec![Step::Rejected]).await;
        let reply = h.say("9", "hello").await;
        assert!(reply.starts_with("⚠️ Error:"));
    }

    #[tokio::test]
    async fn test_failed_first_turn_keeps_its_thread() {
        let mut h = Harness::new(
            ChatThreads::in_memory(),
            vec![Step::Rejected, Step::text("recovered")],
        )
        .await;

        assert!(h.say("3", "hello").await.starts_with("⚠️ Error:"));
        let thread = h.chats.get("telegram:3").await.unwrap();
        assert_eq!(h.say("3", "hello again").await, "recovered");

        let threads = h.store.list_threads().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, thread);
        let messages = h.store.list_messages(&thread, None, None).await.unwrap();
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_messages_in_one_chat_keep_their_order() {
        let adapter = ScriptedAdapter::new(
            AdapterKind::StatelessResponses,
            vec![Step::text("r1"), Step::text("r2"), Step::text("r3")],
        )
        .with_delay(Duration::from_millis(20));
        let mut h = Harness::with_adapter(ChatThreads::in_memory(), adapter).await;

        for text in ["one", "two", "three"] {
            h.send("8", text).await;
        }
        for expected in ["r1", "r2", "r3"] {
            assert_eq!(h.reply("8").await, expected);
        }

        let thread = h.chats.get("telegram:8").await.unwrap();
        let messages = h.store.list_messages(&thread, None, None).await.unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "r1", "two", "r2", "three", "r3"]);
    }
}
