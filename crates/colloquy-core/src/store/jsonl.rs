//! File-backed store.
//!
//! Layout under the root directory:
//!
//! ```text
//! schema.json              {"version": 2}
//! threads/<id>.jsonl       one serialized Message per line, append-only
//! threads/<id>.meta.json   the Thread record, replaced atomically
//! legacy/                  v1 session files after migration
//! ```
//!
//! Version 1 is the older session layout: `<key>.jsonl` files directly under
//! the root, a `_type: metadata` header line followed by flat
//! `{role, content, tool_calls, tool_call_id, name}` lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{page, HistoryStore, NewThread, StoreError, Thread, SCHEMA_VERSION};
use crate::message::codec::decode_function_tool_call;
use crate::message::{ContentPart, Message, MessageId, Role, ThreadId, ToolResult};
use crate::provider::{AdapterKind, ProviderSelection};

const SCHEMA_FILE: &str = "schema.json";
const THREADS_DIR: &str = "threads";
const LEGACY_DIR: &str = "legacy";

#[derive(Debug, Serialize, Deserialize)]
struct SchemaMarker {
    version: u32,
}

/// Last assigned sequence number, loaded on first append.
type SeqSlot = Arc<Mutex<Option<u64>>>;

pub struct JsonlStore {
    root: PathBuf,
    append_locks: StdMutex<HashMap<ThreadId, SeqSlot>>,
}

impl JsonlStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(THREADS_DIR)).await?;
        Ok(Self {
            root,
            append_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn threads_dir(&self) -> PathBuf {
        self.root.join(THREADS_DIR)
    }

    fn log_path(&self, id: &ThreadId) -> PathBuf {
        self.threads_dir().join(format!("{}.jsonl", safe_name(id.as_str())))
    }

    fn meta_path(&self, id: &ThreadId) -> PathBuf {
        self.threads_dir()
            .join(format!("{}.meta.json", safe_name(id.as_str())))
    }

    fn seq_slot(&self, id: &ThreadId) -> SeqSlot {
        let mut locks = match self.append_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(id.clone()).or_default().clone()
    }

    async fn write_meta(&self, thread: &Thread) -> Result<(), StoreError> {
        let path = self.meta_path(&thread.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(thread)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_meta(&self, id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        let path = self.meta_path(id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    location: path.display().to_string(),
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_log(&self, id: &ThreadId) -> Result<Vec<Message>, StoreError> {
        let path = self.log_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_log(&content, &path))
    }

    /// Cut a torn trailing line and return the last complete sequence number.
    async fn recover_tail(&self, id: &ThreadId) -> Result<u64, StoreError> {
        let path = self.log_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        if !content.is_empty() && !content.ends_with('\n') {
            let keep = content.rfind('\n').map_or(0, |i| i + 1);
            warn!(thread = %id, dropped_bytes = content.len() - keep, "Truncating torn log tail");
            let file = fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(keep as u64).await?;
        }

        Ok(parse_log(&content, &path).last().map_or(0, |m| m.seq))
    }

    async fn legacy_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "jsonl") {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    async fn migrate_v1(&self) -> Result<(), StoreError> {
        let files = self.legacy_files().await?;
        if files.is_empty() {
            return Ok(());
        }
        let legacy_dir = self.root.join(LEGACY_DIR);
        fs::create_dir_all(&legacy_dir).await?;

        for path in files {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let content = fs::read_to_string(&path).await?;
            let id = ThreadId::from(stem.as_str());
            let (thread, messages) = convert_legacy_session(&id, &content);

            let mut lines = String::new();
            for msg in &messages {
                lines.push_str(&serde_json::to_string(msg)?);
                lines.push('\n');
            }
            fs::write(self.log_path(&id), lines).await?;
            self.write_meta(&thread).await?;

            let backup = legacy_dir.join(path.file_name().unwrap_or_default());
            fs::rename(&path, &backup).await?;
            info!(thread = %id, messages = messages.len(), "Migrated legacy session");
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for JsonlStore {
    async fn create_thread(&self, new: NewThread) -> Result<ThreadId, StoreError> {
        let now = Utc::now();
        let thread = Thread {
            id: ThreadId::generate(),
            created_at: now,
            updated_at: now,
            provider: new.provider,
            provider_handle: None,
            label: new.label,
        };
        self.write_meta(&thread).await?;
        fs::File::create(self.log_path(&thread.id)).await?;
        debug!(thread = %thread.id, "Created thread");
        Ok(thread.id)
    }

    async fn append(&self, thread: &ThreadId, mut message: Message) -> Result<MessageId, StoreError> {
        if !fs::try_exists(self.meta_path(thread)).await? {
            return Err(StoreError::ThreadNotFound(thread.clone()));
        }

        let slot = self.seq_slot(thread);
        let mut last_seq = slot.lock().await;
        // Cleared until the line is fully on disk, so a failed write makes
        // the next append repair the tail first.
        let prev = match last_seq.take() {
            Some(seq) => seq,
            None => self.recover_tail(thread).await?,
        };

        message.seq = prev + 1;
        message.thread_id = thread.clone();
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(thread))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        *last_seq = Some(message.seq);
        Ok(message.id)
    }

    async fn list_messages(
        &self,
        thread: &ThreadId,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        if !fs::try_exists(self.meta_path(thread)).await? {
            return Err(StoreError::ThreadNotFound(thread.clone()));
        }
        let log = self.read_log(thread).await?;
        Ok(page(&log, before, limit))
    }

    async fn get_thread(&self, thread: &ThreadId) -> Result<Option<Thread>, StoreError> {
        self.read_meta(thread).await
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError> {
        let mut threads = Vec::new();
        let mut entries = fs::read_dir(self.threads_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            match fs::read(&path).await.map(|b| serde_json::from_slice::<Thread>(&b)) {
                Ok(Ok(thread)) => threads.push(thread),
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Skipping corrupt thread record"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read thread record"),
            }
        }
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    async fn delete_thread(&self, thread: &ThreadId) -> Result<bool, StoreError> {
        let slot = self.seq_slot(thread);
        let _guard = slot.lock().await;

        let existed = fs::try_exists(self.meta_path(thread)).await?;
        for path in [self.meta_path(thread), self.log_path(thread)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Ok(mut locks) = self.append_locks.lock() {
            locks.remove(thread);
        }
        Ok(existed)
    }

    async fn update_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        if !fs::try_exists(self.meta_path(&thread.id)).await? {
            return Err(StoreError::ThreadNotFound(thread.id.clone()));
        }
        self.write_meta(thread).await
    }

    async fn schema_version(&self) -> Result<u32, StoreError> {
        match fs::read(self.root.join(SCHEMA_FILE)).await {
            Ok(bytes) => {
                let marker: SchemaMarker =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                        location: SCHEMA_FILE.into(),
                        reason: e.to_string(),
                    })?;
                Ok(marker.version)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(1),
            Err(e) => Err(e.into()),
        }
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let version = self.schema_version().await?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version == SCHEMA_VERSION {
            return Ok(());
        }

        info!(from = version, to = SCHEMA_VERSION, root = %self.root.display(), "Migrating store");
        if version < 2 {
            self.migrate_v1().await?;
        }

        let marker = serde_json::to_vec(&SchemaMarker {
            version: SCHEMA_VERSION,
        })?;
        let path = self.root.join(SCHEMA_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, marker).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn safe_name(key: &str) -> String {
    key.replace([':', '/', '\\'], "_")
}

/// Parse a message log, skipping a torn final line.
fn parse_log(content: &str, path: &Path) -> Vec<Message> {
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut messages = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(msg) => messages.push(msg),
            Err(_) if i + 1 == lines.len() && !complete => {
                debug!(path = %path.display(), "Ignoring torn final line");
            }
            Err(e) => warn!(path = %path.display(), line = i + 1, error = %e, "Failed to parse message line"),
        }
    }
    messages
}

#[derive(Debug, Deserialize)]
struct LegacyLine {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Convert one v1 session file into a thread record and its messages.
fn convert_legacy_session(id: &ThreadId, content: &str) -> (Thread, Vec<Message>) {
    let mut created_at = None;
    let mut updated_at = None;
    let mut messages = Vec::new();

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            warn!(thread = %id, "Skipping unparsable legacy line");
            continue;
        };
        if value.get("_type").and_then(Value::as_str) == Some("metadata") {
            created_at = parse_time(value.get("created_at").and_then(Value::as_str));
            updated_at = parse_time(value.get("updated_at").and_then(Value::as_str));
            continue;
        }
        let legacy: LegacyLine = match serde_json::from_value(value) {
            Ok(l) => l,
            Err(e) => {
                warn!(thread = %id, error = %e, "Skipping malformed legacy message");
                continue;
            }
        };

        let text = legacy.content.unwrap_or_default();
        let (role, parts) = match legacy.role.as_str() {
            "tool" => (
                Role::Tool,
                vec![ContentPart::ToolResult(ToolResult::ok(
                    legacy.tool_call_id.unwrap_or_default(),
                    text,
                ))],
            ),
            other => {
                let role = match other {
                    "assistant" => Role::Assistant,
                    "system" => Role::System,
                    _ => Role::User,
                };
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(ContentPart::text(text));
                }
                for call in legacy.tool_calls.unwrap_or_default() {
                    match decode_function_tool_call(AdapterKind::StatelessResponses, &call) {
                        Ok(req) => parts.push(ContentPart::ToolCall(req)),
                        Err(e) => warn!(thread = %id, error = %e, "Dropping legacy tool call"),
                    }
                }
                (role, parts)
            }
        };

        let mut msg = Message::new(id.clone(), role, parts);
        msg.seq = messages.len() as u64 + 1;
        if let Some(ts) = parse_time(legacy.timestamp.as_deref()) {
            msg.created_at = ts;
        }
        messages.push(msg);
    }

    let now = Utc::now();
    let created_at = created_at
        .or_else(|| messages.first().map(|m| m.created_at))
        .unwrap_or(now);
    let label = messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.excerpt(super::LABEL_CHARS))
        .unwrap_or_default();

    let thread = Thread {
        id: id.clone(),
        created_at,
        updated_at: updated_at.unwrap_or(created_at),
        provider: ProviderSelection::default(),
        provider_handle: None,
        label,
    };
    (thread, messages)
}
