//! Durable thread and message persistence.
//!
//! [`HistoryStore`] is the contract the orchestrator relies on. Two
//! implementations ship: [`InMemoryStore`] for tests and throwaway sessions,
//! and [`JsonlStore`], which keeps one append-only JSONL log per thread.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{excerpt, Message, MessageId, ThreadId};
use crate::provider::ProviderSelection;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Maximum label length derived from the first prompt.
pub const LABEL_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record in {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
}

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: ThreadId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider: ProviderSelection,
    /// Server-side handle for stateful providers, created lazily.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_handle: Option<String>,
    #[serde(default)]
    pub label: String,
}

/// Parameters for creating a thread.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub provider: ProviderSelection,
    pub label: String,
}

impl NewThread {
    /// Label taken from the opening prompt.
    pub fn from_prompt(provider: ProviderSelection, prompt: &str) -> Self {
        Self {
            provider,
            label: excerpt(prompt, LABEL_CHARS),
        }
    }
}

/// Persistence contract for threads and their messages.
///
/// Appends are atomic per call and serialized per thread. A reader always
/// observes a prefix of the append order.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_thread(&self, new: NewThread) -> Result<ThreadId, StoreError>;

    /// Append a message; the store assigns its sequence position.
    async fn append(&self, thread: &ThreadId, message: Message) -> Result<MessageId, StoreError>;

    /// Up to `limit` messages with `seq < before`, most recent page first
    /// selected, returned oldest first.
    async fn list_messages(
        &self,
        thread: &ThreadId,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError>;

    async fn get_thread(&self, thread: &ThreadId) -> Result<Option<Thread>, StoreError>;

    /// All threads, most recently updated first.
    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError>;

    /// Returns whether the thread existed.
    async fn delete_thread(&self, thread: &ThreadId) -> Result<bool, StoreError>;

    /// Persist label, provider association, handle and `updated_at`.
    async fn update_thread(&self, thread: &Thread) -> Result<(), StoreError>;

    async fn schema_version(&self) -> Result<u32, StoreError>;

    /// Bring stored data up to [`SCHEMA_VERSION`]. Idempotent.
    async fn migrate(&self) -> Result<(), StoreError>;
}

/// Select the page described by `before` / `limit` from an ordered slice.
pub(crate) fn page(messages: &[Message], before: Option<u64>, limit: Option<usize>) -> Vec<Message> {
    let end = match before {
        Some(b) => messages.partition_point(|m| m.seq < b),
        None => messages.len(),
    };
    let start = limit.map_or(0, |l| end.saturating_sub(l));
    messages[start..end].to_vec()
}
