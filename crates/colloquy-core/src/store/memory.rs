use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{page, HistoryStore, NewThread, StoreError, Thread, SCHEMA_VERSION};
use crate::message::{Message, MessageId, ThreadId};

#[derive(Default)]
struct Inner {
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<ThreadId, Vec<Message>>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn create_thread(&self, new: NewThread) -> Result<ThreadId, StoreError> {
        let now = Utc::now();
        let id = ThreadId::generate();
        let thread = Thread {
            id: id.clone(),
            created_at: now,
            updated_at: now,
            provider: new.provider,
            provider_handle: None,
            label: new.label,
        };
        let mut inner = self.inner.write().await;
        inner.threads.insert(id.clone(), thread);
        inner.messages.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn append(&self, thread: &ThreadId, mut message: Message) -> Result<MessageId, StoreError> {
        let mut inner = self.inner.write().await;
        let log = inner
            .messages
            .get_mut(thread)
            .ok_or_else(|| StoreError::ThreadNotFound(thread.clone()))?;
        message.seq = log.last().map_or(1, |m| m.seq + 1);
        message.thread_id = thread.clone();
        let id = message.id.clone();
        log.push(message);
        Ok(id)
    }

    async fn list_messages(
        &self,
        thread: &ThreadId,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let log = inner
            .messages
            .get(thread)
            .ok_or_else(|| StoreError::ThreadNotFound(thread.clone()))?;
        Ok(page(log, before, limit))
    }

    async fn get_thread(&self, thread: &ThreadId) -> Result<Option<Thread>, StoreError> {
        Ok(self.inner.read().await.threads.get(thread).cloned())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, StoreError> {
        let mut threads: Vec<Thread> = self.inner.read().await.threads.values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    async fn delete_thread(&self, thread: &ThreadId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        inner.messages.remove(thread);
        Ok(inner.threads.remove(thread).is_some())
    }

    async fn update_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.threads.get_mut(&thread.id) {
            Some(existing) => {
                *existing = thread.clone();
                Ok(())
            }
            None => Err(StoreError::ThreadNotFound(thread.id.clone())),
        }
    }

    async fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(SCHEMA_VERSION)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
