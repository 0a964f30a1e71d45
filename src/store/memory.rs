use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::ContextStore;
use crate::{
    error::ContextResult,
    types::{Chat, ChatMessage, ChatScanRecord, ContextKind, UserContextDoc},
};

#[derive(Default)]
struct MemoryState {
    chats: HashMap<String, Chat>,
    messages: HashMap<String, Vec<ChatMessage>>,
    scan_records: HashMap<String, ChatScanRecord>,
    context: HashMap<(ContextKind, String), UserContextDoc>,
}

/// Process-local store, used for development runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn create_chat(&self, chat: &Chat) -> ContextResult<()> {
        let mut state = self.state.write().await;
        state.chats.insert(chat.id.clone(), chat.clone());
        state.messages.entry(chat.id.clone()).or_default();
        Ok(())
    }

    async fn list_chats(&self, user_id: &str) -> ContextResult<Vec<Chat>> {
        let state = self.state.read().await;
        let mut chats = state
            .chats
            .values()
            .filter(|chat| chat.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(chats)
    }

    async fn find_chat(&self, chat_id: &str) -> ContextResult<Option<Chat>> {
        Ok(self.state.read().await.chats.get(chat_id).cloned())
    }

    async fn insert_message(&self, message: &ChatMessage) -> ContextResult<()> {
        let mut state = self.state.write().await;
        let messages = state.messages.entry(message.chat_id.clone()).or_default();
        if messages.iter().any(|existing| existing.id == message.id) {
            return Ok(());
        }
        messages.push(message.clone());
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> ContextResult<Vec<ChatMessage>> {
        let state = self.state.read().await;
        Ok(state.messages.get(chat_id).cloned().unwrap_or_default())
    }

    async fn latest_message(&self, chat_id: &str) -> ContextResult<Option<ChatMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(chat_id)
            .and_then(|messages| messages.last())
            .cloned())
    }

    async fn count_messages(&self, chat_id: &str) -> ContextResult<i64> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(chat_id)
            .map(|messages| messages.len() as i64)
            .unwrap_or(0))
    }

    async fn messages_after(
        &self,
        chat_id: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> ContextResult<Vec<ChatMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(chat_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| message.created_at > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn messages_at(
        &self,
        chat_id: &str,
        at: DateTime<Utc>,
    ) -> ContextResult<Vec<ChatMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(chat_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| message.created_at == at)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_scan_record(&self, chat_id: &str) -> ContextResult<Option<ChatScanRecord>> {
        Ok(self.state.read().await.scan_records.get(chat_id).cloned())
    }

    async fn upsert_scan_record(&self, record: &ChatScanRecord) -> ContextResult<()> {
        let mut state = self.state.write().await;
        state
            .scan_records
            .insert(record.chat_id.clone(), record.clone());
        Ok(())
    }

    async fn load_context(
        &self,
        kind: ContextKind,
        user_id: &str,
    ) -> ContextResult<Option<UserContextDoc>> {
        let state = self.state.read().await;
        Ok(state.context.get(&(kind, user_id.to_string())).cloned())
    }

    async fn set_context_entries(
        &self,
        kind: ContextKind,
        user_id: &str,
        entries: &HashMap<String, String>,
    ) -> ContextResult<usize> {
        let mut state = self.state.write().await;
        let doc = state
            .context
            .entry((kind, user_id.to_string()))
            .or_insert_with(|| UserContextDoc {
                user_id: user_id.to_string(),
                entries: HashMap::new(),
                last_updated: Utc::now(),
            });
        for (key, value) in entries {
            doc.entries.insert(key.clone(), value.clone());
        }
        doc.last_updated = Utc::now();
        Ok(entries.len())
    }

    async fn delete_context_entries(
        &self,
        kind: ContextKind,
        user_id: &str,
        keys: &[String],
    ) -> ContextResult<usize> {
        let mut state = self.state.write().await;
        let Some(doc) = state.context.get_mut(&(kind, user_id.to_string())) else {
            return Ok(0);
        };
        let removed = keys
            .iter()
            .filter(|key| doc.entries.remove(key.as_str()).is_some())
            .count();
        doc.last_updated = Utc::now();
        Ok(removed)
    }

    async fn list_context_docs(&self, kind: ContextKind) -> ContextResult<Vec<UserContextDoc>> {
        let state = self.state.read().await;
        let mut docs = state
            .context
            .iter()
            .filter(|((doc_kind, _), _)| *doc_kind == kind)
            .map(|(_, doc)| doc.clone())
            .collect::<Vec<_>>();
        docs.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(docs)
    }
}
