//! Persistence seam for chats, messages, scan records and user context
//! documents.
mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::ContextResult,
    types::{Chat, ChatMessage, ChatScanRecord, ContextKind, UserContextDoc},
};

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn create_chat(&self, chat: &Chat) -> ContextResult<()>;
    /// Newest first.
    async fn list_chats(&self, user_id: &str) -> ContextResult<Vec<Chat>>;
    async fn find_chat(&self, chat_id: &str) -> ContextResult<Option<Chat>>;

    async fn insert_message(&self, message: &ChatMessage) -> ContextResult<()>;
    /// Oldest first.
    async fn list_messages(&self, chat_id: &str) -> ContextResult<Vec<ChatMessage>>;
    async fn latest_message(&self, chat_id: &str) -> ContextResult<Option<ChatMessage>>;
    async fn count_messages(&self, chat_id: &str) -> ContextResult<i64>;
    /// Messages strictly newer than `after`, ordered by `(created_at, id)`,
    /// at most `limit`.
    async fn messages_after(
        &self,
        chat_id: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> ContextResult<Vec<ChatMessage>>;
    /// Every message created exactly at `at`, ordered by id.
    async fn messages_at(
        &self,
        chat_id: &str,
        at: DateTime<Utc>,
    ) -> ContextResult<Vec<ChatMessage>>;

    async fn find_scan_record(&self, chat_id: &str) -> ContextResult<Option<ChatScanRecord>>;
    async fn upsert_scan_record(&self, record: &ChatScanRecord) -> ContextResult<()>;

    async fn load_context(
        &self,
        kind: ContextKind,
        user_id: &str,
    ) -> ContextResult<Option<UserContextDoc>>;
    /// Sets every entry (last write wins), creating the document when
    /// missing. Returns the number of keys written.
    async fn set_context_entries(
        &self,
        kind: ContextKind,
        user_id: &str,
        entries: &HashMap<String, String>,
    ) -> ContextResult<usize>;
    /// Removes the given keys. Returns how many were actually present.
    async fn delete_context_entries(
        &self,
        kind: ContextKind,
        user_id: &str,
        keys: &[String],
    ) -> ContextResult<usize>;
    async fn list_context_docs(&self, kind: ContextKind) -> ContextResult<Vec<UserContextDoc>>;
}
