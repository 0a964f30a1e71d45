use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use super::ContextStore;
use crate::{
    error::{ContextError, ContextResult},
    types::{Chat, ChatMessage, ChatScanRecord, ContextKind, Role, UserContextDoc},
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> ContextResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn context_table(kind: ContextKind) -> (&'static str, &'static str) {
    match kind {
        ContextKind::Preferences => ("user_preferences", "preferences"),
        ContextKind::Facts => ("user_facts", "facts"),
    }
}

fn parse_chat_row(row: PgRow) -> Chat {
    Chat {
        id: row.get("id"),
        user_id: row.get("user_id"),
        agent_id: row.get("agent_id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
    }
}

fn parse_message_row(row: PgRow) -> ContextResult<ChatMessage> {
    let role = row.get::<String, _>("role");
    let Some(role) = Role::parse(&role) else {
        return Err(ContextError::Storage(format!("unknown message role `{role}`")));
    };
    Ok(ChatMessage {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        role,
        content: row.get("content"),
        created_at: row.get("created_at"),
    })
}

fn parse_context_row(row: PgRow) -> UserContextDoc {
    UserContextDoc {
        user_id: row.get("user_id"),
        entries: row
            .get::<Json<HashMap<String, String>>, _>("entries")
            .0,
        last_updated: row.get("last_updated"),
    }
}

#[async_trait]
impl ContextStore for PostgresStore {
    async fn create_chat(&self, chat: &Chat) -> ContextResult<()> {
        sqlx::query(
            "INSERT INTO chats (id, user_id, agent_id, title, created_at) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&chat.id)
        .bind(&chat.user_id)
        .bind(&chat.agent_id)
        .bind(&chat.title)
        .bind(chat.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_chats(&self, user_id: &str) -> ContextResult<Vec<Chat>> {
        let rows = sqlx::query(
            "SELECT id, user_id, agent_id, title, created_at FROM chats WHERE user_id = $1 ORDER BY created_at DESC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(parse_chat_row).collect())
    }

    async fn find_chat(&self, chat_id: &str) -> ContextResult<Option<Chat>> {
        let row = sqlx::query(
            "SELECT id, user_id, agent_id, title, created_at FROM chats WHERE id = $1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_chat_row))
    }

    async fn insert_message(&self, message: &ChatMessage) -> ContextResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, chat_id, role, content, created_at)
            VALUES ($1,$2,$3,$4,$5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> ContextResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, role, content, created_at FROM chat_messages WHERE chat_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_message_row).collect()
    }

    async fn latest_message(&self, chat_id: &str) -> ContextResult<Option<ChatMessage>> {
        let row = sqlx::query(
            "SELECT id, chat_id, role, content, created_at FROM chat_messages WHERE chat_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_message_row).transpose()
    }

    async fn count_messages(&self, chat_id: &str) -> ContextResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM chat_messages WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn messages_after(
        &self,
        chat_id: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> ContextResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, role, content, created_at FROM chat_messages \
             WHERE chat_id = $1 AND created_at > $2 \
             ORDER BY created_at ASC, id ASC LIMIT $3",
        )
        .bind(chat_id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_message_row).collect()
    }

    async fn messages_at(
        &self,
        chat_id: &str,
        at: DateTime<Utc>,
    ) -> ContextResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, role, content, created_at FROM chat_messages \
             WHERE chat_id = $1 AND created_at = $2 ORDER BY id ASC",
        )
        .bind(chat_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_message_row).collect()
    }

    async fn find_scan_record(&self, chat_id: &str) -> ContextResult<Option<ChatScanRecord>> {
        let row = sqlx::query(
            "SELECT chat_id, user_id, last_scanned_at, last_message_timestamp, scan_version, scanned_message_count \
             FROM chat_scan_records WHERE chat_id = $1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ChatScanRecord {
            chat_id: row.get("chat_id"),
            user_id: row.get("user_id"),
            last_scanned_at: row.get("last_scanned_at"),
            last_message_timestamp: row.get("last_message_timestamp"),
            scan_version: row.get("scan_version"),
            scanned_message_count: row.get("scanned_message_count"),
        }))
    }

    async fn upsert_scan_record(&self, record: &ChatScanRecord) -> ContextResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_scan_records (
                chat_id, user_id, last_scanned_at, last_message_timestamp, scan_version, scanned_message_count
            ) VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (chat_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                last_scanned_at = EXCLUDED.last_scanned_at,
                last_message_timestamp = EXCLUDED.last_message_timestamp,
                scan_version = EXCLUDED.scan_version,
                scanned_message_count = EXCLUDED.scanned_message_count,
                updated_at = NOW()
            "#,
        )
        .bind(&record.chat_id)
        .bind(&record.user_id)
        .bind(record.last_scanned_at)
        .bind(record.last_message_timestamp)
        .bind(record.scan_version)
        .bind(record.scanned_message_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_context(
        &self,
        kind: ContextKind,
        user_id: &str,
    ) -> ContextResult<Option<UserContextDoc>> {
        let (table, column) = context_table(kind);
        let row = sqlx::query(&format!(
            "SELECT user_id, {column} AS entries, last_updated FROM {table} WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_context_row))
    }

    async fn set_context_entries(
        &self,
        kind: ContextKind,
        user_id: &str,
        entries: &HashMap<String, String>,
    ) -> ContextResult<usize> {
        let (table, column) = context_table(kind);
        // jsonb `||` keeps existing keys and lets the right-hand side win.
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (user_id, {column}, last_updated)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                {column} = {table}.{column} || EXCLUDED.{column},
                last_updated = EXCLUDED.last_updated,
                updated_at = NOW()
            "#
        ))
        .bind(user_id)
        .bind(Json(entries))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(entries.len())
    }

    async fn delete_context_entries(
        &self,
        kind: ContextKind,
        user_id: &str,
        keys: &[String],
    ) -> ContextResult<usize> {
        let (table, column) = context_table(kind);
        // Count against the locked pre-update document in the same statement.
        let removed = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            UPDATE {table} AS doc SET
                {column} = doc.{column} - $2::text[],
                last_updated = $3,
                updated_at = NOW()
            FROM (
                SELECT user_id, {column} AS entries FROM {table}
                WHERE user_id = $1
                FOR UPDATE
            ) AS prior
            WHERE doc.user_id = prior.user_id
            RETURNING (
                SELECT COUNT(*) FROM unnest($2::text[]) AS key WHERE prior.entries ? key
            )
            "#
        ))
        .bind(user_id)
        .bind(keys)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(removed.unwrap_or(0) as usize)
    }

    async fn list_context_docs(&self, kind: ContextKind) -> ContextResult<Vec<UserContextDoc>> {
        let (table, column) = context_table(kind);
        let rows = sqlx::query(&format!(
            "SELECT user_id, {column} AS entries, last_updated FROM {table} ORDER BY user_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(parse_context_row).collect())
    }
}
