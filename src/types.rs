use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::Config, scan_queue::ScanQueue, store::ContextStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Only `user` and `assistant` are accepted (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("user") {
            Some(Role::User)
        } else if value.eq_ignore_ascii_case("assistant") {
            Some(Role::Assistant)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Bookkeeping for how far a chat's history has been scanned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatScanRecord {
    pub chat_id: String,
    pub user_id: String,
    pub last_scanned_at: DateTime<Utc>,
    pub last_message_timestamp: DateTime<Utc>,
    pub scan_version: i64,
    pub scanned_message_count: i64,
}

impl ChatScanRecord {
    /// Record used for a chat that has never been scanned.
    pub fn unscanned(chat_id: &str, user_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            last_scanned_at: epoch(),
            last_message_timestamp: epoch(),
            scan_version: 1,
            scanned_message_count: 0,
        }
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Preferences,
    Facts,
}

impl ContextKind {
    pub fn label(self) -> &'static str {
        match self {
            ContextKind::Preferences => "preferences",
            ContextKind::Facts => "facts",
        }
    }
}

/// Per-user key/value document; one for preferences and one for facts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContextDoc {
    pub user_id: String,
    pub entries: HashMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scanned_chats: usize,
    pub new_preferences: usize,
    pub new_facts: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub preferences: HashMap<String, String>,
    pub facts: HashMap<String, String>,
    pub last_updated: ContextTimestamps,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextTimestamps {
    pub preferences: Option<DateTime<Utc>>,
    pub facts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextCounts {
    pub preferences: usize,
    pub facts: usize,
}

pub struct AppState {
    pub store: Arc<dyn ContextStore>,
    pub scans: ScanQueue,
    pub config: Config,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub role: Option<String>,
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContextBody {
    #[serde(default)]
    pub preferences: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub facts: Option<HashMap<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteContextQuery {
    #[serde(default)]
    pub preferences: Option<String>,
    #[serde(default)]
    pub facts: Option<String>,
}
