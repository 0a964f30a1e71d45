//! Incremental scanning of chat history for user preferences and facts.
//!
//! Each chat carries a [`ChatScanRecord`]. A scan reads at most one batch of
//! messages newer than the record's `last_message_timestamp`, asks the LLM to
//! pull structured preferences/facts out of the user-authored text, writes
//! them into the per-user documents and advances the record.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::{
    error::ContextResult,
    llm::CompletionClient,
    prompting::render_extraction_system_prompt,
    store::ContextStore,
    types::{ChatMessage, ChatScanRecord, ContextKind, Role, ScanSummary},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFact {
    pub category: Option<String>,
    pub key: String,
    pub value: String,
}

impl ExtractedFact {
    /// `{category}_{key}` when categorized.
    pub fn storage_key(&self) -> String {
        match &self.category {
            Some(category) => format!("{category}_{}", self.key),
            None => self.key.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub preferences: HashMap<String, String>,
    pub facts: Vec<ExtractedFact>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty() && self.facts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ScanCheck {
    pub needs_scan: bool,
    pub record: ChatScanRecord,
    /// False when `record` was synthesized for a never-scanned chat.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatScanOutcome {
    pub scanned_messages: usize,
    pub new_preferences: usize,
    pub new_facts: usize,
}

pub async fn check_scan_eligibility(
    store: &dyn ContextStore,
    chat_id: &str,
    user_id: &str,
    force_scan: bool,
) -> ContextResult<ScanCheck> {
    let Some(record) = store.find_scan_record(chat_id).await? else {
        return Ok(ScanCheck {
            needs_scan: true,
            record: ChatScanRecord::unscanned(chat_id, user_id),
            persisted: false,
        });
    };

    if force_scan {
        return Ok(ScanCheck {
            needs_scan: true,
            record,
            persisted: true,
        });
    }

    let Some(latest) = store.latest_message(chat_id).await? else {
        return Ok(ScanCheck {
            needs_scan: false,
            record,
            persisted: true,
        });
    };

    let message_count = store.count_messages(chat_id).await?;
    let has_new_messages = latest.created_at > record.last_message_timestamp;
    let has_more_messages = message_count > record.scanned_message_count;

    Ok(ScanCheck {
        needs_scan: has_new_messages || has_more_messages,
        record,
        persisted: true,
    })
}

/// Messages newer than the record's cursor, oldest first. A full batch is
/// extended with every message sharing its last timestamp, since the cursor
/// cannot point between equal timestamps.
pub async fn load_scan_batch(
    store: &dyn ContextStore,
    record: &ChatScanRecord,
    batch_size: usize,
) -> ContextResult<Vec<ChatMessage>> {
    let mut batch = store
        .messages_after(&record.chat_id, record.last_message_timestamp, batch_size)
        .await?;
    if batch.len() < batch_size {
        return Ok(batch);
    }
    let Some(last) = batch.last().map(|message| message.created_at) else {
        return Ok(batch);
    };
    for message in store.messages_at(&record.chat_id, last).await? {
        if !batch.iter().any(|existing| existing.id == message.id) {
            batch.push(message);
        }
    }
    Ok(batch)
}

fn user_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|message| message.role == Role::User)
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Runs the extraction prompt over the user-authored part of `messages`.
/// Any LLM or parse failure yields an empty extraction.
pub async fn extract_user_context(
    llm: &dyn CompletionClient,
    messages: &[ChatMessage],
) -> Extraction {
    let transcript = user_transcript(messages);
    if transcript.trim().is_empty() {
        debug!(messages = messages.len(), "no user messages to extract from");
        return Extraction::default();
    }

    debug!(
        messages = messages.len(),
        chars = transcript.len(),
        "extracting user context"
    );
    match llm
        .complete(render_extraction_system_prompt(), &transcript)
        .await
    {
        Ok(raw) => {
            debug!(raw = %raw, "extraction response");
            parse_extraction(&raw)
        }
        Err(err) => {
            warn!(error = %err, "context extraction request failed");
            Extraction::default()
        }
    }
}

static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("json object regex is valid"));

fn json_object_span(raw: &str) -> Option<&str> {
    JSON_OBJECT_RE.find(raw).map(|m| m.as_str())
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_preferences(raw: Option<&Map<String, Value>>) -> HashMap<String, String> {
    let mut preferences = HashMap::new();
    for (key, value) in raw.into_iter().flatten() {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if let Some(text) = scalar_text(value) {
            preferences.insert(key.to_string(), text);
        }
    }
    preferences
}

fn parse_facts(raw: Option<&Map<String, Value>>) -> Vec<ExtractedFact> {
    let mut facts = Vec::new();
    for (category, value) in raw.into_iter().flatten() {
        let category = category.trim();
        if category.is_empty() {
            continue;
        }
        match value {
            Value::Object(entries) => {
                for (key, value) in entries {
                    let key = key.trim();
                    let Some(text) = scalar_text(value) else {
                        continue;
                    };
                    if key.is_empty() {
                        continue;
                    }
                    facts.push(ExtractedFact {
                        category: Some(category.to_string()),
                        key: key.to_string(),
                        value: text,
                    });
                }
            }
            // A flat `"name": "X"` under facts is kept without a category.
            other => {
                if let Some(text) = scalar_text(other) {
                    facts.push(ExtractedFact {
                        category: None,
                        key: category.to_string(),
                        value: text,
                    });
                }
            }
        }
    }
    facts.sort_by_key(ExtractedFact::storage_key);
    facts
}

/// Parses the first `{ ... }` span of an LLM reply. Tolerates prose and code
/// fences around the object.
pub fn parse_extraction(raw: &str) -> Extraction {
    let Some(span) = json_object_span(raw) else {
        warn!("no JSON object found in extraction response");
        return Extraction::default();
    };
    let parsed = match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(parsed)) => parsed,
        Ok(_) => return Extraction::default(),
        Err(err) => {
            warn!(error = %err, "failed to parse extraction response");
            return Extraction::default();
        }
    };

    Extraction {
        preferences: parse_preferences(parsed.get("preferences").and_then(Value::as_object)),
        facts: parse_facts(parsed.get("facts").and_then(Value::as_object)),
    }
}

pub async fn save_preferences(
    store: &dyn ContextStore,
    user_id: &str,
    preferences: &HashMap<String, String>,
) -> usize {
    if preferences.is_empty() {
        return 0;
    }
    match store
        .set_context_entries(ContextKind::Preferences, user_id, preferences)
        .await
    {
        Ok(count) => count,
        Err(err) => {
            error!(user_id, error = %err, "failed to save preferences");
            0
        }
    }
}

pub async fn save_facts(store: &dyn ContextStore, user_id: &str, facts: &[ExtractedFact]) -> usize {
    if facts.is_empty() {
        return 0;
    }
    let entries = facts
        .iter()
        .map(|fact| (fact.storage_key(), fact.value.clone()))
        .collect::<HashMap<_, _>>();
    match store
        .set_context_entries(ContextKind::Facts, user_id, &entries)
        .await
    {
        Ok(count) => count,
        Err(err) => {
            error!(user_id, error = %err, "failed to save facts");
            0
        }
    }
}

/// Advances `record` past `batch`. Fresh records start at version 1.
pub fn advance_scan_record(
    record: &ChatScanRecord,
    persisted: bool,
    batch: &[ChatMessage],
) -> Option<ChatScanRecord> {
    let last = batch.last()?;
    let mut next = record.clone();
    next.last_scanned_at = Utc::now();
    next.last_message_timestamp = last.created_at;
    if persisted {
        next.scanned_message_count += batch.len() as i64;
        next.scan_version += 1;
    } else {
        next.scanned_message_count = batch.len() as i64;
        next.scan_version = 1;
    }
    Some(next)
}

pub async fn update_scan_record(
    store: &dyn ContextStore,
    check: &ScanCheck,
    batch: &[ChatMessage],
) -> ContextResult<()> {
    let Some(next) = advance_scan_record(&check.record, check.persisted, batch) else {
        return Ok(());
    };
    store.upsert_scan_record(&next).await
}

/// Drives eligibility → batch → extraction → persistence for a user's chats.
#[derive(Clone)]
pub struct ContextScanner {
    store: Arc<dyn ContextStore>,
    llm: Arc<dyn CompletionClient>,
    batch_size: usize,
}

impl ContextScanner {
    pub fn new(
        store: Arc<dyn ContextStore>,
        llm: Arc<dyn CompletionClient>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            llm,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn scan_chat(&self, check: &ScanCheck) -> ContextResult<ChatScanOutcome> {
        let store = self.store.as_ref();
        let batch = load_scan_batch(store, &check.record, self.batch_size).await?;
        if batch.is_empty() {
            // Persist the epoch record so an empty chat stops being eligible.
            if !check.persisted {
                store.upsert_scan_record(&check.record).await?;
            }
            return Ok(ChatScanOutcome::default());
        }

        let extraction = extract_user_context(self.llm.as_ref(), &batch).await;
        let user_id = check.record.user_id.as_str();
        let new_preferences = save_preferences(store, user_id, &extraction.preferences).await;
        let new_facts = save_facts(store, user_id, &extraction.facts).await;

        update_scan_record(store, check, &batch).await?;

        Ok(ChatScanOutcome {
            scanned_messages: batch.len(),
            new_preferences,
            new_facts,
        })
    }

    /// Scans every eligible chat of `user_id`, one at a time. A chat whose
    /// storage calls fail is logged and skipped; the rest still run.
    pub async fn scan_user_chats(
        &self,
        user_id: &str,
        force_scan: bool,
    ) -> ContextResult<ScanSummary> {
        let chats = self.store.list_chats(user_id).await?;
        let mut summary = ScanSummary::default();
        if chats.is_empty() {
            return Ok(summary);
        }

        for chat in &chats {
            let check =
                match check_scan_eligibility(self.store.as_ref(), &chat.id, user_id, force_scan)
                    .await
                {
                    Ok(check) => check,
                    Err(err) => {
                        warn!(
                            user_id,
                            chat_id = %chat.id,
                            error = %err,
                            "scan eligibility check failed"
                        );
                        continue;
                    }
                };
            if !check.needs_scan {
                continue;
            }

            match self.scan_chat(&check).await {
                Ok(outcome) => {
                    debug!(
                        user_id,
                        chat_id = %chat.id,
                        messages = outcome.scanned_messages,
                        preferences = outcome.new_preferences,
                        facts = outcome.new_facts,
                        "chat scanned"
                    );
                    summary.scanned_chats += 1;
                    summary.new_preferences += outcome.new_preferences;
                    summary.new_facts += outcome.new_facts;
                }
                Err(err) => {
                    warn!(user_id, chat_id = %chat.id, error = %err, "chat scan failed");
                }
            }
        }

        info!(
            user_id,
            chats = chats.len(),
            scanned = summary.scanned_chats,
            new_preferences = summary.new_preferences,
            new_facts = summary.new_facts,
            "user context scan finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        error::ContextError,
        store::MemoryStore,
        types::{Chat, UserContextDoc},
    };

    #[derive(Default)]
    struct ScriptedLlm {
        replies: Mutex<VecDeque<ContextResult<String>>>,
        calls: AtomicUsize,
        transcripts: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn replying(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedLlm {
        async fn complete(&self, _system: &str, user: &str) -> ContextResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.transcripts.lock().await.push(user.to_string());
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    async fn seed_chat(store: &MemoryStore, chat_id: &str, user_id: &str, roles: &[Role]) {
        store
            .create_chat(&Chat {
                id: chat_id.to_string(),
                user_id: user_id.to_string(),
                agent_id: None,
                title: chat_id.to_string(),
                created_at: at(0),
            })
            .await
            .unwrap();
        for (index, role) in roles.iter().enumerate() {
            store
                .insert_message(&ChatMessage {
                    id: format!("{chat_id}-{index}"),
                    chat_id: chat_id.to_string(),
                    role: *role,
                    content: format!("{} message {index}", role.as_str()),
                    created_at: at(index as i64 + 1),
                })
                .await
                .unwrap();
        }
    }

    fn scanner(store: Arc<MemoryStore>, llm: Arc<ScriptedLlm>) -> ContextScanner {
        ContextScanner::new(store, llm, 20)
    }

    #[tokio::test]
    async fn unscanned_chat_is_eligible() {
        let store = MemoryStore::new();
        seed_chat(&store, "c1", "u1", &[Role::User]).await;

        let check = check_scan_eligibility(&store, "c1", "u1", false).await.unwrap();
        assert!(check.needs_scan);
        assert!(!check.persisted);
        assert_eq!(check.record, ChatScanRecord::unscanned("c1", "u1"));
    }

    #[tokio::test]
    async fn caught_up_chat_is_not_eligible_unless_forced() {
        let store = MemoryStore::new();
        seed_chat(&store, "c1", "u1", &[Role::User, Role::Assistant]).await;
        store
            .upsert_scan_record(&ChatScanRecord {
                chat_id: "c1".to_string(),
                user_id: "u1".to_string(),
                last_scanned_at: at(10),
                last_message_timestamp: at(2),
                scan_version: 2,
                scanned_message_count: 2,
            })
            .await
            .unwrap();

        let check = check_scan_eligibility(&store, "c1", "u1", false).await.unwrap();
        assert!(!check.needs_scan);
        let forced = check_scan_eligibility(&store, "c1", "u1", true).await.unwrap();
        assert!(forced.needs_scan);
        assert!(forced.persisted);
    }

    #[tokio::test]
    async fn newer_message_or_higher_count_makes_chat_eligible() {
        let store = MemoryStore::new();
        seed_chat(&store, "c1", "u1", &[Role::User, Role::User, Role::User]).await;
        let mut record = ChatScanRecord {
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
            last_scanned_at: at(10),
            last_message_timestamp: at(2),
            scan_version: 1,
            scanned_message_count: 3,
        };
        store.upsert_scan_record(&record).await.unwrap();
        assert!(check_scan_eligibility(&store, "c1", "u1", false)
            .await
            .unwrap()
            .needs_scan);

        record.last_message_timestamp = at(3);
        record.scanned_message_count = 2;
        store.upsert_scan_record(&record).await.unwrap();
        assert!(check_scan_eligibility(&store, "c1", "u1", false)
            .await
            .unwrap()
            .needs_scan);
    }

    #[tokio::test]
    async fn recorded_chat_without_messages_is_not_eligible() {
        let store = MemoryStore::new();
        seed_chat(&store, "c1", "u1", &[]).await;
        store
            .upsert_scan_record(&ChatScanRecord::unscanned("c1", "u1"))
            .await
            .unwrap();
        let check = check_scan_eligibility(&store, "c1", "u1", false).await.unwrap();
        assert!(!check.needs_scan);
    }

    #[tokio::test]
    async fn assistant_only_batch_extracts_nothing_without_calling_llm() {
        let llm = ScriptedLlm::replying(&[r#"{"preferences":{"a":"b"}}"#]);
        let batch = vec![ChatMessage {
            id: "m1".to_string(),
            chat_id: "c1".to_string(),
            role: Role::Assistant,
            content: "How can I help?".to_string(),
            created_at: at(1),
        }];
        let extraction = extract_user_context(&llm, &batch).await;
        assert!(extraction.preferences.is_empty());
        assert!(extraction.facts.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_empty_extraction() {
        let llm = ScriptedLlm {
            replies: Mutex::new(VecDeque::from([Err(ContextError::LlmEmpty)])),
            ..ScriptedLlm::default()
        };
        let batch = vec![ChatMessage {
            id: "m1".to_string(),
            chat_id: "c1".to_string(),
            role: Role::User,
            content: "I'm Ada".to_string(),
            created_at: at(1),
        }];
        assert!(extract_user_context(&llm, &batch).await.is_empty());
        assert_eq!(llm.calls(), 1);
    }

    #[test]
    fn parses_object_wrapped_in_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"preferences\": {\"a\": \"b\"}, \"facts\": {\"personal\": {\"name\": \"X\"}}}\n```\nLet me know.";
        let extraction = parse_extraction(raw);
        assert_eq!(extraction.preferences.get("a").map(String::as_str), Some("b"));
        assert_eq!(
            extraction.facts,
            vec![ExtractedFact {
                category: Some("personal".to_string()),
                key: "name".to_string(),
                value: "X".to_string(),
            }]
        );
        assert_eq!(extraction.facts[0].storage_key(), "personal_name");
    }

    #[test]
    fn malformed_or_missing_json_is_empty() {
        assert!(parse_extraction("no json here").is_empty());
        assert!(parse_extraction("{\"preferences\": {\"a\": }").is_empty());
        assert!(parse_extraction("{}").is_empty());
    }

    #[test]
    fn scalar_values_are_stringified_and_blanks_dropped() {
        let extraction = parse_extraction(
            r#"{"preferences":{"max_items":5,"empty":"","nothing":null},"facts":{"age":42,"other":{"pets":"two cats"}}}"#,
        );
        assert_eq!(extraction.preferences.len(), 1);
        assert_eq!(
            extraction.preferences.get("max_items").map(String::as_str),
            Some("5")
        );
        let keys = extraction
            .facts
            .iter()
            .map(ExtractedFact::storage_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["age", "other_pets"]);
    }

    #[test]
    fn advancing_a_fresh_record_starts_at_version_one() {
        let record = ChatScanRecord::unscanned("c1", "u1");
        let batch = (0..3)
            .map(|i| ChatMessage {
                id: format!("m{i}"),
                chat_id: "c1".to_string(),
                role: Role::User,
                content: "hi".to_string(),
                created_at: at(i),
            })
            .collect::<Vec<_>>();

        let fresh = advance_scan_record(&record, false, &batch).unwrap();
        assert_eq!(fresh.scan_version, 1);
        assert_eq!(fresh.scanned_message_count, 3);
        assert_eq!(fresh.last_message_timestamp, at(2));

        let next = advance_scan_record(&fresh, true, &batch[..1]).unwrap();
        assert_eq!(next.scan_version, 2);
        assert_eq!(next.scanned_message_count, 4);
        assert!(advance_scan_record(&fresh, true, &[]).is_none());
    }

    #[tokio::test]
    async fn end_to_end_scan_then_noop_rescan() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(
            &store,
            "c1",
            "u1",
            &[Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User],
        )
        .await;
        let llm = Arc::new(ScriptedLlm::replying(&[
            r#"{"preferences":{"tone":"casual"},"facts":{}}"#,
        ]));
        let scanner = scanner(store.clone(), llm.clone());

        let first = scanner.scan_user_chats("u1", false).await.unwrap();
        assert_eq!(
            first,
            ScanSummary {
                scanned_chats: 1,
                new_preferences: 1,
                new_facts: 0
            }
        );
        let record = store.find_scan_record("c1").await.unwrap().unwrap();
        assert_eq!(record.scanned_message_count, 5);
        assert_eq!(record.scan_version, 1);
        assert_eq!(record.last_message_timestamp, at(5));

        let prefs = store
            .load_context(ContextKind::Preferences, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prefs.entries.get("tone").map(String::as_str), Some("casual"));

        let second = scanner.scan_user_chats("u1", false).await.unwrap();
        assert_eq!(second, ScanSummary::default());
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn facts_are_stored_under_category_prefixed_keys() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(&store, "c1", "u1", &[Role::User]).await;
        let llm = Arc::new(ScriptedLlm::replying(&[
            r#"{"preferences": {"a": "b"}, "facts": {"personal": {"name": "X"}}}"#,
        ]));

        let summary = scanner(store.clone(), llm)
            .scan_user_chats("u1", false)
            .await
            .unwrap();
        assert_eq!(summary.new_preferences, 1);
        assert_eq!(summary.new_facts, 1);

        let facts = store
            .load_context(ContextKind::Facts, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(facts.entries.get("personal_name").map(String::as_str), Some("X"));
        let prefs = store
            .load_context(ContextKind::Preferences, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prefs.entries.get("a").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn long_history_is_scanned_one_batch_per_pass() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(&store, "c1", "u1", &[Role::User; 5]).await;
        let llm = Arc::new(ScriptedLlm::default());
        let scanner = ContextScanner::new(store.clone(), llm, 2);

        for expected in [2, 4] {
            let summary = scanner.scan_user_chats("u1", false).await.unwrap();
            assert_eq!(summary.scanned_chats, 1);
            let record = store.find_scan_record("c1").await.unwrap().unwrap();
            assert_eq!(record.scanned_message_count, expected);
        }
        scanner.scan_user_chats("u1", false).await.unwrap();
        let record = store.find_scan_record("c1").await.unwrap().unwrap();
        assert_eq!(record.scanned_message_count, 5);
        assert_eq!(record.scan_version, 3);
        assert_eq!(
            scanner.scan_user_chats("u1", false).await.unwrap().scanned_chats,
            0
        );
    }

    #[tokio::test]
    async fn forced_scan_counts_chat_even_without_new_messages() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(&store, "c1", "u1", &[Role::User]).await;
        let llm = Arc::new(ScriptedLlm::default());
        let scanner = scanner(store.clone(), llm.clone());
        scanner.scan_user_chats("u1", false).await.unwrap();

        let forced = scanner.scan_user_chats("u1", true).await.unwrap();
        assert_eq!(forced.scanned_chats, 1);
        assert_eq!(forced.new_preferences, 0);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn empty_chat_is_scanned_once_then_left_alone() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(&store, "c1", "u1", &[]).await;
        let llm = Arc::new(ScriptedLlm::default());
        let scanner = scanner(store.clone(), llm.clone());

        let first = scanner.scan_user_chats("u1", false).await.unwrap();
        assert_eq!(first.scanned_chats, 1);
        assert_eq!(
            store.find_scan_record("c1").await.unwrap(),
            Some(ChatScanRecord::unscanned("c1", "u1"))
        );

        let second = scanner.scan_user_chats("u1", false).await.unwrap();
        assert_eq!(second, ScanSummary::default());
        assert_eq!(llm.calls(), 0);

        store
            .insert_message(&ChatMessage {
                id: "c1-late".to_string(),
                chat_id: "c1".to_string(),
                role: Role::User,
                content: "finally saying something".to_string(),
                created_at: at(30),
            })
            .await
            .unwrap();
        let third = scanner.scan_user_chats("u1", false).await.unwrap();
        assert_eq!(third.scanned_chats, 1);
        assert_eq!(llm.calls(), 1);
        let record = store.find_scan_record("c1").await.unwrap().unwrap();
        assert_eq!(record.scanned_message_count, 1);
        assert_eq!(record.last_message_timestamp, at(30));
    }

    #[tokio::test]
    async fn messages_sharing_a_timestamp_land_in_one_batch() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(&store, "c1", "u1", &[]).await;
        for id in ["m0", "m1", "m2"] {
            store
                .insert_message(&ChatMessage {
                    id: id.to_string(),
                    chat_id: "c1".to_string(),
                    role: Role::User,
                    content: format!("said {id}"),
                    created_at: at(7),
                })
                .await
                .unwrap();
        }
        let llm = Arc::new(ScriptedLlm::default());
        let scanner = ContextScanner::new(store.clone(), llm.clone(), 2);

        let first = scanner.scan_user_chats("u1", false).await.unwrap();
        assert_eq!(first.scanned_chats, 1);
        let record = store.find_scan_record("c1").await.unwrap().unwrap();
        assert_eq!(record.scanned_message_count, 3);
        assert_eq!(record.last_message_timestamp, at(7));

        let transcripts = llm.transcripts.lock().await.clone();
        assert_eq!(transcripts, vec!["said m0\n\nsaid m1\n\nsaid m2".to_string()]);

        for _ in 0..3 {
            let again = scanner.scan_user_chats("u1", false).await.unwrap();
            assert_eq!(again, ScanSummary::default());
        }
        assert_eq!(llm.calls(), 1);
    }

    /// Delegates to a [`MemoryStore`] but fails every scan-record lookup for
    /// one chat.
    struct FailingChatStore {
        inner: MemoryStore,
        failing_chat: String,
    }

    #[async_trait]
    impl ContextStore for FailingChatStore {
        async fn create_chat(&self, chat: &Chat) -> ContextResult<()> {
            self.inner.create_chat(chat).await
        }
        async fn list_chats(&self, user_id: &str) -> ContextResult<Vec<Chat>> {
            self.inner.list_chats(user_id).await
        }
        async fn find_chat(&self, chat_id: &str) -> ContextResult<Option<Chat>> {
            self.inner.find_chat(chat_id).await
        }
        async fn insert_message(&self, message: &ChatMessage) -> ContextResult<()> {
            self.inner.insert_message(message).await
        }
        async fn list_messages(&self, chat_id: &str) -> ContextResult<Vec<ChatMessage>> {
            self.inner.list_messages(chat_id).await
        }
        async fn latest_message(&self, chat_id: &str) -> ContextResult<Option<ChatMessage>> {
            self.inner.latest_message(chat_id).await
        }
        async fn count_messages(&self, chat_id: &str) -> ContextResult<i64> {
            self.inner.count_messages(chat_id).await
        }
        async fn messages_after(
            &self,
            chat_id: &str,
            after: DateTime<Utc>,
            limit: usize,
        ) -> ContextResult<Vec<ChatMessage>> {
            self.inner.messages_after(chat_id, after, limit).await
        }
        async fn messages_at(
            &self,
            chat_id: &str,
            at: DateTime<Utc>,
        ) -> ContextResult<Vec<ChatMessage>> {
            self.inner.messages_at(chat_id, at).await
        }
        async fn find_scan_record(&self, chat_id: &str) -> ContextResult<Option<ChatScanRecord>> {
            if chat_id == self.failing_chat {
                return Err(ContextError::Storage("connection reset".to_string()));
            }
            self.inner.find_scan_record(chat_id).await
        }
        async fn upsert_scan_record(&self, record: &ChatScanRecord) -> ContextResult<()> {
            self.inner.upsert_scan_record(record).await
        }
        async fn load_context(
            &self,
            kind: ContextKind,
            user_id: &str,
        ) -> ContextResult<Option<UserContextDoc>> {
            self.inner.load_context(kind, user_id).await
        }
        async fn set_context_entries(
            &self,
            kind: ContextKind,
            user_id: &str,
            entries: &HashMap<String, String>,
        ) -> ContextResult<usize> {
            self.inner.set_context_entries(kind, user_id, entries).await
        }
        async fn delete_context_entries(
            &self,
            kind: ContextKind,
            user_id: &str,
            keys: &[String],
        ) -> ContextResult<usize> {
            self.inner.delete_context_entries(kind, user_id, keys).await
        }
        async fn list_context_docs(
            &self,
            kind: ContextKind,
        ) -> ContextResult<Vec<UserContextDoc>> {
            self.inner.list_context_docs(kind).await
        }
    }

    #[tokio::test]
    async fn one_failing_chat_does_not_abort_the_others() {
        let inner = MemoryStore::new();
        seed_chat(&inner, "broken", "u1", &[Role::User]).await;
        seed_chat(&inner, "healthy", "u1", &[Role::User]).await;
        let store = Arc::new(FailingChatStore {
            inner,
            failing_chat: "broken".to_string(),
        });
        let llm = Arc::new(ScriptedLlm::replying(&[
            r#"{"preferences":{"tone":"dry"},"facts":{}}"#,
        ]));

        let summary = ContextScanner::new(store.clone(), llm, 20)
            .scan_user_chats("u1", false)
            .await
            .unwrap();
        assert_eq!(summary.scanned_chats, 1);
        assert_eq!(summary.new_preferences, 1);
        assert!(store.inner.find_scan_record("healthy").await.unwrap().is_some());
        assert!(store.inner.find_scan_record("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scanning_other_users_chats_is_untouched() {
        let store = Arc::new(MemoryStore::new());
        seed_chat(&store, "c1", "u1", &[Role::User]).await;
        seed_chat(&store, "c2", "u2", &[Role::User]).await;
        let summary = scanner(store.clone(), Arc::new(ScriptedLlm::default()))
            .scan_user_chats("u1", false)
            .await
            .unwrap();
        assert_eq!(summary.scanned_chats, 1);
        assert!(store.find_scan_record("c2").await.unwrap().is_none());
    }
}
