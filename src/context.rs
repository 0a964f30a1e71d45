use std::collections::HashMap;

use serde_json::Value;

use crate::{
    error::ContextResult,
    prompting::render_user_context_prompt,
    store::ContextStore,
    types::{ContextCounts, ContextKind, ContextTimestamps, UserContext},
};

pub async fn get_user_context(
    store: &dyn ContextStore,
    user_id: &str,
) -> ContextResult<UserContext> {
    let preferences = store.load_context(ContextKind::Preferences, user_id).await?;
    let facts = store.load_context(ContextKind::Facts, user_id).await?;
    Ok(UserContext {
        last_updated: ContextTimestamps {
            preferences: preferences.as_ref().map(|doc| doc.last_updated),
            facts: facts.as_ref().map(|doc| doc.last_updated),
        },
        preferences: preferences.map(|doc| doc.entries).unwrap_or_default(),
        facts: facts.map(|doc| doc.entries).unwrap_or_default(),
    })
}

pub async fn context_counts(
    store: &dyn ContextStore,
    user_id: &str,
) -> ContextResult<ContextCounts> {
    let context = get_user_context(store, user_id).await?;
    Ok(ContextCounts {
        preferences: context.preferences.len(),
        facts: context.facts.len(),
    })
}

pub async fn user_context_prompt(
    store: &dyn ContextStore,
    user_id: &str,
) -> ContextResult<String> {
    let context = get_user_context(store, user_id).await?;
    Ok(render_user_context_prompt(&context.preferences, &context.facts))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn normalize_entries(raw: Option<&HashMap<String, Value>>) -> HashMap<String, String> {
    raw.into_iter()
        .flatten()
        .filter(|(key, _)| !key.trim().is_empty())
        .filter_map(|(key, value)| Some((key.trim().to_string(), value_text(value)?)))
        .collect()
}

/// Manual edit: sets each given entry. Null values are skipped.
pub async fn set_entries(
    store: &dyn ContextStore,
    user_id: &str,
    preferences: Option<&HashMap<String, Value>>,
    facts: Option<&HashMap<String, Value>>,
) -> ContextResult<ContextCounts> {
    let mut counts = ContextCounts::default();
    let preferences = normalize_entries(preferences);
    if !preferences.is_empty() {
        counts.preferences = store
            .set_context_entries(ContextKind::Preferences, user_id, &preferences)
            .await?;
    }
    let facts = normalize_entries(facts);
    if !facts.is_empty() {
        counts.facts = store
            .set_context_entries(ContextKind::Facts, user_id, &facts)
            .await?;
    }
    Ok(counts)
}

/// Splits a `a,b,c` query value into distinct, non-empty keys.
pub fn split_keys(raw: Option<&str>) -> Vec<String> {
    let mut keys = Vec::<String>::new();
    for key in raw.unwrap_or("").split(',').map(str::trim) {
        if !key.is_empty() && !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

pub async fn delete_entries(
    store: &dyn ContextStore,
    user_id: &str,
    preference_keys: &[String],
    fact_keys: &[String],
) -> ContextResult<ContextCounts> {
    let mut counts = ContextCounts::default();
    if !preference_keys.is_empty() {
        counts.preferences = store
            .delete_context_entries(ContextKind::Preferences, user_id, preference_keys)
            .await?;
    }
    if !fact_keys.is_empty() {
        counts.facts = store
            .delete_context_entries(ContextKind::Facts, user_id, fact_keys)
            .await?;
    }
    Ok(counts)
}
