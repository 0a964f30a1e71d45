use std::collections::{BTreeMap, HashMap};

use minijinja::{context, Environment};
use serde::Serialize;

const EXTRACTION_SYSTEM_PROMPT: &str = include_str!("prompts/extract_context.txt");
const USER_CONTEXT_TEMPLATE: &str = include_str!("prompts/user_context.j2");
const EMPTY_USER_CONTEXT: &str = "No specific user context available.";

pub fn render_extraction_system_prompt() -> &'static str {
    EXTRACTION_SYSTEM_PROMPT
}

#[derive(Debug, Serialize)]
struct ContextSection {
    title: &'static str,
    groups: Vec<ContextGroup>,
}

#[derive(Debug, Serialize)]
struct ContextGroup {
    category: String,
    items: Vec<ContextItem>,
}

#[derive(Debug, Serialize)]
struct ContextItem {
    label: String,
    value: String,
}

/// Groups keys by the segment before the first `_`; keys without one land
/// under `General`.
fn group_entries(entries: &HashMap<String, String>) -> Vec<ContextGroup> {
    let sorted = entries.iter().collect::<BTreeMap<_, _>>();
    let mut groups = Vec::<ContextGroup>::new();
    for (key, value) in sorted {
        let (category, label) = match key.split_once('_') {
            Some((category, rest)) => (category.to_string(), rest.replace('_', " ")),
            None => ("general".to_string(), key.clone()),
        };
        let category = capitalize(&category);
        let item = ContextItem {
            label,
            value: value.clone(),
        };
        match groups.iter_mut().find(|group| group.category == category) {
            Some(group) => group.items.push(item),
            None => groups.push(ContextGroup {
                category,
                items: vec![item],
            }),
        }
    }
    groups
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn context_sections(
    preferences: &HashMap<String, String>,
    facts: &HashMap<String, String>,
) -> Vec<ContextSection> {
    let mut sections = Vec::new();
    if !preferences.is_empty() {
        sections.push(ContextSection {
            title: "User Preferences",
            groups: group_entries(preferences),
        });
    }
    if !facts.is_empty() {
        sections.push(ContextSection {
            title: "User Facts",
            groups: group_entries(facts),
        });
    }
    sections
}

/// Markdown block describing the user, for inclusion in agent prompts.
pub fn render_user_context_prompt(
    preferences: &HashMap<String, String>,
    facts: &HashMap<String, String>,
) -> String {
    let sections = context_sections(preferences, facts);
    if sections.is_empty() {
        return EMPTY_USER_CONTEXT.to_string();
    }

    let mut env = Environment::new();
    if env
        .add_template("user_context", USER_CONTEXT_TEMPLATE)
        .is_err()
    {
        return fallback_user_context_prompt(&sections);
    }

    let Ok(template) = env.get_template("user_context") else {
        return fallback_user_context_prompt(&sections);
    };

    template
        .render(context! { sections => &sections })
        .unwrap_or_else(|_| fallback_user_context_prompt(&sections))
}

fn fallback_user_context_prompt(sections: &[ContextSection]) -> String {
    let mut prompt = String::new();
    for section in sections {
        prompt.push_str(&format!("## {}\n", section.title));
        for group in &section.groups {
            prompt.push_str(&format!("### {}\n", group.category));
            for item in &group.items {
                prompt.push_str(&format!("- {}: {}\n", item.label, item.value));
            }
            prompt.push('\n');
        }
    }
    prompt
}
