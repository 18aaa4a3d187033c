//! Prompt templates and response schemas.
//!
//! Templates use `{name}` placeholders filled by [`render_template`].

use serde_json::json;

use crate::types::ResponseSchema;

/// Instructions for a narrative turn.
pub const STORY_TURN_TEMPLATE: &str = r#"You are an interactive storytelling AI. Continue the story so that it stays consistent with the world facts below. Keep it suitable for all audiences.

World summary: {world_summary}

Retrieved facts:
{retrieved}

Recent history:
{history}

Player action: "{action}"

Call generate_story_turn with a 2-4 sentence continuation, 2-3 concrete choices for the player, and every world fact the continuation establishes."#;

/// Instructions for standalone fact extraction.
pub const EXTRACT_FACTS_TEMPLATE: &str = r"Extract every factual triple about characters, items and places from the story text below. Use possession for acquiring or holding items, location for being somewhere or moving there, relationship for meeting or talking to someone.

Story text:
{text}";

const FACT_TYPES: [&str; 5] = ["possession", "location", "relationship", "action", "property"];

/// Substitute `{key}` placeholders. Unknown placeholders are left as-is.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

fn bullet_list(lines: &[String], empty: &str) -> String {
    if lines.is_empty() {
        return empty.to_string();
    }
    lines.iter().map(|l| format!("- {l}")).collect::<Vec<_>>().join("\n")
}

/// Prompt for one story turn.
#[must_use]
pub fn build_story_prompt(world_summary: &str, retrieved: &[String], history: &[String], action: &str) -> String {
    let retrieved = bullet_list(retrieved, "(none)");
    let history = if history.is_empty() {
        "(the story has just begun)".to_string()
    } else {
        history.join("\n")
    };
    render_template(STORY_TURN_TEMPLATE, &[
        ("world_summary", world_summary),
        ("retrieved", &retrieved),
        ("history", &history),
        ("action", action.trim()),
    ])
}

/// Prompt for standalone fact extraction.
#[must_use]
pub fn build_extract_prompt(text: &str) -> String {
    render_template(EXTRACT_FACTS_TEMPLATE, &[("text", text.trim())])
}

fn fact_item_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "type": { "type": "string", "enum": FACT_TYPES },
            "subject": { "type": "string", "description": "Entity performing or possessing, e.g. 'Player' or a character name" },
            "predicate": { "type": "string", "description": "Relation, e.g. 'acquires', 'is at', 'meets'" },
            "object": { "type": "string", "description": "Target item, place or character" },
            "certainty": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "required": ["type", "subject", "predicate", "object", "certainty"]
    })
}

/// Schema for a narrative turn: text, choices and extracted facts.
#[must_use]
pub fn story_turn_schema() -> ResponseSchema {
    ResponseSchema {
        name: "generate_story_turn".to_string(),
        description: "Generate the next story turn with narrative text, player choices, and extracted world facts"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "ai_text": { "type": "string", "description": "Narrative continuation (2-4 sentences)" },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 2,
                    "maxItems": 3
                },
                "extracted_facts": { "type": "array", "items": fact_item_schema() }
            },
            "required": ["ai_text", "options", "extracted_facts"]
        }),
    }
}

/// Schema for standalone fact extraction.
#[must_use]
pub fn extract_facts_schema() -> ResponseSchema {
    ResponseSchema {
        name: "extract_facts".to_string(),
        description: "Extract factual triples from a story text".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "facts": { "type": "array", "items": fact_item_schema() }
            },
            "required": ["facts"]
        }),
    }
}
