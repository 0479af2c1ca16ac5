use anyhow::{anyhow, Result};
use log::warn;
use rusqlite::Connection;
use serde::Deserialize;

use crate::context::{Ranked, RankedEntry, VectorIndex};
use crate::llm::token_count;
use crate::model::ChatContent;
use crate::store;

pub const MAX_CONTEXT_ENTRIES: usize = 15;
/// Accept the full cosine range; ranking alone decides what gets in.
pub const CONTEXT_SIMILARITY_FLOOR: f64 = -1.0;
pub const MAX_SYSTEM_PROMPT_TOKENS: u32 = 1024;
pub const MAX_RESPONSE_TOKENS: u32 = 512;

pub const PROMPT_SEPARATOR: &str = "\n\n---\n\n";

/// Prefix and suffix of the system instruction, split on `||`. Selected
/// knowledge chunks go in between.
pub const ANSWER_PROMPT: &str = "You are a helpful assistant. Answer comprehensively. \
Be concise, but comprehensive. Use the information below. \
|| Answer the user's question using the above information where relevant.";

pub const TITLE_SYSTEM_PROMPT: &str = "Make SHORT chat title max 5 words";

#[derive(Clone, Debug, PartialEq)]
pub struct PromptResult {
    pub prompt: String,
    pub context_content_ids: Vec<String>,
    pub context_distances: Vec<f64>,
    pub tokens_used: u32,
}

/// Greedy in rank order: better-ranked context is preferred over
/// budget-maximizing bin-packing, so packing stops at the first candidate
/// that does not fit. The prefix/suffix base cost is always counted;
/// callers must budget at least that much or no candidate is admitted and
/// the returned usage reflects the bare template.
pub fn pick_context<'a>(
    prefix: &str,
    suffix: &str,
    sep: &str,
    max_tokens: u32,
    candidates: &'a [RankedEntry],
    model: &str,
) -> (Vec<&'a RankedEntry>, u32) {
    let sep_tokens = token_count(sep, model);
    let mut used_tokens = token_count(prefix, model);
    if !suffix.is_empty() {
        used_tokens += sep_tokens + token_count(suffix, model);
    }

    let mut included = Vec::new();
    for entry in candidates {
        let t = sep_tokens + entry.token_count;
        if used_tokens + t > max_tokens {
            break;
        }
        included.push(entry);
        used_tokens += t;
    }
    (included, used_tokens)
}

/// `prefix + sep + chunk1 + sep + chunk2 + ... + sep + suffix`, suffix
/// omitted when empty.
pub fn insert_chunk_text(prefix: &str, suffix: &str, sep: &str, chunks: &[&str]) -> String {
    let mut buf = String::from(prefix);
    for chunk in chunks {
        buf.push_str(sep);
        buf.push_str(chunk);
    }
    if !suffix.is_empty() {
        buf.push_str(sep);
        buf.push_str(suffix);
    }
    buf
}

/// Builds the grounded system instruction for the turn at
/// `pending_turn_index`: ranks the account's chunks against the first and
/// most recent user messages of the conversation prefix, packs the winners
/// into the token budget, and records which chunks were used.
pub fn build_system_prompt(
    conn: &Connection,
    template: &str,
    cc: &ChatContent,
    pending_turn_index: usize,
    index: &VectorIndex,
    model: &str,
) -> Result<PromptResult> {
    let (prefix, suffix) = match template.split_once("||") {
        Some((p, s)) => (p.trim(), s.trim()),
        None => (template.trim(), ""),
    };

    let first = cc.first_user_message(pending_turn_index);
    let latest = cc.latest_user_message(pending_turn_index);

    let mut entries = Ranked::default();
    if let Some(vector) = first.and_then(|m| m.embedding.as_deref()) {
        entries.append_all(index.select(vector, MAX_CONTEXT_ENTRIES, CONTEXT_SIMILARITY_FLOOR));
    }
    let latest_is_first = match (first, latest) {
        (Some(a), Some(b)) => a.id == b.id,
        _ => false,
    };
    if !latest_is_first {
        if let Some(vector) = latest.and_then(|m| m.embedding.as_deref()) {
            entries.append_all(index.select(vector, MAX_CONTEXT_ENTRIES, CONTEXT_SIMILARITY_FLOOR));
            entries = entries.select_top(MAX_CONTEXT_ENTRIES, CONTEXT_SIMILARITY_FLOOR);
        }
    }

    let (included, tokens_used) = pick_context(
        prefix,
        suffix,
        PROMPT_SEPARATOR,
        MAX_SYSTEM_PROMPT_TOKENS,
        &entries.entries,
        model,
    );

    let mut result = PromptResult {
        prompt: String::new(),
        context_content_ids: Vec::new(),
        context_distances: Vec::new(),
        tokens_used,
    };

    let mut texts: Vec<String> = Vec::new();
    for entry in included {
        match store::get_content_chunk(conn, &entry.content_id)? {
            Some(chunk) => {
                texts.push(chunk.text);
                result.context_content_ids.push(entry.content_id.clone());
                result.context_distances.push(entry.similarity);
            }
            None => {
                warn!(
                    "context entry refers to missing content {} (item {})",
                    entry.content_id, entry.item_id
                );
            }
        }
    }

    let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
    result.prompt = insert_chunk_text(prefix, suffix, PROMPT_SEPARATOR, &texts);
    Ok(result)
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TitleResult {
    pub title: String,
}

/// JSON schema forcing the title call into a single-field structured result.
pub fn title_schema() -> serde_json::Value {
    serde_json::json!({
        "name": "chat_title",
        "schema": {
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "5 words or less"
                }
            },
            "required": ["title"],
            "additionalProperties": false
        }
    })
}

pub fn parse_title(text: &str) -> Result<String> {
    let parsed: TitleResult =
        serde_json::from_str(text).map_err(|e| anyhow!("malformed title result: {e}"))?;
    let title = parsed.title.trim().to_string();
    if title.is_empty() {
        return Err(anyhow!("model returned an empty title"));
    }
    Ok(title)
}
