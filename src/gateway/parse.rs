//! Layered extraction of structured JSON from free-text model output.
//!
//! Models are asked for strict JSON but routinely wrap it in prose or
//! markdown fences. The chain tries, in order: a direct parse, stripping a
//! fenced ```json block, slicing the outermost `{...}` block, and finally a
//! per-field regex scan. The first strategy that yields a JSON object wins;
//! when none does, callers substitute the operation's safe default value.
//! Malformed output is never surfaced as an error to callers.

use crate::gateway::types::{Categorization, RewriteResult, SearchResult, TitleSummary};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Fixed category enumeration used by the news pipeline. Model output is
/// lowercased and accent-stripped before the membership check.
pub const CATEGORIES: &[&str] = &[
    "general",
    "deportes",
    "politica",
    "economia",
    "internacional",
    "nacional",
    "cultura",
    "tecnologia",
    "sociedad",
    "espectaculos",
    "policial",
    "salud",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    FencedBlock,
    BraceExtract,
    FieldExtract,
}

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap()
});

static FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#""(\w+)"\s*:\s*(?:"((?:[^"\\]|\\.)*)"|(-?\d+(?:\.\d+)?)|(null)|(true|false))"#,
    )
    .unwrap()
});

/// Runs the strategy chain. Returns the extracted JSON object and the
/// strategy that produced it, or `None` when the text holds no recoverable
/// object.
pub fn extract_json(text: &str) -> Option<(Value, ParseStrategy)> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some((value, ParseStrategy::Direct));
    }

    if let Some(captures) = FENCED_BLOCK.captures(trimmed)
        && let Some(block) = captures.get(1)
        && let Ok(value) = serde_json::from_str::<Value>(block.as_str())
        && value.is_object()
    {
        return Some((value, ParseStrategy::FencedBlock));
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
        && let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end])
        && value.is_object()
    {
        return Some((value, ParseStrategy::BraceExtract));
    }

    let mut fields = Map::new();
    for captures in FIELD.captures_iter(trimmed) {
        let key = captures[1].to_string();
        let value = if let Some(s) = captures.get(2) {
            Value::String(s.as_str().replace("\\\"", "\""))
        } else if let Some(n) = captures.get(3) {
            n.as_str()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        } else if captures.get(4).is_some() {
            Value::Null
        } else {
            Value::Bool(&captures[5] == "true")
        };
        fields.entry(key).or_insert(value);
    }
    if !fields.is_empty() {
        return Some((Value::Object(fields), ParseStrategy::FieldExtract));
    }

    None
}

/// Lowercases, strips accents and checks membership in [`CATEGORIES`];
/// anything unknown maps to `general`.
pub fn normalize_category(raw: &str) -> String {
    let normalized = strip_accents(&raw.trim().to_lowercase());
    if CATEGORIES.contains(&normalized.as_str()) {
        normalized
    } else {
        "general".to_string()
    }
}

pub fn strip_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

/// Categorization contract: `{category, region, confidence}` with safe
/// defaults when fields are missing or the output is unparseable.
pub fn parse_categorization(text: &str) -> Categorization {
    match extract_json(text) {
        Some((value, strategy)) => {
            debug!(?strategy, "extracted categorization JSON");
            let category = value
                .get("category")
                .and_then(Value::as_str)
                .map(normalize_category)
                .unwrap_or_else(|| "general".to_string());
            let region = value
                .get("region")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let confidence = value
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.3)
                .clamp(0.0, 1.0);
            Categorization {
                category,
                region,
                confidence,
                fallback: false,
            }
        }
        None => {
            warn!("no JSON found in categorization output, using default value");
            Categorization::default_value()
        }
    }
}

/// Rewrite contract: `{title, content}`. Missing fields fall back to the
/// original title and to the raw model text as content.
pub fn parse_rewrite(text: &str, original_title: &str) -> RewriteResult {
    match extract_json(text) {
        Some((value, strategy)) => {
            debug!(?strategy, "extracted rewrite JSON");
            let title = value
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(original_title)
                .to_string();
            let content = value
                .get("content")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| text.trim())
                .to_string();
            RewriteResult {
                title,
                content,
                fallback: false,
            }
        }
        None => RewriteResult {
            title: original_title.to_string(),
            content: text.trim().to_string(),
            fallback: false,
        },
    }
}

/// Search contract: `{answer, keywords}`. A response without JSON is used
/// verbatim as the answer.
pub fn parse_search(text: &str) -> SearchResult {
    match extract_json(text) {
        Some((value, strategy)) => {
            debug!(?strategy, "extracted search JSON");
            let answer = value
                .get("answer")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| text.trim())
                .to_string();
            let keywords = value
                .get("keywords")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            SearchResult {
                answer,
                keywords,
                fallback: false,
            }
        }
        None => SearchResult {
            answer: text.trim().to_string(),
            keywords: Vec::new(),
            fallback: false,
        },
    }
}

/// Title/summary contract: `{title, summary}`. Without JSON the first line
/// becomes the title and the rest the summary.
pub fn parse_title_summary(text: &str) -> TitleSummary {
    match extract_json(text) {
        Some((value, strategy)) => {
            debug!(?strategy, "extracted title/summary JSON");
            let title = value
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("")
                .to_string();
            let summary = value
                .get("summary")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("")
                .to_string();
            TitleSummary {
                title,
                summary,
                fallback: false,
            }
        }
        None => {
            let trimmed = text.trim();
            let mut lines = trimmed.splitn(2, '\n');
            TitleSummary {
                title: lines.next().unwrap_or("").trim().to_string(),
                summary: lines.next().unwrap_or("").trim().to_string(),
                fallback: false,
            }
        }
    }
}
