//! Recovering a JSON payload from free-text model output.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tevo_core::{Dimension, InsightDraft};
use tevo_storage::truncate_chars;
use tracing::warn;

use crate::ExtractError;

const EXCERPT_CHARS: usize = 500;

/// Ordered parse strategies; each is tried only when the previous one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    FencedBlock,
    BracketSlice,
}

impl ParseStrategy {
    pub const CHAIN: [ParseStrategy; 3] = [
        ParseStrategy::Direct,
        ParseStrategy::FencedBlock,
        ParseStrategy::BracketSlice,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParseStrategy::Direct => "direct",
            ParseStrategy::FencedBlock => "fenced_block",
            ParseStrategy::BracketSlice => "bracket_slice",
        }
    }

    pub fn attempt(self, text: &str) -> Option<JsonValue> {
        let text = text.trim();
        match self {
            ParseStrategy::Direct => parse_structured(text),
            ParseStrategy::FencedBlock => {
                if !text.contains("```") {
                    return None;
                }
                let normalized = text.replace("```json", "```").replace("```JSON", "```");
                normalized
                    .split("```")
                    .map(str::trim)
                    .filter(|segment| !segment.is_empty() && looks_bracketed(segment))
                    .find_map(parse_structured)
            }
            ParseStrategy::BracketSlice => {
                slice_between(text, '[', ']')
                    .and_then(|s| serde_json::from_str(s).ok())
                    .or_else(|| {
                        slice_between(text, '{', '}').and_then(|s| serde_json::from_str(s).ok())
                    })
            }
        }
    }
}

/// Run the strategy chain over `text`, returning the first strategy that produced JSON.
pub fn recover_json(text: &str) -> Result<(ParseStrategy, JsonValue), ExtractError> {
    ParseStrategy::CHAIN
        .into_iter()
        .find_map(|strategy| strategy.attempt(text).map(|value| (strategy, value)))
        .ok_or_else(|| ExtractError::Unparseable {
            reason: "no JSON object or array found".into(),
            excerpt: truncate_chars(text, EXCERPT_CHARS),
        })
}

#[derive(Debug, Deserialize)]
struct RawInsightItem {
    dimension: String,
    #[serde(default)]
    project_name: Option<String>,
    tech_node: String,
    #[serde(default)]
    evolution_tag: Option<String>,
    #[serde(default)]
    impact_signal: Option<String>,
    #[serde(default)]
    raw_context: Option<String>,
}

/// Validate a recovered payload: a bare array, or one wrapped under `items` / `insights`.
pub fn parse_insight_items(value: JsonValue) -> Result<Vec<InsightDraft>, ExtractError> {
    let list = match value {
        JsonValue::Array(items) => JsonValue::Array(items),
        JsonValue::Object(mut map) => ["items", "insights"]
            .into_iter()
            .find_map(|key| match map.remove(key) {
                Some(list @ JsonValue::Array(_)) => Some(list),
                _ => None,
            })
            .ok_or_else(|| ExtractError::Unparseable {
                reason: "object without an items list".into(),
                excerpt: truncate_chars(&JsonValue::Object(map.clone()).to_string(), EXCERPT_CHARS),
            })?,
        other => {
            return Err(ExtractError::Unparseable {
                reason: "expected a JSON array".into(),
                excerpt: truncate_chars(&other.to_string(), EXCERPT_CHARS),
            })
        }
    };

    let excerpt = truncate_chars(&list.to_string(), EXCERPT_CHARS);
    let raw: Vec<RawInsightItem> =
        serde_json::from_value(list).map_err(|err| ExtractError::Unparseable {
            reason: format!("invalid insight item: {err}"),
            excerpt,
        })?;
    if raw.is_empty() {
        return Err(ExtractError::EmptyInsights);
    }

    let drafts: Vec<InsightDraft> = raw
        .into_iter()
        .filter_map(|item| {
            let Some(dimension) = Dimension::parse(&item.dimension) else {
                warn!(dimension = %item.dimension, tech_node = %item.tech_node, "dropping insight with unknown dimension");
                return None;
            };
            Some(InsightDraft {
                dimension,
                project_name: non_blank(item.project_name),
                tech_node: item.tech_node.trim().to_string(),
                evolution_tag: non_blank(item.evolution_tag),
                impact_signal: non_blank(item.impact_signal),
                raw_context: non_blank(item.raw_context),
            })
        })
        .collect();

    if drafts.is_empty() {
        return Err(ExtractError::EmptyInsights);
    }
    Ok(drafts)
}

/// Recover and validate model output in one step.
pub fn decode_insights(text: &str) -> Result<Vec<InsightDraft>, ExtractError> {
    let (_, value) = recover_json(text)?;
    parse_insight_items(value)
}

fn parse_structured(text: &str) -> Option<JsonValue> {
    serde_json::from_str::<JsonValue>(text)
        .ok()
        .filter(|value| value.is_array() || value.is_object())
}

fn looks_bracketed(segment: &str) -> bool {
    (segment.contains('[') && segment.contains(']'))
        || (segment.contains('{') && segment.contains('}'))
}

fn slice_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
