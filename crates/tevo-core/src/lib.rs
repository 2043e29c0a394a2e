//! Core domain model for TEVO: feed items, source records and extracted insights.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tevo-core";

/// Processing lifecycle of a source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    TextExtracted,
    Analyzed,
    Error,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 4] = [
        ProcessStatus::Pending,
        ProcessStatus::TextExtracted,
        ProcessStatus::Analyzed,
        ProcessStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::TextExtracted => "text_extracted",
            ProcessStatus::Analyzed => "analyzed",
            ProcessStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value.trim())
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed technology categories an insight is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dimension {
    #[serde(rename = "LLM")]
    Llm,
    #[serde(rename = "VLM")]
    Vlm,
    #[serde(rename = "Video Generation", alias = "视频生成")]
    VideoGeneration,
    #[serde(rename = "Audio/TTS/ASR", alias = "音频/TTS/ASR")]
    Audio,
    #[serde(rename = "Embodied AI", alias = "具身智能")]
    EmbodiedAi,
    #[serde(rename = "AI Coding/Vibe Coding", alias = "AI编程/Vibe Coding")]
    AiCoding,
    #[serde(rename = "AI Applications", alias = "AI应用")]
    AiApplications,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Llm,
        Dimension::Vlm,
        Dimension::VideoGeneration,
        Dimension::Audio,
        Dimension::EmbodiedAi,
        Dimension::AiCoding,
        Dimension::AiApplications,
    ];

    /// Canonical label, as stored in the database and shown to users.
    pub fn label(self) -> &'static str {
        match self {
            Dimension::Llm => "LLM",
            Dimension::Vlm => "VLM",
            Dimension::VideoGeneration => "Video Generation",
            Dimension::Audio => "Audio/TTS/ASR",
            Dimension::EmbodiedAi => "Embodied AI",
            Dimension::AiCoding => "AI Coding/Vibe Coding",
            Dimension::AiApplications => "AI Applications",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Dimension::Llm => "llm",
            Dimension::Vlm => "vlm",
            Dimension::VideoGeneration => "video-generation",
            Dimension::Audio => "audio",
            Dimension::EmbodiedAi => "embodied-ai",
            Dimension::AiCoding => "ai-coding",
            Dimension::AiApplications => "ai-applications",
        }
    }

    /// Label used by models prompted in the source platform's language.
    pub fn native_label(self) -> &'static str {
        match self {
            Dimension::Llm => "LLM",
            Dimension::Vlm => "VLM",
            Dimension::VideoGeneration => "视频生成",
            Dimension::Audio => "音频/TTS/ASR",
            Dimension::EmbodiedAi => "具身智能",
            Dimension::AiCoding => "AI编程/Vibe Coding",
            Dimension::AiApplications => "AI应用",
        }
    }

    /// Case-insensitive lookup by label, slug or native label.
    pub fn parse(value: &str) -> Option<Self> {
        let needle = value.trim();
        if needle.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|dim| {
            dim.label().eq_ignore_ascii_case(needle)
                || dim.slug().eq_ignore_ascii_case(needle)
                || dim.native_label().eq_ignore_ascii_case(needle)
        })
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of a feed page, newest first within the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub publish_time: i64,
    pub url: String,
}

/// A single page returned by the external feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<i64>,
}

/// Persisted source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub title: Option<String>,
    pub publish_time: i64,
    pub source_url: String,
    pub content_text: Option<String>,
    pub status: ProcessStatus,
    pub pinned: bool,
}

impl SourceRecord {
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        published_at(self.publish_time)
    }

    pub fn has_content(&self) -> bool {
        self.content_text
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }
}

/// Upsert payload for a source record. `None` content/status keep the stored values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUpsert {
    pub source_id: String,
    pub title: Option<String>,
    pub publish_time: i64,
    pub source_url: String,
    pub content_text: Option<String>,
    pub status: Option<ProcessStatus>,
    pub pinned: bool,
}

impl SourceUpsert {
    /// First observation of a feed item: no content yet, status `pending`.
    pub fn pending(item: &FeedItem, pinned: bool) -> Self {
        Self {
            source_id: item.id.clone(),
            title: item.title.clone(),
            publish_time: item.publish_time,
            source_url: item.url.clone(),
            content_text: None,
            status: Some(ProcessStatus::Pending),
            pinned,
        }
    }
}

/// Validated insight facet returned by the extractor, before scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightDraft {
    pub dimension: Dimension,
    pub project_name: Option<String>,
    pub tech_node: String,
    pub evolution_tag: Option<String>,
    pub impact_signal: Option<String>,
    pub raw_context: Option<String>,
}

/// Insight row ready for insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInsight {
    pub source_id: String,
    pub dimension: Dimension,
    pub project_name: Option<String>,
    pub tech_node: String,
    pub evolution_tag: Option<String>,
    pub impact_score: u8,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: i64,
    pub source_id: String,
    pub dimension: Dimension,
    pub project_name: Option<String>,
    pub tech_node: Option<String>,
    pub evolution_tag: Option<String>,
    pub impact_score: u8,
    pub summary: Option<String>,
}

/// Filter for the read-only dimension timeline. Time bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineQuery {
    pub dimension: Dimension,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u32>,
}

impl TimelineQuery {
    pub fn for_dimension(dimension: Dimension) -> Self {
        Self {
            dimension,
            since: None,
            until: None,
            limit: None,
        }
    }
}

/// Insight joined with its source, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub insight_id: i64,
    pub source_id: String,
    pub publish_time: i64,
    pub source_url: Option<String>,
    pub project_name: Option<String>,
    pub tech_node: Option<String>,
    pub evolution_tag: Option<String>,
    pub impact_score: u8,
    pub summary: Option<String>,
}

pub fn published_at(epoch_secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
}

/// First second of a `YYYY-MM-DD` day in UTC.
pub fn day_start(date: &str) -> Option<i64> {
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    Some(day.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

/// Last second of a `YYYY-MM-DD` day in UTC.
pub fn day_end(date: &str) -> Option<i64> {
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    Some(day.and_hms_opt(23, 59, 59)?.and_utc().timestamp())
}
