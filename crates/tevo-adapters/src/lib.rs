//! Outbound client contracts + the workflow feed, chat extractor and fixture implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tevo_core::{FeedItem, FeedPage, InsightDraft};
use tevo_storage::FetchError;
use thiserror::Error;

mod impact;
mod llm;
mod recovery;
mod workflow;

pub use impact::{to_rows, ImpactRules, ImpactTier, InsightDraftExt};
pub use llm::{build_prompt, ChatExtractorConfig, ChatInsightExtractor, SYSTEM_PROMPT};
pub use recovery::{decode_insights, parse_insight_items, recover_json, ParseStrategy};
pub use workflow::{
    parse_page_payload, parse_transcript_payload, unwrap_envelope, WorkflowConfig,
    WorkflowFeedClient,
};

pub const CRATE_NAME: &str = "tevo-adapters";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("workflow returned code {code}: {msg}")]
    Workflow { code: i64, msg: String },
    #[error("malformed feed payload: {0}")]
    Malformed(String),
    #[error("empty transcript for {url}")]
    EmptyTranscript { url: String },
    #[error("feed client misconfigured: {0}")]
    Config(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Transport(err) if err.is_retryable())
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("model returned empty content: {0}")]
    EmptyCompletion(String),
    #[error("unparseable model output ({reason}): {excerpt}")]
    Unparseable { reason: String, excerpt: String },
    #[error("model returned no insights")]
    EmptyInsights,
    #[error("extractor misconfigured: {0}")]
    Config(String),
}

impl ExtractError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::Transport(err) if err.is_retryable())
    }
}

/// Paginated, reverse-chronological content feed.
///
/// Implementations own their retry policy; callers only see the final outcome.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_page(&self, cursor: i64, page_size: u32) -> Result<FeedPage, FeedError>;

    /// Transcript text for a content URL. Blank text is an error.
    async fn fetch_transcript(&self, url: &str) -> Result<String, FeedError>;
}

#[async_trait]
pub trait InsightExtractor: Send + Sync {
    /// Non-empty list of validated insights for one piece of content.
    async fn extract(&self, title: Option<&str>, text: &str)
        -> Result<Vec<InsightDraft>, ExtractError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePage {
    pub cursor: i64,
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedFixture {
    pub pages: Vec<FixturePage>,
    #[serde(default)]
    pub transcripts: BTreeMap<String, String>,
}

pub fn load_feed_fixture(path: impl AsRef<Path>) -> Result<FeedFixture> {
    let path = path.as_ref();
    let data =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a recorded feed from memory. Unknown cursors yield an empty final page.
#[derive(Debug, Default)]
pub struct FixtureFeedClient {
    fixture: FeedFixture,
    page_requests: AtomicUsize,
}

impl FixtureFeedClient {
    pub fn new(fixture: FeedFixture) -> Self {
        Self {
            fixture,
            page_requests: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_feed_fixture(path)?))
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedClient for FixtureFeedClient {
    async fn fetch_page(&self, cursor: i64, _page_size: u32) -> Result<FeedPage, FeedError> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        let page = self
            .fixture
            .pages
            .iter()
            .find(|page| page.cursor == cursor)
            .map(|page| FeedPage {
                items: page.items.clone(),
                has_more: page.has_more,
                next_cursor: page.next_cursor,
            })
            .unwrap_or_default();
        Ok(page)
    }

    async fn fetch_transcript(&self, url: &str) -> Result<String, FeedError> {
        match self.fixture.transcripts.get(url) {
            Some(text) if !text.trim().is_empty() => Ok(text.clone()),
            _ => Err(FeedError::EmptyTranscript {
                url: url.to_string(),
            }),
        }
    }
}
