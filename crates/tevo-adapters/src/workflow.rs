//! Feed client backed by a hosted workflow runner (list + transcript workflows).

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use tevo_core::{FeedItem, FeedPage};
use tevo_storage::{truncate_chars, BackoffPolicy, HttpClientConfig, HttpFetcher};
use tracing::debug;

use crate::{FeedClient, FeedError};

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub base_url: String,
    pub api_token: String,
    pub list_workflow_id: String,
    pub transcript_workflow_id: String,
    pub profile_url: String,
    pub http: HttpClientConfig,
}

impl WorkflowConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        list_workflow_id: impl Into<String>,
        transcript_workflow_id: impl Into<String>,
        profile_url: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            list_workflow_id: list_workflow_id.into(),
            transcript_workflow_id: transcript_workflow_id.into(),
            profile_url: profile_url.into(),
            http: HttpClientConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), FeedError> {
        let required = [
            ("workflow base url", &self.base_url),
            ("workflow api token", &self.api_token),
            ("list workflow id", &self.list_workflow_id),
            ("transcript workflow id", &self.transcript_workflow_id),
            ("profile url", &self.profile_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(FeedError::Config(format!("missing {name}")));
            }
        }
        Ok(())
    }
}

/// One instance per worker; the HTTP session is not shared.
#[derive(Debug)]
pub struct WorkflowFeedClient {
    config: WorkflowConfig,
    http: HttpFetcher,
}

impl WorkflowFeedClient {
    pub fn new(config: WorkflowConfig) -> Result<Self, FeedError> {
        config.validate()?;
        let http = HttpFetcher::new(config.http.clone())
            .map_err(|err| FeedError::Config(format!("{err:#}")))?;
        Ok(Self { config, http })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.http.backoff()
    }

    fn run_url(&self) -> String {
        format!(
            "{}/v1/workflow/run",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn run_workflow(
        &self,
        workflow_id: &str,
        parameters: JsonValue,
    ) -> Result<JsonValue, FeedError> {
        let body = json!({
            "workflow_id": workflow_id,
            "parameters": parameters,
        });
        let response = self
            .http
            .post_json(&self.run_url(), Some(&self.config.api_token), &body)
            .await?;
        let envelope = response.json().map_err(|err| {
            FeedError::Malformed(format!(
                "workflow response is not JSON ({err}): {}",
                truncate_chars(&response.text(), 300)
            ))
        })?;
        unwrap_envelope(envelope)
    }
}

#[async_trait]
impl FeedClient for WorkflowFeedClient {
    async fn fetch_page(&self, cursor: i64, page_size: u32) -> Result<FeedPage, FeedError> {
        let payload = self
            .run_workflow(
                &self.config.list_workflow_id,
                json!({
                    "count": page_size,
                    "max_cursor": cursor,
                    "input": self.config.profile_url,
                }),
            )
            .await?;
        let page = parse_page_payload(&payload)?;
        debug!(
            cursor,
            items = page.items.len(),
            has_more = page.has_more,
            next_cursor = ?page.next_cursor,
            "fetched feed page"
        );
        Ok(page)
    }

    async fn fetch_transcript(&self, url: &str) -> Result<String, FeedError> {
        let payload = self
            .run_workflow(
                &self.config.transcript_workflow_id,
                json!({ "input": url }),
            )
            .await?;
        let text = parse_transcript_payload(&payload);
        if text.trim().is_empty() {
            return Err(FeedError::EmptyTranscript {
                url: url.to_string(),
            });
        }
        Ok(text)
    }
}

/// Check the `{code, msg, data}` envelope and decode `data`, which may be a JSON string.
pub fn unwrap_envelope(envelope: JsonValue) -> Result<JsonValue, FeedError> {
    let code = envelope
        .get("code")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| FeedError::Malformed("workflow envelope has no numeric code".into()))?;
    if code != 0 {
        let msg = envelope
            .get("msg")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(FeedError::Workflow { code, msg });
    }

    match envelope.get("data") {
        Some(JsonValue::String(raw)) => serde_json::from_str(raw).map_err(|err| {
            FeedError::Malformed(format!(
                "workflow data is not JSON ({err}): {}",
                truncate_chars(raw, 300)
            ))
        }),
        Some(value @ JsonValue::Object(_)) => Ok(value.clone()),
        _ => Err(FeedError::Malformed("workflow envelope has no data".into())),
    }
}

/// Locate the `list` container (under `output`, `code` or the root) and normalize its items.
pub fn parse_page_payload(raw: &JsonValue) -> Result<FeedPage, FeedError> {
    let has_list = |value: &JsonValue| value.get("list").is_some_and(JsonValue::is_array);
    let container = ["output", "code"]
        .iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| value.is_object() && has_list(*value))
        .or_else(|| has_list(raw).then_some(raw))
        .ok_or_else(|| {
            FeedError::Malformed(format!(
                "no item list in workflow payload: {}",
                truncate_chars(&raw.to_string(), 300)
            ))
        })?;

    let items = container
        .get("list")
        .and_then(JsonValue::as_array)
        .map(|list| {
            list.iter()
                .filter_map(JsonValue::as_object)
                .filter_map(item_from_entry)
                .collect()
        })
        .unwrap_or_default();

    let has_more = match container.get("has_more") {
        Some(JsonValue::Bool(flag)) => *flag,
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    };

    Ok(FeedPage {
        items,
        has_more,
        next_cursor: container.get("max_cursor").and_then(as_integer),
    })
}

/// `text`, else the joined non-blank `transcripts[].text`, else `output.text`.
pub fn parse_transcript_payload(raw: &JsonValue) -> String {
    if let Some(text) = raw.get("text").and_then(JsonValue::as_str) {
        return text.to_string();
    }
    if let Some(transcripts) = raw.get("transcripts").and_then(JsonValue::as_array) {
        return transcripts
            .iter()
            .filter_map(|t| t.get("text").and_then(JsonValue::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
    }
    raw.get("output")
        .and_then(|output| output.get("text"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn item_from_entry(entry: &Map<String, JsonValue>) -> Option<FeedItem> {
    let id = first_text(entry, &["aweme_id", "item_id"])?;
    let url = first_text(entry, &["url", "link"])?;
    let publish_time = entry.get("create_time").and_then(as_integer)?;
    Some(FeedItem {
        id,
        title: first_text(entry, &["title", "caption"]),
        publish_time,
        url,
    })
}

fn first_text(entry: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match entry.get(*key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn as_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
