//! Application configuration: optional JSON file, then environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tevo_adapters::{ChatExtractorConfig, WorkflowConfig};
use tevo_storage::HttpClientConfig;

use crate::engine::SyncOptions;
use crate::stages::StageOptions;

pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Keys accept both snake_case and the upper-case env spelling inside the JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(alias = "TEVO_DB_PATH")]
    pub database_path: PathBuf,
    #[serde(alias = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,
    #[serde(alias = "OPENAI_BASE_URL")]
    pub openai_base_url: String,
    #[serde(alias = "OPENAI_MODEL")]
    pub openai_model: String,
    #[serde(alias = "WORKFLOW_API_TOKEN")]
    pub workflow_api_token: Option<String>,
    #[serde(alias = "WORKFLOW_BASE_URL")]
    pub workflow_base_url: String,
    #[serde(alias = "LIST_WORKFLOW_ID")]
    pub list_workflow_id: Option<String>,
    #[serde(alias = "TRANSCRIPT_WORKFLOW_ID")]
    pub transcript_workflow_id: Option<String>,
    #[serde(alias = "PROFILE_URL")]
    pub profile_url: Option<String>,
    #[serde(alias = "TEST_MODE")]
    pub test_mode: bool,
    #[serde(alias = "EXTRACT_WORKERS")]
    pub extract_workers: usize,
    #[serde(alias = "ANALYZE_WORKERS")]
    pub analyze_workers: usize,
    #[serde(alias = "EXTRACT_LIMIT")]
    pub extract_limit: u32,
    #[serde(alias = "ANALYZE_LIMIT")]
    pub analyze_limit: u32,
    #[serde(alias = "WINDOW_SIZE")]
    pub window_size: u32,
    #[serde(alias = "PIN_COUNT")]
    pub pin_count: usize,
    #[serde(alias = "ANALYZE_BACKLOG")]
    pub analyze_backlog: bool,
    #[serde(alias = "IMPACT_RULES_PATH")]
    pub impact_rules_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    #[serde(alias = "SYNC_CRON")]
    pub sync_cron: String,
    pub bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/tevo.db"),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o".to_string(),
            workflow_api_token: None,
            workflow_base_url: "https://api.coze.cn".to_string(),
            list_workflow_id: None,
            transcript_workflow_id: None,
            profile_url: None,
            test_mode: false,
            extract_workers: 5,
            analyze_workers: 5,
            extract_limit: 200,
            analyze_limit: 200,
            window_size: 20,
            pin_count: 3,
            analyze_backlog: false,
            impact_rules_path: None,
            http_timeout_secs: 60,
            scheduler_enabled: false,
            sync_cron: "0 0 8 * * *".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Resolve the config file (`explicit`, else `TEVO_CONFIG`, else `./config.json`),
    /// then apply process environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = std::env::var("TEVO_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| text(key).map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"));
        fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = text("TEVO_DB_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = text("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = text("OPENAI_BASE_URL") {
            self.openai_base_url = v;
        }
        if let Some(v) = text("OPENAI_MODEL") {
            self.openai_model = v;
        }
        if let Some(v) = text("WORKFLOW_API_TOKEN") {
            self.workflow_api_token = Some(v);
        }
        if let Some(v) = text("WORKFLOW_BASE_URL") {
            self.workflow_base_url = v;
        }
        if let Some(v) = text("LIST_WORKFLOW_ID") {
            self.list_workflow_id = Some(v);
        }
        if let Some(v) = text("TRANSCRIPT_WORKFLOW_ID") {
            self.transcript_workflow_id = Some(v);
        }
        if let Some(v) = text("PROFILE_URL") {
            self.profile_url = Some(v);
        }
        if let Some(v) = flag("TEST_MODE") {
            self.test_mode = v;
        }
        if let Some(v) = parsed(text("EXTRACT_WORKERS")) {
            self.extract_workers = v;
        }
        if let Some(v) = parsed(text("ANALYZE_WORKERS")) {
            self.analyze_workers = v;
        }
        if let Some(v) = parsed(text("EXTRACT_LIMIT")) {
            self.extract_limit = v;
        }
        if let Some(v) = parsed(text("ANALYZE_LIMIT")) {
            self.analyze_limit = v;
        }
        if let Some(v) = parsed(text("WINDOW_SIZE")) {
            self.window_size = v;
        }
        if let Some(v) = parsed(text("PIN_COUNT")) {
            self.pin_count = v;
        }
        if let Some(v) = flag("ANALYZE_BACKLOG") {
            self.analyze_backlog = v;
        }
        if let Some(v) = text("IMPACT_RULES_PATH") {
            self.impact_rules_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed(text("TEVO_HTTP_TIMEOUT_SECS")) {
            self.http_timeout_secs = v;
        }
        if let Some(v) = flag("TEVO_SCHEDULER_ENABLED") {
            self.scheduler_enabled = v;
        }
        if let Some(v) = text("SYNC_CRON") {
            self.sync_cron = v;
        }
        if let Some(v) = text("TEVO_BIND") {
            self.bind_addr = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.extract_workers == 0 || self.analyze_workers == 0 {
            bail!("worker counts must be at least 1");
        }
        if self.extract_limit == 0 || self.analyze_limit == 0 || self.window_size == 0 {
            bail!("extract_limit, analyze_limit and window_size must be at least 1");
        }
        Ok(())
    }

    pub fn has_openai_key(&self) -> bool {
        self.openai_api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            pin_count: self.pin_count,
            page_size: self.window_size,
            max_pages: self.test_mode.then_some(1),
        }
    }

    pub fn extract_stage_options(&self) -> StageOptions {
        self.stage_options(self.extract_workers, self.extract_limit)
    }

    pub fn analyze_stage_options(&self) -> StageOptions {
        self.stage_options(self.analyze_workers, self.analyze_limit)
    }

    fn stage_options(&self, workers: usize, limit: u32) -> StageOptions {
        StageOptions {
            workers,
            batch_limit: if self.test_mode { 1 } else { limit },
            single_batch: self.test_mode,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..HttpClientConfig::default()
        }
    }

    pub fn workflow_config(&self) -> WorkflowConfig {
        let mut config = WorkflowConfig::new(
            self.workflow_base_url.clone(),
            self.workflow_api_token.clone().unwrap_or_default(),
            self.list_workflow_id.clone().unwrap_or_default(),
            self.transcript_workflow_id.clone().unwrap_or_default(),
            self.profile_url.clone().unwrap_or_default(),
        );
        config.http = self.http_client_config();
        config
    }

    pub fn chat_config(&self) -> Option<ChatExtractorConfig> {
        if !self.has_openai_key() {
            return None;
        }
        let mut config = ChatExtractorConfig::new(self.openai_api_key.clone().unwrap_or_default());
        config.base_url = self.openai_base_url.clone();
        config.model = self.openai_model.clone();
        config.http.timeout = Duration::from_secs(self.http_timeout_secs);
        Some(config)
    }
}
