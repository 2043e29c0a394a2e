//! Sync pipeline orchestration: feed reconciliation, transcript extraction, insight analysis.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tevo_adapters::{
    load_feed_fixture, ChatInsightExtractor, FeedClient, FixtureFeedClient, ImpactRules,
    InsightExtractor, WorkflowFeedClient,
};
use tevo_storage::Store;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod engine;
mod pool;
mod stages;

pub use config::{AppConfig, DEFAULT_CONFIG_PATH};
pub use engine::{SyncEngine, SyncOptions, SyncOutcome};
pub use pool::{worker_count, JobPanic, WorkerPool};
pub use stages::{
    run_analysis_stage, run_extraction_stage, ExtractorFactory, FeedClientFactory, StageOptions,
    StageReport,
};

pub const CRATE_NAME: &str = "tevo-sync";

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sync: SyncOutcome,
    pub extraction: StageReport,
    /// `None` when analysis was skipped for lack of extractor credentials.
    pub analysis: Option<StageReport>,
}

/// Factory for workflow-backed feed clients. Configuration is checked up front.
pub fn workflow_feed_factory(config: &AppConfig) -> Result<FeedClientFactory> {
    let workflow = config.workflow_config();
    WorkflowFeedClient::new(workflow.clone()).context("configuring workflow feed client")?;
    Ok(Arc::new(move || -> Result<Box<dyn FeedClient>> {
        Ok(Box::new(WorkflowFeedClient::new(workflow.clone())?))
    }))
}

/// Factory serving a recorded feed fixture; each client gets its own copy.
pub fn fixture_feed_factory(path: impl AsRef<Path>) -> Result<FeedClientFactory> {
    let fixture = load_feed_fixture(path)?;
    Ok(Arc::new(move || -> Result<Box<dyn FeedClient>> {
        Ok(Box::new(FixtureFeedClient::new(fixture.clone())))
    }))
}

/// `Ok(None)` when no API key is configured.
pub fn chat_extractor_factory(config: &AppConfig) -> Result<Option<ExtractorFactory>> {
    let Some(chat) = config.chat_config() else {
        return Ok(None);
    };
    ChatInsightExtractor::new(chat.clone()).context("configuring chat extractor")?;
    Ok(Some(Arc::new(move || -> Result<Box<dyn InsightExtractor>> {
        Ok(Box::new(ChatInsightExtractor::new(chat.clone())?))
    })))
}

pub fn load_impact_rules(config: &AppConfig) -> Result<ImpactRules> {
    match &config.impact_rules_path {
        Some(path) => ImpactRules::load(path),
        None => Ok(ImpactRules::default()),
    }
}

pub async fn open_store(config: &AppConfig) -> Result<Store> {
    let store = Store::open(&config.database_path).await?;
    store.init_schema().await?;
    Ok(store)
}

/// One sync pass followed by the extraction and analysis stages.
///
/// Runs are serialized so the store keeps a single writer even when a scheduled run
/// overlaps a manual one.
pub struct Pipeline {
    config: AppConfig,
    store: Store,
    feed_factory: FeedClientFactory,
    extractor_factory: Option<ExtractorFactory>,
    rules: ImpactRules,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        store: Store,
        feed_factory: FeedClientFactory,
        extractor_factory: Option<ExtractorFactory>,
        rules: ImpactRules,
    ) -> Self {
        Self {
            config,
            store,
            feed_factory,
            extractor_factory,
            rules,
            run_lock: Mutex::new(()),
        }
    }

    /// Wire the production clients from configuration.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let store = open_store(&config).await?;
        let feed_factory = workflow_feed_factory(&config)?;
        let extractor_factory = chat_extractor_factory(&config)?;
        let rules = load_impact_rules(&config)?;
        Ok(Self::new(config, store, feed_factory, extractor_factory, rules))
    }

    pub fn with_feed_factory(mut self, feed_factory: FeedClientFactory) -> Self {
        self.feed_factory = feed_factory;
        self
    }

    pub fn with_extractor_factory(mut self, extractor_factory: Option<ExtractorFactory>) -> Self {
        self.extractor_factory = extractor_factory;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run_once(&self) -> Result<PipelineSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, test_mode = self.config.test_mode);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<PipelineSummary> {
        let started_at = Utc::now();

        let feed = (self.feed_factory)().context("building feed client")?;
        let sync = SyncEngine::new(&self.store, feed.as_ref(), self.config.sync_options())
            .run()
            .await
            .context("sync pass")?;

        let extraction = run_extraction_stage(
            &self.store,
            &self.feed_factory,
            sync.watermark_before,
            self.config.extract_stage_options(),
        )
        .await
        .context("extraction stage")?;

        let analysis = match &self.extractor_factory {
            Some(factory) => {
                let after = if self.config.analyze_backlog {
                    None
                } else {
                    sync.watermark_before
                };
                let report = run_analysis_stage(
                    &self.store,
                    factory,
                    after,
                    &self.rules,
                    self.config.analyze_stage_options(),
                )
                .await
                .context("analysis stage")?;
                Some(report)
            }
            None => {
                warn!("no OpenAI API key configured; skipping analysis stage");
                None
            }
        };

        let summary = PipelineSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sync,
            extraction,
            analysis,
        };
        info!(
            inserted = summary.sync.inserted_total(),
            extracted = summary.extraction.ok,
            analyzed = summary.analysis.map(|r| r.ok).unwrap_or_default(),
            "pipeline run complete"
        );
        Ok(summary)
    }
}

/// Cron scheduler running [`Pipeline::run_once`], or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_factory_requires_credentials() {
        let config = AppConfig::default();
        assert!(workflow_feed_factory(&config).is_err());

        let config = AppConfig {
            workflow_api_token: Some("tok".into()),
            list_workflow_id: Some("list".into()),
            transcript_workflow_id: Some("text".into()),
            profile_url: Some("https://www.douyin.com/user/abc".into()),
            ..AppConfig::default()
        };
        let factory = workflow_feed_factory(&config).expect("factory");
        assert!(factory().is_ok());
    }

    #[test]
    fn chat_factory_is_absent_without_a_key() {
        assert!(chat_extractor_factory(&AppConfig::default())
            .unwrap()
            .is_none());
        let config = AppConfig {
            openai_api_key: Some("sk-test".into()),
            ..AppConfig::default()
        };
        assert!(chat_extractor_factory(&config).unwrap().is_some());
    }

    #[tokio::test]
    async fn scheduler_is_disabled_by_default() {
        let store = Store::open_in_memory().await.unwrap();
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feed/sample.json");
        let pipeline = Pipeline::new(
            AppConfig::default(),
            store,
            fixture_feed_factory(fixture).unwrap(),
            None,
            ImpactRules::default(),
        );
        assert!(maybe_build_scheduler(Arc::new(pipeline)).await.unwrap().is_none());
    }
}
