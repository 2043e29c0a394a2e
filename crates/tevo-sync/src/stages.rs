//! Extraction and analysis drivers: select a batch, fan out, write back serially.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tevo_adapters::{to_rows, FeedClient, ImpactRules, InsightExtractor};
use tevo_core::{NewInsight, ProcessStatus, SourceRecord};
use tevo_storage::Store;
use tracing::{info, warn};

use crate::pool::{worker_count, JobPanic, WorkerPool};

/// Builds one independent feed client per worker.
pub type FeedClientFactory = Arc<dyn Fn() -> Result<Box<dyn FeedClient>> + Send + Sync>;
/// Builds one independent insight extractor per worker.
pub type ExtractorFactory = Arc<dyn Fn() -> Result<Box<dyn InsightExtractor>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOptions {
    pub workers: usize,
    pub batch_limit: u32,
    /// Stop after the first batch instead of draining.
    pub single_batch: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            batch_limit: 200,
            single_batch: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub ok: usize,
    pub errors: usize,
    pub batches: usize,
}

/// Log a per-record failure and move the record to `error`; a failed status write is only logged.
async fn mark_failed(store: &Store, source_id: &str, reason: &str) {
    warn!(source_id, error = reason, "record failed");
    if let Err(err) = store.update_status(source_id, ProcessStatus::Error).await {
        warn!(source_id, error = %format!("{err:#}"), "could not mark record as error");
    }
}

/// Drops records this stage already handed out; `None` when nothing new is left,
/// which means the remaining rows are stuck on store writes.
fn unseen(batch: Vec<SourceRecord>, seen: &mut HashSet<String>) -> Option<Vec<SourceRecord>> {
    let fresh: Vec<_> = batch
        .into_iter()
        .filter(|record| seen.insert(record.source_id.clone()))
        .collect();
    (!fresh.is_empty()).then_some(fresh)
}

fn build_clients<T: ?Sized>(
    factory: &Arc<dyn Fn() -> Result<Box<T>> + Send + Sync>,
    count: usize,
) -> Result<Vec<Box<T>>> {
    (0..count).map(|_| factory()).collect()
}

/// Fill transcripts for records newer than `after` until none remain.
pub async fn run_extraction_stage(
    store: &Store,
    factory: &FeedClientFactory,
    after: Option<i64>,
    options: StageOptions,
) -> Result<StageReport> {
    let mut report = StageReport::default();
    let mut seen = HashSet::new();
    loop {
        let batch = store.list_needing_text(after, options.batch_limit).await?;
        if batch.is_empty() {
            break;
        }
        let Some(batch) = unseen(batch, &mut seen) else {
            warn!("remaining records could not be updated; stopping extraction");
            break;
        };
        report.batches += 1;
        let workers = worker_count(options.workers, batch.len());
        info!(
            batch = report.batches,
            size = batch.len(),
            workers,
            "extracting transcripts"
        );

        let clients = build_clients(factory, workers)?;
        let mut pool = WorkerPool::spawn(
            clients,
            batch,
            |client: Arc<Box<dyn FeedClient>>, record: SourceRecord| async move {
                let result = client.fetch_transcript(&record.source_url).await;
                (record, result)
            },
        );

        while let Some(output) = pool.next().await {
            let (record, result) = match output {
                Ok(pair) => pair,
                Err(JobPanic { job, message }) => {
                    mark_failed(store, &job.source_id, &message).await;
                    report.errors += 1;
                    continue;
                }
            };
            let failure = match result {
                Ok(text) => store
                    .update_content(&record.source_id, &text, ProcessStatus::TextExtracted)
                    .await
                    .err()
                    .map(|err| format!("storing transcript: {err:#}")),
                Err(err) => Some(format!("transcript extraction failed: {err}")),
            };
            match failure {
                None => report.ok += 1,
                Some(reason) => {
                    mark_failed(store, &record.source_id, &reason).await;
                    report.errors += 1;
                }
            }
        }
        pool.finish().await?;

        if options.single_batch {
            break;
        }
    }
    info!(ok = report.ok, errors = report.errors, batches = report.batches, "extraction stage done");
    Ok(report)
}

async fn store_insights(store: &Store, source_id: &str, rows: &[NewInsight]) -> Result<()> {
    store.replace_insights(source_id, rows).await?;
    store.update_status(source_id, ProcessStatus::Analyzed).await
}

/// Extract and store insights for records with text newer than `after` until none remain.
pub async fn run_analysis_stage(
    store: &Store,
    factory: &ExtractorFactory,
    after: Option<i64>,
    rules: &ImpactRules,
    options: StageOptions,
) -> Result<StageReport> {
    let mut report = StageReport::default();
    let mut seen = HashSet::new();
    loop {
        let batch = store.list_needing_analysis(after, options.batch_limit).await?;
        if batch.is_empty() {
            break;
        }
        let Some(batch) = unseen(batch, &mut seen) else {
            warn!("remaining records could not be updated; stopping analysis");
            break;
        };
        report.batches += 1;

        let (ready, blank): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(SourceRecord::has_content);
        for record in blank {
            mark_failed(store, &record.source_id, "no content text; skipping analysis").await;
            report.errors += 1;
        }

        if !ready.is_empty() {
            let workers = worker_count(options.workers, ready.len());
            info!(
                batch = report.batches,
                size = ready.len(),
                workers,
                "analyzing transcripts"
            );
            let clients = build_clients(factory, workers)?;
            let mut pool = WorkerPool::spawn(
                clients,
                ready,
                |client: Arc<Box<dyn InsightExtractor>>, record: SourceRecord| async move {
                    let text = record.content_text.as_deref().unwrap_or_default();
                    let result = client.extract(record.title.as_deref(), text).await;
                    (record, result)
                },
            );

            while let Some(output) = pool.next().await {
                let (record, result) = match output {
                    Ok(pair) => pair,
                    Err(JobPanic { job, message }) => {
                        mark_failed(store, &job.source_id, &message).await;
                        report.errors += 1;
                        continue;
                    }
                };
                let failure = match result {
                    Ok(drafts) => {
                        let rows = to_rows(&record.source_id, &drafts, rules);
                        store_insights(store, &record.source_id, &rows)
                            .await
                            .err()
                            .map(|err| format!("storing insights: {err:#}"))
                    }
                    Err(err) => Some(format!("insight extraction failed: {err}")),
                };
                match failure {
                    None => report.ok += 1,
                    Some(reason) => {
                        mark_failed(store, &record.source_id, &reason).await;
                        report.errors += 1;
                    }
                }
            }
            pool.finish().await?;
        }

        if options.single_batch {
            break;
        }
    }
    info!(ok = report.ok, errors = report.errors, batches = report.batches, "analysis stage done");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tevo_adapters::{decode_insights, ExtractError, FeedError};
    use tevo_core::{Dimension, FeedPage, InsightDraft, SourceUpsert};

    struct TranscriptFeed {
        transcripts: HashMap<String, String>,
    }

    #[async_trait]
    impl FeedClient for TranscriptFeed {
        async fn fetch_page(&self, _cursor: i64, _page_size: u32) -> Result<FeedPage, FeedError> {
            Ok(FeedPage::default())
        }

        async fn fetch_transcript(&self, url: &str) -> Result<String, FeedError> {
            self.transcripts
                .get(url)
                .cloned()
                .ok_or_else(|| FeedError::EmptyTranscript {
                    url: url.to_string(),
                })
        }
    }

    /// Replies with canned model output keyed by content text.
    struct CannedModel {
        replies: HashMap<String, String>,
    }

    #[async_trait]
    impl InsightExtractor for CannedModel {
        async fn extract(
            &self,
            _title: Option<&str>,
            text: &str,
        ) -> Result<Vec<InsightDraft>, ExtractError> {
            let reply = self
                .replies
                .get(text)
                .ok_or_else(|| ExtractError::EmptyCompletion(text.to_string()))?;
            decode_insights(reply)
        }
    }

    fn url(id: &str) -> String {
        format!("https://example.com/v/{id}")
    }

    async fn seeded_store(ids_and_times: &[(&str, i64)]) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        for (id, t) in ids_and_times {
            store
                .upsert_source(&SourceUpsert {
                    source_id: id.to_string(),
                    title: Some(format!("title {id}")),
                    publish_time: *t,
                    source_url: url(id),
                    content_text: None,
                    status: Some(ProcessStatus::Pending),
                    pinned: false,
                })
                .await
                .unwrap();
        }
        store
    }

    fn feed_factory(transcripts: &[(&str, &str)], built: Arc<AtomicUsize>) -> FeedClientFactory {
        let transcripts: HashMap<String, String> = transcripts
            .iter()
            .map(|(id, text)| (url(id), text.to_string()))
            .collect();
        Arc::new(move || -> Result<Box<dyn FeedClient>> {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TranscriptFeed {
                transcripts: transcripts.clone(),
            }) as Box<dyn FeedClient>)
        })
    }

    fn model_factory(replies: &[(&str, &str)]) -> ExtractorFactory {
        let replies: HashMap<String, String> = replies
            .iter()
            .map(|(text, reply)| (text.to_string(), reply.to_string()))
            .collect();
        Arc::new(move || -> Result<Box<dyn InsightExtractor>> {
            Ok(Box::new(CannedModel {
                replies: replies.clone(),
            }) as Box<dyn InsightExtractor>)
        })
    }

    async fn status(store: &Store, id: &str) -> ProcessStatus {
        store.get_source(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn extraction_marks_success_and_failure_independently() {
        let store = seeded_store(&[("a", 10), ("b", 20), ("c", 30)]).await;
        let built = Arc::new(AtomicUsize::new(0));
        let factory = feed_factory(&[("a", "alpha"), ("c", "gamma")], Arc::clone(&built));
        let options = StageOptions {
            workers: 2,
            ..StageOptions::default()
        };

        let report = run_extraction_stage(&store, &factory, None, options).await.unwrap();
        assert_eq!(report, StageReport { ok: 2, errors: 1, batches: 1 });
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(status(&store, "a").await, ProcessStatus::TextExtracted);
        assert_eq!(status(&store, "b").await, ProcessStatus::Error);
        let c = store.get_source("c").await.unwrap().unwrap();
        assert_eq!(c.content_text.as_deref(), Some("gamma"));
    }

    #[tokio::test]
    async fn extraction_respects_the_watermark() {
        let store = seeded_store(&[("old", 10), ("new", 20)]).await;
        let factory = feed_factory(&[("old", "x"), ("new", "y")], Arc::new(AtomicUsize::new(0)));

        let report = run_extraction_stage(&store, &factory, Some(10), StageOptions::default())
            .await
            .unwrap();
        assert_eq!(report.ok, 1);
        assert_eq!(status(&store, "old").await, ProcessStatus::Pending);
        assert_eq!(status(&store, "new").await, ProcessStatus::TextExtracted);
    }

    #[tokio::test]
    async fn small_batches_are_drained_until_empty() {
        let store = seeded_store(&[("a", 1), ("b", 2), ("c", 3)]).await;
        let factory = feed_factory(&[("a", "x"), ("b", "y")], Arc::new(AtomicUsize::new(0)));
        let options = StageOptions {
            workers: 1,
            batch_limit: 1,
            single_batch: false,
        };

        let report = run_extraction_stage(&store, &factory, None, options).await.unwrap();
        assert_eq!(report, StageReport { ok: 2, errors: 1, batches: 3 });
    }

    #[tokio::test]
    async fn single_batch_mode_stops_after_one_batch() {
        let store = seeded_store(&[("a", 1), ("b", 2), ("c", 3)]).await;
        let factory = feed_factory(&[("a", "x"), ("b", "y"), ("c", "z")], Arc::new(AtomicUsize::new(0)));
        let options = StageOptions {
            workers: 1,
            batch_limit: 1,
            single_batch: true,
        };

        let report = run_extraction_stage(&store, &factory, None, options).await.unwrap();
        assert_eq!(report, StageReport { ok: 1, errors: 0, batches: 1 });
        assert_eq!(status(&store, "c").await, ProcessStatus::TextExtracted);
        assert_eq!(status(&store, "a").await, ProcessStatus::Pending);
    }

    const FENCED: &str = "```json\n[{\"dimension\":\"视频生成\",\"project_name\":\"Sora 2\",\"tech_node\":\"lip sync\",\"evolution_tag\":\"上线\",\"impact_signal\":\"刷屏\",\"raw_context\":\" Sora 2 ships \"},{\"dimension\":\"AI应用\",\"tech_node\":\"creator tools\"}]\n```";

    #[tokio::test]
    async fn analysis_recovers_fenced_output_and_fails_empty_lists() {
        let store = seeded_store(&[("good", 10), ("empty", 20), ("blank", 30)]).await;
        store
            .update_content("good", "sora text", ProcessStatus::TextExtracted)
            .await
            .unwrap();
        store
            .update_content("empty", "nothing text", ProcessStatus::TextExtracted)
            .await
            .unwrap();
        store
            .update_content("blank", "   ", ProcessStatus::TextExtracted)
            .await
            .unwrap();
        let factory = model_factory(&[("sora text", FENCED), ("nothing text", "[]")]);

        let report = run_analysis_stage(
            &store,
            &factory,
            None,
            &ImpactRules::default(),
            StageOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(report, StageReport { ok: 1, errors: 2, batches: 1 });
        assert_eq!(status(&store, "good").await, ProcessStatus::Analyzed);
        assert_eq!(status(&store, "empty").await, ProcessStatus::Error);
        assert_eq!(status(&store, "blank").await, ProcessStatus::Error);

        let insights = store.insights_for_source("good").await.unwrap();
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].dimension, Dimension::VideoGeneration);
        assert_eq!(insights[0].impact_score, 5);
        assert_eq!(insights[0].summary.as_deref(), Some("Sora 2 ships"));
        assert_eq!(insights[1].dimension, Dimension::AiApplications);
        assert_eq!(insights[1].impact_score, 1);
        assert!(store.insights_for_source("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reanalysis_replaces_prior_insights() {
        let store = seeded_store(&[("s", 10)]).await;
        store
            .update_content("s", "sora text", ProcessStatus::TextExtracted)
            .await
            .unwrap();
        let factory = model_factory(&[("sora text", FENCED)]);
        run_analysis_stage(&store, &factory, None, &ImpactRules::default(), StageOptions::default())
            .await
            .unwrap();
        assert_eq!(store.insights_for_source("s").await.unwrap().len(), 2);

        store.update_status("s", ProcessStatus::TextExtracted).await.unwrap();
        let single = "[{\"dimension\":\"LLM\",\"tech_node\":\"reasoning\"}]";
        let factory = model_factory(&[("sora text", single)]);
        run_analysis_stage(&store, &factory, None, &ImpactRules::default(), StageOptions::default())
            .await
            .unwrap();

        let insights = store.insights_for_source("s").await.unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].dimension, Dimension::Llm);
    }

    /// Deletes the record it is analyzing before replying, so the insight write hits
    /// the foreign key; panics on "explode".
    struct VanishingSourceModel {
        store: Store,
    }

    #[async_trait]
    impl InsightExtractor for VanishingSourceModel {
        async fn extract(
            &self,
            title: Option<&str>,
            text: &str,
        ) -> Result<Vec<InsightDraft>, ExtractError> {
            if text == "explode" {
                panic!("model client crashed");
            }
            if title == Some("title gone") {
                sqlx::query("DELETE FROM raw_sources WHERE source_id = ?")
                    .bind("gone")
                    .execute(self.store.pool())
                    .await
                    .unwrap();
            }
            decode_insights(FENCED)
        }
    }

    fn vanishing_factory(store: &Store) -> ExtractorFactory {
        let store = store.clone();
        Arc::new(move || -> Result<Box<dyn InsightExtractor>> {
            Ok(Box::new(VanishingSourceModel {
                store: store.clone(),
            }) as Box<dyn InsightExtractor>)
        })
    }

    async fn with_text(store: &Store, id: &str, text: &str) {
        store
            .update_content(id, text, ProcessStatus::TextExtracted)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insight_write_failure_only_fails_that_record() {
        let store = seeded_store(&[("gone", 10), ("kept", 20)]).await;
        with_text(&store, "gone", "sora text").await;
        with_text(&store, "kept", "sora text").await;
        let options = StageOptions {
            workers: 1,
            ..StageOptions::default()
        };

        let report = run_analysis_stage(
            &store,
            &vanishing_factory(&store),
            None,
            &ImpactRules::default(),
            options,
        )
        .await
        .unwrap();
        assert_eq!(report, StageReport { ok: 1, errors: 1, batches: 1 });
        assert!(store.get_source("gone").await.unwrap().is_none());
        assert!(store.insights_for_source("gone").await.unwrap().is_empty());
        assert_eq!(status(&store, "kept").await, ProcessStatus::Analyzed);
        assert_eq!(store.insights_for_source("kept").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn panicking_extractor_marks_the_record_as_error() {
        let store = seeded_store(&[("boom", 10), ("fine", 20)]).await;
        with_text(&store, "boom", "explode").await;
        with_text(&store, "fine", "sora text").await;
        let options = StageOptions {
            workers: 1,
            ..StageOptions::default()
        };

        let report = run_analysis_stage(
            &store,
            &vanishing_factory(&store),
            None,
            &ImpactRules::default(),
            options,
        )
        .await
        .unwrap();
        assert_eq!(report, StageReport { ok: 1, errors: 1, batches: 1 });
        assert_eq!(status(&store, "boom").await, ProcessStatus::Error);
        assert_eq!(status(&store, "fine").await, ProcessStatus::Analyzed);
    }

    #[tokio::test]
    async fn factory_failures_abort_the_stage() {
        let store = seeded_store(&[("a", 1)]).await;
        let factory: FeedClientFactory =
            Arc::new(|| -> Result<Box<dyn FeedClient>> { anyhow::bail!("no credentials") });
        assert!(run_extraction_stage(&store, &factory, None, StageOptions::default())
            .await
            .is_err());
        assert_eq!(status(&store, "a").await, ProcessStatus::Pending);
    }
}
