use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tevo_adapters::{decode_insights, ExtractError, ImpactRules, InsightExtractor};
use tevo_core::{Dimension, InsightDraft, ProcessStatus, TimelineQuery};
use tevo_storage::Store;
use tevo_sync::{fixture_feed_factory, AppConfig, ExtractorFactory, Pipeline};

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feed/sample.json")
}

/// Classifies every transcript under one dimension based on a keyword.
struct KeywordModel;

#[async_trait]
impl InsightExtractor for KeywordModel {
    async fn extract(
        &self,
        _title: Option<&str>,
        text: &str,
    ) -> Result<Vec<InsightDraft>, ExtractError> {
        let dimension = if text.contains("机器人") {
            "具身智能"
        } else if text.contains("Sora") {
            "视频生成"
        } else if text.contains("Qwen3") {
            "LLM"
        } else {
            "AI编程/Vibe Coding"
        };
        let reply = format!(
            "```json\n[{{\"dimension\": \"{dimension}\", \"tech_node\": \"node\", \"raw_context\": \"{text}\"}}]\n```"
        );
        decode_insights(&reply)
    }
}

fn keyword_factory() -> ExtractorFactory {
    Arc::new(|| -> Result<Box<dyn InsightExtractor>> { Ok(Box::new(KeywordModel)) })
}

async fn pipeline(config: AppConfig) -> Pipeline {
    let store = Store::open_in_memory().await.unwrap();
    store.init_schema().await.unwrap();
    Pipeline::new(
        config,
        store,
        fixture_feed_factory(fixture_path()).unwrap(),
        Some(keyword_factory()),
        ImpactRules::default(),
    )
}

#[tokio::test]
async fn first_run_backfills_extracts_and_analyzes_the_whole_feed() {
    let pipeline = pipeline(AppConfig::default()).await;
    let summary = pipeline.run_once().await.expect("pipeline run");

    assert_eq!(summary.sync.watermark_before, None);
    assert_eq!(summary.sync.inserted_backfill.len(), 5);
    assert_eq!(summary.sync.pages_fetched, 2);
    assert_eq!(
        summary.sync.pinned_ids,
        vec![
            "7461000000000000005".to_string(),
            "7461000000000000004".to_string(),
            "7461000000000000003".to_string(),
        ]
    );
    assert_eq!(summary.extraction.ok, 4);
    assert_eq!(summary.extraction.errors, 1);
    let analysis = summary.analysis.expect("analysis ran");
    assert_eq!(analysis.ok, 4);
    assert_eq!(analysis.errors, 0);

    let store = pipeline.store();
    assert_eq!(
        store.get_source("7461000000000000001").await.unwrap().unwrap().status,
        ProcessStatus::Error
    );
    let embodied = store
        .timeline(&TimelineQuery::for_dimension(Dimension::EmbodiedAi))
        .await
        .unwrap();
    assert_eq!(embodied.len(), 1);
    assert_eq!(embodied[0].source_id, "7461000000000000003");
}

#[tokio::test]
async fn second_run_over_the_same_feed_does_nothing_new() {
    let pipeline = pipeline(AppConfig::default()).await;
    pipeline.run_once().await.unwrap();

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.sync.watermark_before, Some(1_769_348_407));
    assert_eq!(summary.sync.inserted_total(), 0);
    assert_eq!(summary.sync.pages_fetched, 1);
    assert_eq!(summary.extraction.batches, 0);
    assert_eq!(summary.analysis.map(|r| r.batches), Some(0));
    assert_eq!(pipeline.store().pinned_ids().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_mode_touches_one_page_and_one_record_per_stage() {
    let config = AppConfig {
        test_mode: true,
        ..AppConfig::default()
    };
    let pipeline = pipeline(config).await;
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.sync.pages_fetched, 1);
    assert_eq!(summary.sync.inserted_backfill.len(), 3);
    assert_eq!(summary.extraction.batches, 1);
    assert_eq!(summary.extraction.ok, 1);
    assert_eq!(summary.analysis.map(|r| r.ok), Some(1));
}

#[tokio::test]
async fn analysis_is_skipped_without_an_extractor() {
    let pipeline = pipeline(AppConfig::default())
        .await
        .with_extractor_factory(None);
    let summary = pipeline.run_once().await.unwrap();
    assert!(summary.analysis.is_none());
    assert_eq!(summary.extraction.ok, 4);
}
