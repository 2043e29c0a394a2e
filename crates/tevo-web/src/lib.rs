//! Read-only reporting API over the insight store.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tevo_core::{day_end, day_start, Dimension, SourceRecord, TimelineEntry, TimelineQuery};
use tevo_storage::Store;
use tevo_sync::AppConfig;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tevo-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
struct DimensionRow {
    label: &'static str,
    slug: &'static str,
    native_label: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct TimelineParams {
    dimension: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct TimelineResponse {
    dimension: Dimension,
    count: usize,
    entries: Vec<TimelineEntry>,
}

#[derive(Debug, Serialize)]
struct StatusRow {
    status: String,
    count: i64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/dimensions", get(dimensions_handler))
        .route("/api/timeline", get(timeline_handler))
        .route("/api/sources/pinned", get(pinned_handler))
        .route("/api/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let store = tevo_sync::open_store(config).await?;
    let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
    info!(addr = %config.bind_addr, "serving reporting API");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn dimensions_handler() -> Json<Vec<DimensionRow>> {
    Json(
        Dimension::ALL
            .into_iter()
            .map(|dim| DimensionRow {
                label: dim.label(),
                slug: dim.slug(),
                native_label: dim.native_label(),
            })
            .collect(),
    )
}

async fn timeline_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TimelineParams>,
) -> Response {
    let query = match timeline_query(&params) {
        Ok(query) => query,
        Err(msg) => return bad_request(msg),
    };
    match state.store.timeline(&query).await {
        Ok(entries) => Json(TimelineResponse {
            dimension: query.dimension,
            count: entries.len(),
            entries,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn pinned_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.pinned_sources().await {
        Ok(sources) => Json::<Vec<SourceRecord>>(sources).into_response(),
        Err(err) => server_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.status_counts().await {
        Ok(counts) => Json(
            counts
                .into_iter()
                .map(|(status, count)| StatusRow {
                    status: status.to_string(),
                    count,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error(err),
    }
}

fn timeline_query(params: &TimelineParams) -> Result<TimelineQuery, String> {
    let raw = params
        .dimension
        .as_deref()
        .ok_or_else(|| "missing dimension parameter".to_string())?;
    let dimension = Dimension::parse(raw).ok_or_else(|| format!("unknown dimension: {raw}"))?;
    Ok(TimelineQuery {
        dimension,
        since: time_bound(params.since.as_deref(), day_start)?,
        until: time_bound(params.until.as_deref(), day_end)?,
        limit: params.limit,
    })
}

/// Accepts epoch seconds or a `YYYY-MM-DD` day.
fn time_bound(value: Option<&str>, day: fn(&str) -> Option<i64>) -> Result<Option<i64>, String> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    value
        .parse::<i64>()
        .ok()
        .or_else(|| day(value))
        .map(Some)
        .ok_or_else(|| format!("invalid time bound: {value}"))
}

fn bad_request(msg: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tevo_core::{NewInsight, ProcessStatus, SourceUpsert};
    use tower::ServiceExt;

    async fn seeded_state() -> AppState {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        for (id, t, pinned) in [("a", 1_769_175_607, true), ("b", 1_769_348_407, true), ("c", 1_769_002_807, false)] {
            store
                .upsert_source(&SourceUpsert {
                    source_id: id.into(),
                    title: Some(format!("title {id}")),
                    publish_time: t,
                    source_url: format!("https://example.com/v/{id}"),
                    content_text: None,
                    status: Some(ProcessStatus::Pending),
                    pinned,
                })
                .await
                .unwrap();
        }
        for (id, node) in [("a", "humanoid gait"), ("b", "dexterous hands")] {
            store
                .replace_insights(
                    id,
                    &[NewInsight {
                        source_id: id.into(),
                        dimension: Dimension::EmbodiedAi,
                        project_name: Some("Unitree".into()),
                        tech_node: node.into(),
                        evolution_tag: Some("破圈".into()),
                        impact_score: 5,
                        summary: format!("{node} summary"),
                    }],
                )
                .await
                .unwrap();
        }
        store.update_status("c", ProcessStatus::Error).await.unwrap();
        AppState::new(store)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn dimensions_lists_the_fixed_set() {
        let (status, body) = get_json(app(seeded_state().await), "/api/dimensions").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[4]["slug"], "embodied-ai");
        assert_eq!(rows[4]["native_label"], "具身智能");
    }

    #[tokio::test]
    async fn timeline_is_oldest_first_and_filterable() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app.clone(), "/api/timeline?dimension=embodied-ai").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dimension"], "Embodied AI");
        assert_eq!(body["count"], 2);
        assert_eq!(body["entries"][0]["source_id"], "a");
        assert_eq!(body["entries"][1]["source_id"], "b");

        let (_, body) = get_json(app.clone(), "/api/timeline?dimension=Embodied%20AI&since=2026-01-25").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["tech_node"], "dexterous hands");

        let (_, body) = get_json(app, "/api/timeline?dimension=embodied-ai&until=1769175607&limit=5").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["source_id"], "a");
    }

    #[tokio::test]
    async fn timeline_rejects_bad_parameters() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app.clone(), "/api/timeline?dimension=quantum").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("quantum"));

        let (status, _) = get_json(app.clone(), "/api/timeline").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(app, "/api/timeline?dimension=llm&since=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pinned_sources_are_newest_first() {
        let (status, body) = get_json(app(seeded_state().await), "/api/sources/pinned").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["source_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn status_counts_include_every_status() {
        let (status, body) = get_json(app(seeded_state().await), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 4);
        let count = |name: &str| {
            rows.iter()
                .find(|r| r["status"] == name)
                .map(|r| r["count"].as_i64().unwrap())
        };
        assert_eq!(count("pending"), Some(2));
        assert_eq!(count("error"), Some(1));
        assert_eq!(count("analyzed"), Some(0));
    }
}
