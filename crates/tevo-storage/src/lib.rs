//! SQLite-backed store for source records and insights + outbound HTTP utilities for TEVO.

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tevo_core::{
    Dimension, Insight, NewInsight, ProcessStatus, SourceRecord, SourceUpsert, TimelineEntry,
    TimelineQuery,
};
use tracing::debug;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, truncate_chars, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "tevo-storage";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS raw_sources (
        source_id TEXT PRIMARY KEY,
        title TEXT,
        publish_time INTEGER,
        source_url TEXT,
        content_text TEXT,
        process_status TEXT DEFAULT 'pending',
        is_top INTEGER DEFAULT 0,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_publish_time ON raw_sources(publish_time)",
    r#"
    CREATE TABLE IF NOT EXISTS tech_insights (
        insight_id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT,
        dimension TEXT NOT NULL,
        project_name TEXT,
        tech_node TEXT,
        evolution_tag TEXT,
        impact_score INTEGER DEFAULT 1,
        summary TEXT,
        FOREIGN KEY (source_id) REFERENCES raw_sources(source_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dimension_time ON tech_insights(dimension)",
    "CREATE INDEX IF NOT EXISTS idx_project ON tech_insights(project_name)",
];

const SOURCE_COLUMNS: &str =
    "source_id, title, publish_time, source_url, content_text, process_status, is_top";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearReport {
    pub insights: u64,
    pub sources: u64,
}

/// Keyed store for sources and insights. Writers are expected to be a single orchestrating task.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database {}", path.display()))?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; each call yields an independent store.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory sqlite url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying schema")?;
        }
        Ok(())
    }

    /// Highest publish time across all sources; the sync watermark.
    pub async fn max_publish_time(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(publish_time) FROM raw_sources")
            .fetch_one(&self.pool)
            .await
            .context("reading max publish_time")?;
        Ok(max)
    }

    pub async fn source_exists(&self, source_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM raw_sources WHERE source_id = ? LIMIT 1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("checking source {source_id}"))?;
        Ok(row.is_some())
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<SourceRecord>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM raw_sources WHERE source_id = ?");
        let row = sqlx::query(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading source {source_id}"))?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn source_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_sources")
            .fetch_one(&self.pool)
            .await
            .context("counting sources")?;
        Ok(count)
    }

    /// Insert or update by `source_id`.
    ///
    /// An existing record keeps its publish time, and keeps its content/status when the
    /// upsert carries `None`. The pin flag and `updated_at` are always refreshed.
    pub async fn upsert_source(&self, source: &SourceUpsert) -> Result<()> {
        let status = source.status.map(ProcessStatus::as_str);
        sqlx::query(
            r#"
            INSERT INTO raw_sources
                (source_id, title, publish_time, source_url, content_text, process_status, is_top, updated_at)
            VALUES (?, ?, ?, ?, ?, COALESCE(?, 'pending'), ?, CURRENT_TIMESTAMP)
            ON CONFLICT(source_id) DO UPDATE SET
                title = COALESCE(excluded.title, raw_sources.title),
                publish_time = COALESCE(raw_sources.publish_time, excluded.publish_time),
                source_url = excluded.source_url,
                content_text = COALESCE(excluded.content_text, raw_sources.content_text),
                process_status = COALESCE(?, raw_sources.process_status),
                is_top = excluded.is_top,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&source.source_id)
        .bind(&source.title)
        .bind(source.publish_time)
        .bind(&source.source_url)
        .bind(&source.content_text)
        .bind(status)
        .bind(source.pinned)
        .bind(status)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting source {}", source.source_id))?;
        Ok(())
    }

    pub async fn set_pinned(&self, source_id: &str, pinned: bool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE raw_sources SET is_top = ?, updated_at = CURRENT_TIMESTAMP WHERE source_id = ?",
        )
        .bind(pinned)
        .bind(source_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating pin flag for {source_id}"))?;
        Ok(result.rows_affected())
    }

    pub async fn update_content(
        &self,
        source_id: &str,
        content_text: &str,
        status: ProcessStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE raw_sources
            SET content_text = ?, process_status = ?, updated_at = CURRENT_TIMESTAMP
            WHERE source_id = ?
            "#,
        )
        .bind(content_text)
        .bind(status.as_str())
        .bind(source_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating content for {source_id}"))?;
        Ok(())
    }

    pub async fn update_status(&self, source_id: &str, status: ProcessStatus) -> Result<()> {
        sqlx::query(
            "UPDATE raw_sources SET process_status = ?, updated_at = CURRENT_TIMESTAMP WHERE source_id = ?",
        )
        .bind(status.as_str())
        .bind(source_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating status for {source_id}"))?;
        Ok(())
    }

    /// Unpin every record not in `keep`. An empty `keep` unpins everything.
    pub async fn clear_pins_except(&self, keep: &[String]) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE raw_sources SET is_top = 0, updated_at = CURRENT_TIMESTAMP WHERE is_top = 1",
        );
        let keep: Vec<&String> = keep.iter().filter(|id| !id.is_empty()).collect();
        if !keep.is_empty() {
            qb.push(" AND source_id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in keep {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("clearing stale pins")?;
        debug!(cleared = result.rows_affected(), "cleared stale pins");
        Ok(result.rows_affected())
    }

    pub async fn pinned_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT source_id FROM raw_sources WHERE is_top = 1 ORDER BY publish_time DESC, source_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing pinned sources")?;
        Ok(ids)
    }

    pub async fn pinned_sources(&self) -> Result<Vec<SourceRecord>> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM raw_sources WHERE is_top = 1 ORDER BY publish_time DESC, source_id ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("listing pinned sources")?;
        rows.iter().map(source_from_row).collect()
    }

    /// Sources still missing transcript text, newest first. `after` is exclusive.
    pub async fn list_needing_text(
        &self,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<SourceRecord>> {
        let sql = format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM raw_sources
            WHERE (content_text IS NULL OR TRIM(content_text) = '' OR process_status = 'pending')
              AND process_status NOT IN ('analyzed', 'error')
              AND (? IS NULL OR publish_time > ?)
            ORDER BY publish_time DESC
            LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("listing sources needing text")?;
        rows.iter().map(source_from_row).collect()
    }

    /// Sources with extracted text awaiting analysis, newest first. `after` is exclusive.
    pub async fn list_needing_analysis(
        &self,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<SourceRecord>> {
        let sql = format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM raw_sources
            WHERE process_status = 'text_extracted'
              AND (? IS NULL OR publish_time > ?)
            ORDER BY publish_time DESC
            LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("listing sources needing analysis")?;
        rows.iter().map(source_from_row).collect()
    }

    /// Replace every insight of `source_id` with `rows` in one transaction.
    pub async fn replace_insights(&self, source_id: &str, rows: &[NewInsight]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting insight transaction")?;
        sqlx::query("DELETE FROM tech_insights WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting insights for {source_id}"))?;

        for row in rows {
            if row.source_id != source_id {
                return Err(anyhow!(
                    "insight row for {} passed to replace_insights({source_id})",
                    row.source_id
                ));
            }
            sqlx::query(
                r#"
                INSERT INTO tech_insights
                    (source_id, dimension, project_name, tech_node, evolution_tag, impact_score, summary)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.source_id)
            .bind(row.dimension.label())
            .bind(&row.project_name)
            .bind(&row.tech_node)
            .bind(&row.evolution_tag)
            .bind(i64::from(row.impact_score))
            .bind(&row.summary)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting insight for {source_id}"))?;
        }

        tx.commit().await.context("committing insight transaction")?;
        Ok(())
    }

    pub async fn insights_for_source(&self, source_id: &str) -> Result<Vec<Insight>> {
        let rows = sqlx::query(
            r#"
            SELECT insight_id, source_id, dimension, project_name, tech_node, evolution_tag, impact_score, summary
            FROM tech_insights
            WHERE source_id = ?
            ORDER BY insight_id ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading insights for {source_id}"))?;

        rows.iter()
            .map(|row| {
                let dimension: String = row.try_get("dimension")?;
                Ok(Insight {
                    insight_id: row.try_get("insight_id")?,
                    source_id: row.try_get("source_id")?,
                    dimension: Dimension::parse(&dimension)
                        .ok_or_else(|| anyhow!("unknown dimension {dimension:?} in tech_insights"))?,
                    project_name: row.try_get("project_name")?,
                    tech_node: row.try_get("tech_node")?,
                    evolution_tag: row.try_get("evolution_tag")?,
                    impact_score: score_from_row(row)?,
                    summary: row.try_get("summary")?,
                })
            })
            .collect()
    }

    /// Insights of one dimension joined to their sources, oldest first.
    pub async fn timeline(&self, query: &TimelineQuery) -> Result<Vec<TimelineEntry>> {
        let limit = query.limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT
                i.insight_id,
                i.source_id,
                s.publish_time,
                s.source_url,
                i.project_name,
                i.tech_node,
                i.evolution_tag,
                i.impact_score,
                i.summary
            FROM tech_insights i
            JOIN raw_sources s ON i.source_id = s.source_id
            WHERE i.dimension = ?
              AND (? IS NULL OR s.publish_time >= ?)
              AND (? IS NULL OR s.publish_time <= ?)
            ORDER BY s.publish_time ASC, i.insight_id ASC
            LIMIT ?
            "#,
        )
        .bind(query.dimension.label())
        .bind(query.since)
        .bind(query.since)
        .bind(query.until)
        .bind(query.until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("querying timeline for {}", query.dimension))?;

        rows.iter()
            .map(|row| {
                Ok(TimelineEntry {
                    insight_id: row.try_get("insight_id")?,
                    source_id: row.try_get("source_id")?,
                    publish_time: row
                        .try_get::<Option<i64>, _>("publish_time")?
                        .unwrap_or_default(),
                    source_url: row.try_get("source_url")?,
                    project_name: row.try_get("project_name")?,
                    tech_node: row.try_get("tech_node")?,
                    evolution_tag: row.try_get("evolution_tag")?,
                    impact_score: score_from_row(row)?,
                    summary: row.try_get("summary")?,
                })
            })
            .collect()
    }

    /// Record counts per processing status, zero-filled.
    pub async fn status_counts(&self) -> Result<Vec<(ProcessStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT process_status, COUNT(*) AS n FROM raw_sources GROUP BY process_status",
        )
        .fetch_all(&self.pool)
        .await
        .context("counting sources by status")?;

        let mut counts: Vec<(ProcessStatus, i64)> =
            ProcessStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let status: Option<String> = row.try_get("process_status")?;
            let n: i64 = row.try_get("n")?;
            let status = status
                .as_deref()
                .and_then(ProcessStatus::parse)
                .unwrap_or(ProcessStatus::Pending);
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 += n;
            }
        }
        Ok(counts)
    }

    /// Delete all insights and sources, keeping the schema.
    pub async fn clear_all(&self) -> Result<ClearReport> {
        let mut tx = self.pool.begin().await.context("starting clear transaction")?;
        let insights = sqlx::query("DELETE FROM tech_insights")
            .execute(&mut *tx)
            .await
            .context("clearing tech_insights")?
            .rows_affected();
        let sources = sqlx::query("DELETE FROM raw_sources")
            .execute(&mut *tx)
            .await
            .context("clearing raw_sources")?
            .rows_affected();
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'tech_insights'")
            .execute(&mut *tx)
            .await
            .context("resetting insight id sequence")?;
        tx.commit().await.context("committing clear transaction")?;
        Ok(ClearReport { insights, sources })
    }
}

fn source_from_row(row: &SqliteRow) -> Result<SourceRecord> {
    let status: Option<String> = row.try_get("process_status")?;
    let status = match status.as_deref() {
        None => ProcessStatus::Pending,
        Some(raw) => ProcessStatus::parse(raw)
            .ok_or_else(|| anyhow!("unknown process_status {raw:?} in raw_sources"))?,
    };
    let is_top: Option<i64> = row.try_get("is_top")?;
    Ok(SourceRecord {
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        publish_time: row
            .try_get::<Option<i64>, _>("publish_time")?
            .unwrap_or_default(),
        source_url: row
            .try_get::<Option<String>, _>("source_url")?
            .unwrap_or_default(),
        content_text: row.try_get("content_text")?,
        status,
        pinned: is_top.unwrap_or(0) != 0,
    })
}

fn score_from_row(row: &SqliteRow) -> Result<u8> {
    let score: Option<i64> = row.try_get("impact_score")?;
    Ok(score.unwrap_or(1).clamp(1, 5) as u8)
}
