use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tevo_core::{day_end, day_start, published_at, Dimension, TimelineEntry, TimelineQuery};
use tevo_sync::{AppConfig, Pipeline, PipelineSummary};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Parser)]
#[command(name = "tevo-cli")]
#[command(about = "Tech evolution tracker command-line interface")]
struct Cli {
    /// JSON config file; defaults to $TEVO_CONFIG, then ./config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass plus the extraction and analysis stages.
    Sync {
        /// Serve the feed from a recorded fixture instead of the workflow API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Create the database schema.
    Migrate,
    /// Serve the read-only reporting API.
    Serve,
    /// Print the evolution timeline of one dimension.
    Timeline(TimelineArgs),
    /// Delete every insight and source record.
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Run the pipeline on the configured cron schedule until Ctrl-C.
    Schedule,
}

#[derive(Debug, Args)]
struct TimelineArgs {
    #[arg(long)]
    list_dimensions: bool,
    /// Label, slug or native label, e.g. `embodied-ai`.
    #[arg(long, short)]
    dimension: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
    /// Only the last N days.
    #[arg(long)]
    days: Option<u32>,
    /// Only the last N months (30 days each).
    #[arg(long)]
    months: Option<u32>,
    /// Start day, YYYY-MM-DD.
    #[arg(long)]
    since: Option<String>,
    /// End day, YYYY-MM-DD.
    #[arg(long)]
    until: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync { fixture: None }) {
        Commands::Sync { fixture } => {
            let pipeline = match fixture {
                Some(path) => fixture_pipeline(config, path).await?,
                None => Pipeline::from_config(config).await?,
            };
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            tevo_sync::open_store(&config).await?;
            println!("schema ready: {}", config.database_path.display());
        }
        Commands::Serve => {
            tevo_web::serve(&config).await?;
        }
        Commands::Timeline(args) => {
            if args.list_dimensions {
                for dim in Dimension::ALL {
                    println!("{:<24} {:<18} {}", dim.label(), dim.slug(), dim.native_label());
                }
                return Ok(());
            }
            let query = timeline_query(&args, Utc::now().timestamp())?;
            let store = tevo_sync::open_store(&config).await?;
            let entries = store.timeline(&query).await?;
            print_timeline(query.dimension, &entries);
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete all records without --yes");
            }
            let store = tevo_sync::open_store(&config).await?;
            let report = store.clear_all().await?;
            println!(
                "cleared {} insights and {} sources",
                report.insights, report.sources
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            let Some(mut sched) = tevo_sync::maybe_build_scheduler(pipeline).await? else {
                bail!("scheduler disabled; set TEVO_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn fixture_pipeline(config: AppConfig, path: PathBuf) -> Result<Pipeline> {
    let store = tevo_sync::open_store(&config).await?;
    let feed = tevo_sync::fixture_feed_factory(&path)
        .with_context(|| format!("loading feed fixture {}", path.display()))?;
    let extractor = tevo_sync::chat_extractor_factory(&config)?;
    let rules = tevo_sync::load_impact_rules(&config)?;
    Ok(Pipeline::new(config, store, feed, extractor, rules))
}

/// `--days`/`--months` win over explicit day bounds.
fn timeline_query(args: &TimelineArgs, now: i64) -> Result<TimelineQuery> {
    let Some(raw) = args.dimension.as_deref() else {
        bail!("--dimension is required (see --list-dimensions)");
    };
    let Some(dimension) = Dimension::parse(raw) else {
        bail!("unknown dimension {raw:?} (see --list-dimensions)");
    };

    let window_days = args
        .days
        .map(i64::from)
        .or(args.months.map(|m| i64::from(m) * 30));
    let (since, until) = match window_days {
        Some(days) => (Some(now - days * SECS_PER_DAY), None),
        None => (
            parse_day(args.since.as_deref(), day_start)?,
            parse_day(args.until.as_deref(), day_end)?,
        ),
    };

    Ok(TimelineQuery {
        dimension,
        since,
        until,
        limit: args.limit,
    })
}

fn parse_day(value: Option<&str>, bound: fn(&str) -> Option<i64>) -> Result<Option<i64>> {
    match value {
        None => Ok(None),
        Some(raw) => bound(raw)
            .map(Some)
            .with_context(|| format!("invalid date {raw:?}, expected YYYY-MM-DD")),
    }
}

fn print_summary(summary: &PipelineSummary) {
    println!(
        "run {} complete: inserted={} (incremental={} backfill={}) pinned={} pages={}",
        summary.run_id,
        summary.sync.inserted_total(),
        summary.sync.inserted_incremental.len(),
        summary.sync.inserted_backfill.len(),
        summary.sync.pinned_ids.len(),
        summary.sync.pages_fetched,
    );
    println!(
        "extraction: ok={} errors={} batches={}",
        summary.extraction.ok, summary.extraction.errors, summary.extraction.batches
    );
    match &summary.analysis {
        Some(report) => println!(
            "analysis: ok={} errors={} batches={}",
            report.ok, report.errors, report.batches
        ),
        None => println!("analysis: skipped (no OpenAI API key)"),
    }
}

fn print_timeline(dimension: Dimension, entries: &[TimelineEntry]) {
    if entries.is_empty() {
        println!("no insights for {}", dimension.label());
        return;
    }
    println!("{} ({} entries)", dimension.label(), entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let when = published_at(entry.publish_time)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| entry.publish_time.to_string());
        println!(
            "{:>3}. [{}] {} / {}  ({}, impact {})",
            i + 1,
            when,
            entry.project_name.as_deref().unwrap_or("-"),
            entry.tech_node.as_deref().unwrap_or("-"),
            entry.evolution_tag.as_deref().unwrap_or("-"),
            entry.impact_score,
        );
        if let Some(summary) = entry.summary.as_deref().filter(|s| !s.is_empty()) {
            println!("     {summary}");
        }
        if let Some(url) = &entry.source_url {
            println!("     {url}");
        }
    }
}
