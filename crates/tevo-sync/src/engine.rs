//! Incremental feed reconciliation and pinned-set maintenance.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;
use tevo_adapters::FeedClient;
use tevo_core::SourceUpsert;
use tevo_storage::Store;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub pin_count: usize,
    pub page_size: u32,
    /// Hard cap on pages fetched in one pass.
    pub max_pages: Option<u32>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            pin_count: 3,
            page_size: 20,
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub watermark_before: Option<i64>,
    pub pinned_ids: Vec<String>,
    pub inserted_incremental: Vec<String>,
    pub inserted_backfill: Vec<String>,
    pub touched_existing: usize,
    pub pages_fetched: u32,
    pub pins_cleared: u64,
}

impl SyncOutcome {
    pub fn inserted_total(&self) -> usize {
        self.inserted_incremental.len() + self.inserted_backfill.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    NothingNew,
    Boundary,
    PageCap,
    Exhausted,
    CursorStalled,
}

/// Walks the feed newest-first and reconciles it against the store.
///
/// With an empty store every page is read until the feed runs out (backfill). Otherwise
/// only items strictly newer than the store's max publish time are inserted, and paging
/// stops at the first page holding an item at or below that watermark.
pub struct SyncEngine<'a> {
    store: &'a Store,
    feed: &'a dyn FeedClient,
    options: SyncOptions,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a Store, feed: &'a dyn FeedClient, options: SyncOptions) -> Self {
        Self {
            store,
            feed,
            options,
        }
    }

    pub async fn run(&self) -> Result<SyncOutcome> {
        let watermark = self.store.max_publish_time().await?;
        let mut outcome = SyncOutcome {
            watermark_before: watermark,
            ..SyncOutcome::default()
        };

        let mut pinned: HashSet<String> = HashSet::new();
        let mut seen_cursors: HashSet<i64> = HashSet::from([0]);
        let mut cursor = 0i64;

        let stop = loop {
            if self
                .options
                .max_pages
                .is_some_and(|cap| outcome.pages_fetched >= cap)
            {
                break StopReason::PageCap;
            }

            let page = self
                .feed
                .fetch_page(cursor, self.options.page_size)
                .await
                .with_context(|| format!("fetching feed page at cursor {cursor}"))?;
            outcome.pages_fetched += 1;

            if outcome.pages_fetched == 1 {
                outcome.pinned_ids = page
                    .items
                    .iter()
                    .take(self.options.pin_count)
                    .map(|item| item.id.clone())
                    .collect();
                pinned = outcome.pinned_ids.iter().cloned().collect();
            }

            let mut new_in_page = 0usize;
            let mut boundary_hit = false;
            for item in &page.items {
                let is_pinned = pinned.contains(&item.id);
                let is_new = watermark.map_or(true, |w| item.publish_time > w);

                if self.store.source_exists(&item.id).await? {
                    self.store.set_pinned(&item.id, is_pinned).await?;
                    outcome.touched_existing += 1;
                } else if is_new {
                    self.store
                        .upsert_source(&SourceUpsert::pending(item, is_pinned))
                        .await?;
                    if watermark.is_some() {
                        outcome.inserted_incremental.push(item.id.clone());
                    } else {
                        outcome.inserted_backfill.push(item.id.clone());
                    }
                }

                if is_new {
                    new_in_page += 1;
                } else {
                    boundary_hit = true;
                }
            }
            debug!(
                cursor,
                items = page.items.len(),
                new_in_page,
                boundary_hit,
                "reconciled feed page"
            );

            if watermark.is_some() {
                if outcome.pages_fetched == 1 && new_in_page == 0 {
                    break StopReason::NothingNew;
                }
                if boundary_hit {
                    break StopReason::Boundary;
                }
            }

            if !page.has_more {
                break StopReason::Exhausted;
            }
            let Some(next) = page.next_cursor else {
                break StopReason::Exhausted;
            };
            if next == cursor || !seen_cursors.insert(next) {
                warn!(cursor, next, "feed cursor did not advance; stopping pagination");
                break StopReason::CursorStalled;
            }
            cursor = next;
        };

        outcome.pins_cleared = self.store.clear_pins_except(&outcome.pinned_ids).await?;

        info!(
            watermark = ?watermark,
            stop = ?stop,
            pages = outcome.pages_fetched,
            incremental = outcome.inserted_incremental.len(),
            backfill = outcome.inserted_backfill.len(),
            touched = outcome.touched_existing,
            pinned = outcome.pinned_ids.len(),
            pins_cleared = outcome.pins_cleared,
            "sync pass complete"
        );
        Ok(outcome)
    }
}
