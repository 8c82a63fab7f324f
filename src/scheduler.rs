use crate::config::IngestConfig;
use crate::dedup::{Deduplicator, Disposition};
use crate::extraction::{DispatchOutcome, EntityExtractor, ExtractionDispatcher, RetrySummary};
use crate::fetcher::Fetcher;
use crate::parser::parse_document;
use crate::registry::FeedRegistry;
use crate::store::{ItemStore, StoreOutcome};
use crate::types::{Feed, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What one cycle covers.
#[derive(Debug, Clone)]
pub enum CycleScope {
    /// Every active feed.
    All,
    /// Active feeds of one source, by source slug.
    Source(String),
    /// One feed, by id or URL. Still respects the active flag.
    Feed(String),
}

/// A feed that failed this cycle and why.
#[derive(Debug, Clone, Serialize)]
pub struct FeedFailure {
    pub feed_id: Uuid,
    pub url: String,
    pub reason: String,
}

/// Per-run accounting. Every fetched entry ends up in here somewhere:
/// created, counted as duplicate, or covered by a feed failure.
#[derive(Debug, Default, Serialize)]
pub struct CycleSummary {
    pub feeds_attempted: usize,
    pub items_created: usize,
    pub items_duplicate: usize,
    pub entities_linked: usize,
    pub extraction_skipped: usize,
    pub extraction_deferred: usize,
    pub feeds_failed: Vec<FeedFailure>,
}

#[derive(Debug, Default)]
struct FeedReport {
    created: usize,
    duplicates: usize,
    entities_linked: usize,
    extraction_skipped: usize,
    extraction_deferred: usize,
}

/// Orchestrates ingestion cycles: feeds fan out across a bounded number of
/// concurrent pipelines, entries within a feed run sequentially, and one
/// feed's failure never touches its siblings.
pub struct Scheduler {
    registry: FeedRegistry,
    fetcher: Fetcher,
    dedup: Deduplicator,
    store: ItemStore,
    dispatcher: ExtractionDispatcher,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        config: &IngestConfig,
        extractor: Option<Arc<dyn EntityExtractor>>,
    ) -> Result<Self> {
        Ok(Self {
            registry: FeedRegistry::new(pool.clone()),
            fetcher: Fetcher::new(&config.fetch)?,
            dedup: Deduplicator::new(pool.clone()),
            store: ItemStore::new(pool.clone()),
            dispatcher: ExtractionDispatcher::new(
                pool,
                extractor,
                config.extraction_attempts,
                config.extraction_retry_base,
            ),
            concurrency: config.concurrency.max(1),
        })
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &ExtractionDispatcher {
        &self.dispatcher
    }

    /// Run one ingestion cycle over the scoped feeds.
    ///
    /// Per-feed fetch/parse failures are recorded in the summary and in the
    /// feed's poll bookkeeping; only catastrophic failures (storage
    /// unreachable) abort the cycle.
    pub async fn run_cycle(&self, scope: &CycleScope) -> Result<CycleSummary> {
        let feeds = self.feeds_for_scope(scope).await?;
        info!("starting ingestion cycle over {} feeds", feeds.len());

        let results: Vec<(Feed, Result<FeedReport>)> = stream::iter(feeds)
            .map(|feed| async move {
                let report = self.process_feed(&feed).await;
                (feed, report)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = CycleSummary::default();

        for (feed, result) in results {
            summary.feeds_attempted += 1;
            match result {
                Ok(report) => {
                    summary.items_created += report.created;
                    summary.items_duplicate += report.duplicates;
                    summary.entities_linked += report.entities_linked;
                    summary.extraction_skipped += report.extraction_skipped;
                    summary.extraction_deferred += report.extraction_deferred;
                    self.registry.record_poll(feed.id, None).await?;
                }
                Err(e) if e.is_fatal() => {
                    error!("aborting cycle: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("feed {} failed: {}", feed.url, reason);
                    self.registry.record_poll(feed.id, Some(&reason)).await?;
                    summary.feeds_failed.push(FeedFailure {
                        feed_id: feed.id,
                        url: feed.url.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            "cycle complete: {} feeds, {} created, {} duplicate, {} failed",
            summary.feeds_attempted,
            summary.items_created,
            summary.items_duplicate,
            summary.feeds_failed.len()
        );
        Ok(summary)
    }

    /// Re-run extraction for items deferred by earlier cycles.
    pub async fn retry_deferred(&self) -> Result<RetrySummary> {
        self.dispatcher.retry_deferred().await
    }

    async fn feeds_for_scope(&self, scope: &CycleScope) -> Result<Vec<Feed>> {
        match scope {
            CycleScope::All => self.registry.list_active_feeds(None).await,
            CycleScope::Source(slug) => {
                // Surface an unknown source instead of silently running an
                // empty cycle.
                self.registry.get_source_by_slug(slug).await?;
                self.registry.list_active_feeds(Some(slug)).await
            }
            CycleScope::Feed(ident) => {
                let feed = match Uuid::parse_str(ident) {
                    Ok(id) => self.registry.get_feed(id).await?,
                    Err(_) => self.registry.get_feed_by_url(ident).await?,
                };
                if feed.active {
                    Ok(vec![feed])
                } else {
                    warn!("feed {} is inactive, nothing to poll", feed.url);
                    Ok(Vec::new())
                }
            }
        }
    }

    /// One feed's pipeline: fetch, parse, then dedup/store/dispatch each
    /// entry in order.
    async fn process_feed(&self, feed: &Feed) -> Result<FeedReport> {
        let source = self.registry.get_source(feed.source_id).await?;
        let body = self.fetcher.fetch(&feed.url).await?;
        let entries = parse_document(&body, feed.format, &feed.url)?;

        let mut report = FeedReport::default();

        for entry in entries {
            if self.dedup.disposition(&entry.link).await? == Disposition::Duplicate {
                report.duplicates += 1;
                continue;
            }

            match self.store.acquire_or_skip(&entry, feed, &source).await? {
                StoreOutcome::AlreadyExists => report.duplicates += 1,
                StoreOutcome::Created(item) => {
                    report.created += 1;
                    match self.dispatcher.dispatch(&item).await? {
                        DispatchOutcome::Extracted(linked) => report.entities_linked += linked,
                        DispatchOutcome::Skipped => report.extraction_skipped += 1,
                        DispatchOutcome::Deferred => report.extraction_deferred += 1,
                    }
                }
            }
        }

        Ok(report)
    }
}
