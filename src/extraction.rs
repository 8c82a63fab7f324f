use crate::config::ExtractionConfig;
use crate::entities::EntityCatalog;
use crate::slug::slugify;
use crate::store::item_from_row;
use crate::types::{ExtractionState, FeedItem, IngestError, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One entity recognized in a piece of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub type_label: String,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// The external entity-recognition capability: plain text in, typed entities
/// out. Injected explicitly; its absence is modeled as `Option` at the
/// dispatcher, never as a nullable global.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>>;
}

#[derive(Deserialize)]
struct ExtractionResponse {
    entities: Vec<ExtractedEntity>,
}

/// HTTP client for the extraction service. The wire contract is the
/// service's own; we only rely on text-in / entities-out.
pub struct HttpEntityExtractor {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpEntityExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl EntityExtractor for HttpEntityExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| IngestError::Extraction(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // 429s land here too; the dispatcher's backoff handles them.
            return Err(IngestError::Extraction(format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let body: ExtractionResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Extraction(format!("malformed response: {}", e)))?;

        Ok(body.entities)
    }
}

/// How a dispatch attempt ended for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Entities reconciled; carries the number of new associations.
    Extracted(usize),
    /// No capability configured; the item will not be revisited.
    Skipped,
    /// The capability kept failing; parked for a later retry pass.
    Deferred,
}

/// Result of a deferred-item retry pass.
#[derive(Debug, Default, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub completed: usize,
    pub entities_linked: usize,
    pub still_deferred: usize,
}

/// Submits item text to the extraction capability and reconciles the results
/// into the entity catalog. Failures are contained: an item that cannot be
/// extracted is deferred, never dropped, and never blocks ingestion of other
/// items.
pub struct ExtractionDispatcher {
    pool: SqlitePool,
    catalog: EntityCatalog,
    extractor: Option<Arc<dyn EntityExtractor>>,
    max_attempts: u32,
    retry_base: Duration,
}

impl ExtractionDispatcher {
    pub fn new(
        pool: SqlitePool,
        extractor: Option<Arc<dyn EntityExtractor>>,
        max_attempts: u32,
        retry_base: Duration,
    ) -> Self {
        let catalog = EntityCatalog::new(pool.clone());
        Self {
            pool,
            catalog,
            extractor,
            max_attempts: max_attempts.max(1),
            retry_base,
        }
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub async fn dispatch(&self, item: &FeedItem) -> Result<DispatchOutcome> {
        let extractor = match &self.extractor {
            Some(extractor) => extractor,
            None => {
                self.mark(item.id, ExtractionState::Skipped).await?;
                debug!("no extraction capability, skipping {}", item.link);
                return Ok(DispatchOutcome::Skipped);
            }
        };

        let text = compose_text(item);

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.retry_base,
            initial_interval: self.retry_base,
            max_interval: self.retry_base * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        for attempt in 1..=self.max_attempts {
            match extractor.extract(&text).await {
                Ok(found) => {
                    let linked = self.reconcile(item, &found).await?;
                    self.mark(item.id, ExtractionState::Done).await?;
                    return Ok(DispatchOutcome::Extracted(linked));
                }
                Err(e) => {
                    warn!(
                        "extraction attempt {}/{} failed for {}: {}",
                        attempt, self.max_attempts, item.link, e
                    );
                    if attempt < self.max_attempts {
                        if let Some(delay) = backoff.next_backoff() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        self.mark(item.id, ExtractionState::Deferred).await?;
        Ok(DispatchOutcome::Deferred)
    }

    /// Re-run extraction for items a previous cycle deferred.
    pub async fn retry_deferred(&self) -> Result<RetrySummary> {
        let rows = sqlx::query("SELECT * FROM items WHERE extraction = ?1 ORDER BY created_at")
            .bind(ExtractionState::Deferred.as_str())
            .fetch_all(&self.pool)
            .await?;

        let items: Vec<FeedItem> = rows.iter().map(item_from_row).collect::<Result<_>>()?;

        let mut summary = RetrySummary::default();
        for item in &items {
            summary.attempted += 1;
            match self.dispatch(item).await? {
                DispatchOutcome::Extracted(linked) => {
                    summary.completed += 1;
                    summary.entities_linked += linked;
                }
                DispatchOutcome::Deferred => summary.still_deferred += 1,
                // Capability removed since the item was deferred.
                DispatchOutcome::Skipped => {}
            }
        }

        info!(
            "extraction retry pass: {}/{} completed",
            summary.completed, summary.attempted
        );
        Ok(summary)
    }

    /// Fold extraction results into the catalog. Duplicate (name, type)
    /// pairs in one result set converge on a single entity and a single
    /// association.
    async fn reconcile(&self, item: &FeedItem, found: &[ExtractedEntity]) -> Result<usize> {
        let mut linked = 0;

        for extracted in found {
            if slugify(&extracted.name).is_empty() || slugify(&extracted.type_label).is_empty() {
                warn!(
                    "ignoring unusable extraction result ('{}', '{}')",
                    extracted.name, extracted.type_label
                );
                continue;
            }

            let ty = self.catalog.resolve_type(&extracted.type_label).await?;
            let entity = self.catalog.resolve_entity(&ty, &extracted.name).await?;
            if self.catalog.associate(item.id, entity.id).await? {
                linked += 1;
            }
        }

        debug!("linked {} entities to {}", linked, item.link);
        Ok(linked)
    }

    async fn mark(&self, item_id: Uuid, state: ExtractionState) -> Result<()> {
        sqlx::query("UPDATE items SET extraction = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(state.as_str())
            .bind(chrono::Utc::now())
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn compose_text(item: &FeedItem) -> String {
    format!("{}\n\n{}\n\n{}", item.title, item.summary, item.content)
}
