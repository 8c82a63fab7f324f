use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A publisher, like the Washington Post. Owns feeds and the items
/// ingested from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Syndication format a feed declares. Never auto-sniffed: a document that
/// parses as something other than the declared format is a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Rss,
    Atom,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Rss => "rss",
            FeedFormat::Atom => "atom",
        }
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rss" => Ok(FeedFormat::Rss),
            "atom" => Ok(FeedFormat::Atom),
            other => Err(IngestError::Configuration(format!(
                "unknown feed format '{}' (expected rss or atom)",
                other
            ))),
        }
    }
}

/// A pollable endpoint belonging to a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub source_id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub active: bool,
    pub url: String,
    pub format: FeedFormat,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A category of extracted entity, e.g. person or organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityType {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
}

/// A named thing recognized in item text. Slugs are unique across ALL
/// entities, not per type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub type_id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where an item stands with respect to entity extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionState {
    /// Not yet dispatched.
    Pending,
    /// Entities reconciled.
    Done,
    /// No extraction capability configured; never revisited.
    Skipped,
    /// The capability failed after bounded retries; picked up by a later pass.
    Deferred,
}

impl ExtractionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionState::Pending => "pending",
            ExtractionState::Done => "done",
            ExtractionState::Skipped => "skipped",
            ExtractionState::Deferred => "deferred",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExtractionState::Pending),
            "done" => Ok(ExtractionState::Done),
            "skipped" => Ok(ExtractionState::Skipped),
            "deferred" => Ok(ExtractionState::Deferred),
            other => Err(IngestError::Configuration(format!(
                "unknown extraction state '{}'",
                other
            ))),
        }
    }
}

/// One ingested article or post. `link` is globally unique and is the sole
/// dedup key; `slug` is display routing only and may collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: Uuid,
    pub source_id: Uuid,
    pub feed_id: Uuid,
    pub title: String,
    pub slug: String,
    pub date: DateTime<Utc>,
    pub link: String,
    pub summary: String,
    pub content: String,
    pub is_full_text: bool,
    pub public: bool,
    pub allow_comments: bool,
    pub extraction: ExtractionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A feed entry after parsing and normalization, before persistence.
#[derive(Debug, Clone)]
pub struct NormalizedEntry {
    pub link: String,
    pub title: String,
    pub published: DateTime<Utc>,
    pub summary: String,
    pub content: String,
    pub is_full_text: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("transport failure fetching {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("could not parse {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("feed URL already registered: {url}")]
    DuplicateFeed { url: String },

    #[error("source slug already registered: {slug}")]
    DuplicateSource { slug: String },

    #[error("entity extraction failed: {0}")]
    Extraction(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("feed not found: {0}")]
    FeedNotFound(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),
}

impl IngestError {
    /// Catastrophic errors abort a whole cycle; everything else is contained
    /// at the per-feed boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Database(_) | IngestError::Migrate(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
