use crate::slug::slugify;
use crate::types::{Feed, FeedFormat, IngestError, Result, Source};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

/// Durable catalog of sources and feeds. Pure data access; the scheduler
/// never sees a feed this registry did not hand it, so the active filter
/// here is the "never polled when inactive" guarantee.
pub struct FeedRegistry {
    pool: SqlitePool,
}

impl FeedRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_source(
        &self,
        name: &str,
        url: &str,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Source> {
        url::Url::parse(url)?;

        let slug = match slug {
            Some(s) => s.to_string(),
            None => slugify(name),
        };
        if slug.is_empty() {
            return Err(IngestError::Configuration(format!(
                "source name '{}' yields an empty slug",
                name
            )));
        }

        let source = Source {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug,
            description: description.unwrap_or("").to_string(),
            url: url.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO sources (id, name, slug, description, url, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.slug)
        .bind(&source.description)
        .bind(&source.url)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("registered source '{}' ({})", source.name, source.slug);
                Ok(source)
            }
            Err(e) if is_unique_violation(&e, "sources.slug") => Err(IngestError::DuplicateSource {
                slug: source.slug,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_feed(
        &self,
        source: &Source,
        name: &str,
        url: &str,
        format: FeedFormat,
        slug: Option<&str>,
        description: Option<&str>,
    ) -> Result<Feed> {
        let parsed = url::Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(IngestError::Configuration(format!(
                "feed URL must be http(s): {}",
                url
            )));
        }

        let slug = match slug {
            Some(s) => s.to_string(),
            None => slugify(name),
        };
        if slug.is_empty() {
            return Err(IngestError::Configuration(format!(
                "feed name '{}' yields an empty slug",
                name
            )));
        }

        let feed = Feed {
            id: Uuid::new_v4(),
            source_id: source.id,
            name: name.to_string(),
            slug,
            description: description.unwrap_or("").to_string(),
            active: true,
            url: url.to_string(),
            format,
            last_checked_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO feeds
                (id, source_id, name, slug, description, active, url, format, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(feed.id)
        .bind(feed.source_id)
        .bind(&feed.name)
        .bind(&feed.slug)
        .bind(&feed.description)
        .bind(feed.active)
        .bind(&feed.url)
        .bind(feed.format.as_str())
        .bind(feed.created_at)
        .bind(feed.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("registered feed '{}' at {}", feed.name, feed.url);
                Ok(feed)
            }
            Err(e) if is_unique_violation(&e, "feeds.url") => Err(IngestError::DuplicateFeed {
                url: feed.url,
            }),
            Err(e) if is_unique_violation(&e, "feeds.slug") => Err(IngestError::Configuration(
                format!("feed slug '{}' already used for source '{}'", feed.slug, source.slug),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_source(&self, id: Uuid) -> Result<Source> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => source_from_row(&row),
            None => Err(IngestError::SourceNotFound(id.to_string())),
        }
    }

    pub async fn get_source_by_slug(&self, slug: &str) -> Result<Source> {
        let row = sqlx::query("SELECT * FROM sources WHERE slug = ?1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => source_from_row(&row),
            None => Err(IngestError::SourceNotFound(slug.to_string())),
        }
    }

    pub async fn get_feed(&self, id: Uuid) -> Result<Feed> {
        let row = sqlx::query("SELECT * FROM feeds WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => feed_from_row(&row),
            None => Err(IngestError::FeedNotFound(id.to_string())),
        }
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Feed> {
        let row = sqlx::query("SELECT * FROM feeds WHERE url = ?1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => feed_from_row(&row),
            None => Err(IngestError::FeedNotFound(url.to_string())),
        }
    }

    /// Active feeds, optionally narrowed to one source.
    pub async fn list_active_feeds(&self, source_slug: Option<&str>) -> Result<Vec<Feed>> {
        let rows = match source_slug {
            Some(slug) => {
                sqlx::query(
                    r#"
                    SELECT feeds.* FROM feeds
                    JOIN sources ON sources.id = feeds.source_id
                    WHERE feeds.active = 1 AND sources.slug = ?1
                    ORDER BY feeds.created_at
                    "#,
                )
                .bind(slug)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM feeds WHERE active = 1 ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(feed_from_row).collect()
    }

    pub async fn set_active(&self, feed_id: Uuid, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE feeds SET active = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(active)
            .bind(Utc::now())
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::FeedNotFound(feed_id.to_string()));
        }

        info!(
            "feed {} {}",
            feed_id,
            if active { "activated" } else { "deactivated" }
        );
        Ok(())
    }

    /// Poll bookkeeping: stamp the attempt and keep the most recent failure
    /// reason, or clear it on success.
    pub async fn record_poll(&self, feed_id: Uuid, error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE feeds SET last_checked_at = ?1, last_error = ?2, updated_at = ?1
            WHERE id = ?3
            "#,
        )
        .bind(Utc::now())
        .bind(error)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error, column: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.message().contains(column),
        _ => false,
    }
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    Ok(Source {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn feed_from_row(row: &SqliteRow) -> Result<Feed> {
    let format: String = row.try_get("format")?;

    Ok(Feed {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        description: row.try_get("description")?,
        active: row.try_get("active")?,
        url: row.try_get("url")?,
        format: FeedFormat::from_str(&format)?,
        last_checked_at: row.try_get::<Option<DateTime<Utc>>, _>("last_checked_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}
