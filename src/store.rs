use crate::slug::slugify;
use crate::types::{ExtractionState, Feed, FeedItem, NormalizedEntry, Result, Source};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of attempting to persist one normalized entry.
#[derive(Debug)]
pub enum StoreOutcome {
    Created(FeedItem),
    /// A concurrent run already inserted this link. Success-as-duplicate,
    /// not an error.
    AlreadyExists,
}

/// Persists accepted entries as feed items. The unique index on `items.link`
/// is enforced here at insert time, not just pre-checked, which closes the
/// race between the deduplicator's lookup and the write.
pub struct ItemStore {
    pool: SqlitePool,
}

impl ItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the entry as a new item, or report that the link already
    /// exists. The item and its tags land in one transaction: an item write
    /// is atomic, either fully persisted with its link or absent.
    pub async fn acquire_or_skip(
        &self,
        entry: &NormalizedEntry,
        feed: &Feed,
        source: &Source,
    ) -> Result<StoreOutcome> {
        debug_assert_eq!(feed.source_id, source.id);

        let item = FeedItem {
            id: Uuid::new_v4(),
            source_id: source.id,
            feed_id: feed.id,
            title: entry.title.clone(),
            slug: slugify(&entry.title),
            date: entry.published,
            link: entry.link.clone(),
            summary: entry.summary.clone(),
            content: entry.content.clone(),
            is_full_text: entry.is_full_text,
            public: true,
            allow_comments: false,
            extraction: ExtractionState::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO items
                (id, source_id, feed_id, title, slug, date, link, summary, content,
                 is_full_text, public, allow_comments, extraction, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT (link) DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(item.source_id)
        .bind(item.feed_id)
        .bind(&item.title)
        .bind(&item.slug)
        .bind(item.date)
        .bind(&item.link)
        .bind(&item.summary)
        .bind(&item.content)
        .bind(item.is_full_text)
        .bind(item.public)
        .bind(item.allow_comments)
        .bind(item.extraction.as_str())
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("lost insert race for {}", item.link);
            return Ok(StoreOutcome::AlreadyExists);
        }

        for tag in &entry.tags {
            let tag_id = Uuid::new_v4();
            sqlx::query("INSERT INTO tags (id, name) VALUES (?1, ?2) ON CONFLICT (name) DO NOTHING")
                .bind(tag_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;

            let tag_id: Uuid = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?1")
                .bind(tag)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO item_tags (item_id, tag_id) VALUES (?1, ?2)
                ON CONFLICT (item_id, tag_id) DO NOTHING
                "#,
            )
            .bind(item.id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!("stored item '{}' ({})", item.title, item.link);
        Ok(StoreOutcome::Created(item))
    }

    pub async fn get_by_link(&self, link: &str) -> Result<Option<FeedItem>> {
        let row = sqlx::query("SELECT * FROM items WHERE link = ?1")
            .bind(link)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    /// Tag names attached to an item.
    pub async fn tags_for_item(&self, item_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            r#"
            SELECT tags.name FROM tags
            JOIN item_tags ON item_tags.tag_id = tags.id
            WHERE item_tags.item_id = ?1
            ORDER BY tags.name
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

pub(crate) fn item_from_row(row: &SqliteRow) -> Result<FeedItem> {
    let extraction: String = row.try_get("extraction")?;

    Ok(FeedItem {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        feed_id: row.try_get("feed_id")?,
        title: row.try_get("title")?,
        slug: row.try_get("slug")?,
        date: row.try_get::<DateTime<Utc>, _>("date")?,
        link: row.try_get("link")?,
        summary: row.try_get("summary")?,
        content: row.try_get("content")?,
        is_full_text: row.try_get("is_full_text")?,
        public: row.try_get("public")?,
        allow_comments: row.try_get("allow_comments")?,
        extraction: ExtractionState::parse(&extraction)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}
