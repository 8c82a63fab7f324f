use crate::types::Result;
use sqlx::SqlitePool;

/// Whether an entry's link has been seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    New,
    Duplicate,
}

/// Link-based duplicate detection: exact, case-sensitive match against
/// previously ingested items, mirroring the unique index on `items.link`.
///
/// This pre-check is an optimization: it saves building an item that would
/// lose the insert anyway. Correctness against concurrent writers belongs to
/// the storage layer's unique constraint, not to this lookup.
pub struct Deduplicator {
    pool: SqlitePool,
}

impl Deduplicator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn disposition(&self, link: &str) -> Result<Disposition> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM items WHERE link = ?1)")
            .bind(link)
            .fetch_one(&self.pool)
            .await?;

        Ok(if exists {
            Disposition::Duplicate
        } else {
            Disposition::New
        })
    }
}
