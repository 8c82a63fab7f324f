use crate::slug::slugify;
use crate::types::{Entity, EntityType, IngestError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// The catalog of entity types and entities, reconciled create-if-absent.
///
/// Creation is idempotent under races: every insert goes through
/// `ON CONFLICT DO NOTHING` and a conflict means some concurrent task created
/// the row first, so we re-read instead of failing. No in-process locking;
/// the unique slug indexes are the synchronization point.
pub struct EntityCatalog {
    pool: SqlitePool,
}

impl EntityCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve an entity type by its slugified name, creating it on first
    /// sight.
    pub async fn resolve_type(&self, name: &str) -> Result<EntityType> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(IngestError::Extraction(format!(
                "entity type '{}' yields an empty slug",
                name
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO entity_types (id, name, slug, description)
            VALUES (?1, ?2, ?3, '')
            ON CONFLICT (slug) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(&slug)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM entity_types WHERE slug = ?1")
            .bind(&slug)
            .fetch_one(&self.pool)
            .await?;

        entity_type_from_row(&row)
    }

    /// Resolve an entity by name within a type, creating it on first sight.
    ///
    /// Entity slugs are unique across the whole catalog, not per type, so a
    /// name collision with an entity of another type is disambiguated by
    /// suffixing the type slug (and a counter if even that is taken) before
    /// creation.
    pub async fn resolve_entity(&self, ty: &EntityType, name: &str) -> Result<Entity> {
        let base = slugify(name);
        if base.is_empty() {
            return Err(IngestError::Extraction(format!(
                "entity name '{}' yields an empty slug",
                name
            )));
        }

        let mut candidate = base.clone();
        let mut counter = 2u32;

        loop {
            let now = Utc::now();
            let inserted = sqlx::query(
                r#"
                INSERT INTO entities (id, type_id, name, slug, description, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, '', ?5, ?6)
                ON CONFLICT (slug) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(ty.id)
            .bind(name)
            .bind(&candidate)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

            let existing = sqlx::query("SELECT * FROM entities WHERE slug = ?1")
                .bind(&candidate)
                .fetch_optional(&self.pool)
                .await?;

            let existing = match existing {
                Some(row) => entity_from_row(&row)?,
                // The slug vanished between insert and read; try again.
                None => continue,
            };

            if inserted > 0 {
                info!("created entity '{}' ({})", name, existing.slug);
                return Ok(existing);
            }
            if existing.type_id == ty.id && existing.name == name {
                return Ok(existing);
            }

            // Slug taken by a different entity: disambiguate and retry.
            debug!(
                "slug '{}' taken by another entity, disambiguating '{}'",
                candidate, name
            );
            if candidate == base {
                candidate = format!("{}-{}", base, ty.slug);
            } else {
                candidate = format!("{}-{}-{}", base, ty.slug, counter);
                counter += 1;
            }
        }
    }

    /// Associate an entity with an item. Returns whether a new association
    /// was written; repeating the pair is a no-op.
    pub async fn associate(&self, item_id: Uuid, entity_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO item_entities (item_id, entity_id) VALUES (?1, ?2)
            ON CONFLICT (item_id, entity_id) DO NOTHING
            "#,
        )
        .bind(item_id)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn entities_for_item(&self, item_id: Uuid) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            r#"
            SELECT entities.* FROM entities
            JOIN item_entities ON item_entities.entity_id = entities.id
            WHERE item_entities.item_id = ?1
            ORDER BY entities.name
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entity_from_row).collect()
    }
}

fn entity_type_from_row(row: &SqliteRow) -> Result<EntityType> {
    Ok(EntityType {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        description: row.try_get("description")?,
    })
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    Ok(Entity {
        id: row.try_get("id")?,
        type_id: row.try_get("type_id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        description: row.try_get("description")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}
