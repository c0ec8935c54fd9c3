//! Media image model and the `used_by` owner index.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Stored media image record.
///
/// `variants` maps a configured size name (`sm`, `md`, …) to the storage URI
/// of that resized rendition. The set of documents referencing an image (its
/// owner set) lives in the `media_usage` join table, not on this row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaImage {
    pub id: Uuid,
    pub filename: String,
    pub uri: String,
    pub mime_type: String,
    pub filesize: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub variants: serde_json::Value,
    pub uploaded_by: Uuid,
    pub created: DateTime<Utc>,
    pub changed: DateTime<Utc>,
}

/// Input for inserting a media image record.
#[derive(Debug)]
pub struct NewMediaImage {
    pub id: Uuid,
    pub filename: String,
    pub uri: String,
    pub mime_type: String,
    pub filesize: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub variants: serde_json::Value,
    pub uploaded_by: Uuid,
}

impl MediaImage {
    /// Find a media image by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let image = sqlx::query_as::<_, MediaImage>("SELECT * FROM media_image WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch media image by id")?;

        Ok(image)
    }

    /// Insert a new media image record.
    pub async fn create(pool: &PgPool, input: NewMediaImage) -> Result<Self> {
        let image = sqlx::query_as::<_, MediaImage>(
            r#"
            INSERT INTO media_image
                (id, filename, uri, mime_type, filesize, width, height, variants, uploaded_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(input.id)
        .bind(&input.filename)
        .bind(&input.uri)
        .bind(&input.mime_type)
        .bind(input.filesize)
        .bind(input.width)
        .bind(input.height)
        .bind(&input.variants)
        .bind(input.uploaded_by)
        .fetch_one(pool)
        .await
        .context("failed to create media image record")?;

        Ok(image)
    }

    /// Add a document to an image's owner set.
    ///
    /// Idempotent: inserting an existing (media, document) pair is a no-op,
    /// never a duplicate and never an error. Returns false when no media
    /// record with this id exists, leaving the owner index untouched.
    pub async fn add_usage(pool: &PgPool, media_id: Uuid, document_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM media_image WHERE id = $1)")
                .bind(media_id)
                .fetch_one(pool)
                .await
                .context("failed to check media image existence")?;

        if !exists {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO media_usage (media_id, document_id)
            VALUES ($1, $2)
            ON CONFLICT (media_id, document_id) DO NOTHING
            "#,
        )
        .bind(media_id)
        .bind(document_id)
        .execute(pool)
        .await
        .context("failed to record media usage")?;

        Ok(true)
    }

    /// Remove a document from one image's owner set.
    pub async fn remove_usage(pool: &PgPool, media_id: Uuid, document_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM media_usage WHERE media_id = $1 AND document_id = $2")
                .bind(media_id)
                .bind(document_id)
                .execute(pool)
                .await
                .context("failed to remove media usage")?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a document from every image's owner set.
    ///
    /// Returns the number of owner links removed.
    pub async fn detach_document(pool: &PgPool, document_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM media_usage WHERE document_id = $1")
            .bind(document_id)
            .execute(pool)
            .await
            .context("failed to detach document from media usage")?;

        Ok(result.rows_affected())
    }

    /// Number of documents currently referencing an image.
    pub async fn usage_count(pool: &PgPool, media_id: Uuid) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM media_usage WHERE media_id = $1")
                .bind(media_id)
                .fetch_one(pool)
                .await
                .context("failed to count media usage")?;

        Ok(count)
    }

    /// Delete a media image record.
    ///
    /// Owner links cascade away with the row.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM media_image WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete media image record")?;

        Ok(result.rows_affected() > 0)
    }

    /// Images no document references, oldest first.
    pub async fn list_orphans(pool: &PgPool, limit: i64) -> Result<Vec<Self>> {
        let images = sqlx::query_as::<_, MediaImage>(
            r#"
            SELECT m.* FROM media_image m
            WHERE NOT EXISTS (SELECT 1 FROM media_usage u WHERE u.media_id = m.id)
            ORDER BY m.created
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("failed to list orphaned media images")?;

        Ok(images)
    }
}
