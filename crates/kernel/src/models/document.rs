//! Document model: one content entry belonging to a collection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Document record.
///
/// `fields` maps field name to value. For rich-text fields the value is an
/// object mapping language code to markup, e.g.
/// `{"body": {"en": "<p>…</p>", "de": "<p>…</p>"}}`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Document {
    pub id: Uuid,
    pub collection: String,
    pub author_id: Uuid,
    pub title: String,
    pub status: i16,
    pub fields: serde_json::Value,
    pub created: DateTime<Utc>,
    pub changed: DateTime<Utc>,
}

/// Input for inserting a document.
///
/// The id is chosen by the caller: reconciliation records media usage under
/// the document id before the row itself is written.
#[derive(Debug)]
pub struct NewDocument {
    pub id: Uuid,
    pub collection: String,
    pub author_id: Uuid,
    pub title: String,
    pub status: i16,
    pub fields: serde_json::Value,
}

impl Document {
    /// Find a document by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let document = sqlx::query_as::<_, Document>("SELECT * FROM document WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch document by id")?;

        Ok(document)
    }

    /// List documents in a collection, newest first.
    pub async fn list_for_collection(pool: &PgPool, collection: &str) -> Result<Vec<Self>> {
        let documents = sqlx::query_as::<_, Document>(
            "SELECT * FROM document WHERE collection = $1 ORDER BY created DESC",
        )
        .bind(collection)
        .fetch_all(pool)
        .await
        .context("failed to list documents")?;

        Ok(documents)
    }

    /// Insert a new document.
    pub async fn create(pool: &PgPool, input: NewDocument) -> Result<Self> {
        let document = sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO document (id, collection, author_id, title, status, fields)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(input.id)
        .bind(&input.collection)
        .bind(input.author_id)
        .bind(&input.title)
        .bind(input.status)
        .bind(&input.fields)
        .fetch_one(pool)
        .await
        .context("failed to create document")?;

        Ok(document)
    }

    /// Replace a document's title, status and fields.
    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        title: &str,
        status: i16,
        fields: &serde_json::Value,
    ) -> Result<Option<Self>> {
        let document = sqlx::query_as::<_, Document>(
            r#"
            UPDATE document
            SET title = $1, status = $2, fields = $3, changed = NOW()
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(title)
        .bind(status)
        .bind(fields)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to update document")?;

        Ok(document)
    }

    /// Delete a document.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM document WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete document")?;

        Ok(result.rows_affected() > 0)
    }
}
