//! Registration token model for invite-based signup.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

/// Default token validity period (48 hours).
pub const DEFAULT_TOKEN_VALIDITY_HOURS: i64 = 48;

/// Registration token record.
///
/// The plain token is returned exactly once at creation (and mailed to the
/// invitee); only its SHA-256 hash is stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RegistrationToken {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub email: String,
    /// Role the invitee is granted at signup.
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// Partial update for a registration token.
#[derive(Debug, Default)]
pub struct UpdateRegistrationToken {
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
}

impl RegistrationToken {
    /// Create a new registration token.
    ///
    /// Returns `(token_record, plain_token)` where `plain_token` should be
    /// sent to the invitee via email.
    pub async fn create(
        pool: &PgPool,
        email: &str,
        token_type: &str,
        validity_hours: i64,
    ) -> Result<(Self, String)> {
        let plain_token = generate_token();
        let token_hash = hash_token(&plain_token);

        let id = Uuid::now_v7();
        let expires_at = Utc::now() + Duration::hours(validity_hours);

        let record = sqlx::query_as::<_, RegistrationToken>(
            r#"
            INSERT INTO registration_tokens (id, token_hash, email, token_type, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&token_hash)
        .bind(email)
        .bind(token_type)
        .bind(expires_at)
        .fetch_one(pool)
        .await
        .context("failed to create registration token")?;

        Ok((record, plain_token))
    }

    /// Find a token by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let token =
            sqlx::query_as::<_, RegistrationToken>("SELECT * FROM registration_tokens WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("failed to fetch registration token by id")?;

        Ok(token)
    }

    /// Find an unexpired, unused token by its plain text value.
    pub async fn find_valid(pool: &PgPool, plain_token: &str) -> Result<Option<Self>> {
        let token_hash = hash_token(plain_token);

        let token = sqlx::query_as::<_, RegistrationToken>(
            r#"
            SELECT * FROM registration_tokens
            WHERE token_hash = $1
              AND expires_at > NOW()
              AND used_at IS NULL
            "#,
        )
        .bind(&token_hash)
        .fetch_optional(pool)
        .await
        .context("failed to find registration token")?;

        Ok(token)
    }

    /// List all tokens, newest first.
    pub async fn list(pool: &PgPool) -> Result<Vec<Self>> {
        let tokens = sqlx::query_as::<_, RegistrationToken>(
            "SELECT * FROM registration_tokens ORDER BY created DESC",
        )
        .fetch_all(pool)
        .await
        .context("failed to list registration tokens")?;

        Ok(tokens)
    }

    /// Apply a partial update to a token.
    ///
    /// Returns the updated record, or `None` when no token has this id.
    pub async fn update(
        pool: &PgPool,
        id: Uuid,
        input: UpdateRegistrationToken,
    ) -> Result<Option<Self>> {
        // Build dynamic update query
        let mut assignments: Vec<String> = Vec::new();
        let mut param_idx = 1;

        if input.email.is_some() {
            assignments.push(format!("email = ${param_idx}"));
            param_idx += 1;
        }
        if input.expires_at.is_some() {
            assignments.push(format!("expires_at = ${param_idx}"));
            param_idx += 1;
        }
        if input.token_type.is_some() {
            assignments.push(format!("token_type = ${param_idx}"));
            param_idx += 1;
        }

        if assignments.is_empty() {
            // Nothing to update, just return the token
            return Self::find_by_id(pool, id).await;
        }

        let query = format!(
            "UPDATE registration_tokens SET {} WHERE id = ${param_idx} RETURNING *",
            assignments.join(", ")
        );

        let mut query_builder = sqlx::query_as::<_, RegistrationToken>(&query);

        if let Some(ref email) = input.email {
            query_builder = query_builder.bind(email);
        }
        if let Some(expires_at) = input.expires_at {
            query_builder = query_builder.bind(expires_at);
        }
        if let Some(ref token_type) = input.token_type {
            query_builder = query_builder.bind(token_type);
        }
        query_builder = query_builder.bind(id);

        let token = query_builder
            .fetch_optional(pool)
            .await
            .context("failed to update registration token")?;

        Ok(token)
    }

    /// Mark a token as used.
    pub async fn mark_used(pool: &PgPool, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE registration_tokens SET used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to mark registration token as used")?;

        Ok(())
    }

    /// Delete a token.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM registration_tokens WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete registration token")?;

        Ok(result.rows_affected() > 0)
    }
}

/// Generate a secure random token.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Hash a token for storage using SHA-256.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hashing() {
        let token = "test_registration_token";
        let hash1 = hash_token(token);
        let hash2 = hash_token(token);

        // Same token should produce same hash
        assert_eq!(hash1, hash2);

        // Different token should produce different hash
        let hash3 = hash_token("different_token");
        assert_ne!(hash1, hash3);

        // Hash should be hex-encoded SHA-256 (64 chars)
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_token_generation() {
        let token1 = generate_token();
        let token2 = generate_token();

        // Tokens should be different
        assert_ne!(token1, token2);

        // Tokens should be 64 hex chars (32 bytes)
        assert_eq!(token1.len(), 64);
    }
}
