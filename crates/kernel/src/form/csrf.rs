//! CSRF token generation and verification.
//!
//! Tokens are stored in the session as `token:timestamp` strings. They are
//! single-use and time-limited, with a small cap per session so a page that
//! is reloaded repeatedly cannot grow the session without bound.

use anyhow::{Result, bail};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tower_sessions::Session;

/// Session key for storing CSRF tokens.
const CSRF_SESSION_KEY: &str = "csrf_tokens";

/// Maximum number of tokens to store per session.
const MAX_TOKENS: usize = 10;

/// Token validity period in seconds (1 hour).
const TOKEN_VALIDITY_SECS: i64 = 3600;

/// Generate a CSRF token and store it in the session.
pub async fn generate_csrf_token(session: &Session) -> Result<String> {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);

    let timestamp = chrono::Utc::now().timestamp();

    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(timestamp.to_le_bytes());
    let token = hex::encode(hasher.finalize());

    let mut tokens: Vec<String> = session
        .get(CSRF_SESSION_KEY)
        .await
        .unwrap_or(None)
        .unwrap_or_default();

    tokens.push(format!("{token}:{timestamp}"));

    // Keep only the most recent tokens.
    if tokens.len() > MAX_TOKENS {
        let skip = tokens.len() - MAX_TOKENS;
        tokens = tokens.into_iter().skip(skip).collect();
    }

    session
        .insert(CSRF_SESSION_KEY, tokens)
        .await
        .map_err(|e| anyhow::anyhow!("failed to store CSRF token: {e}"))?;

    Ok(token)
}

/// Verify a CSRF token against the session.
///
/// A matching, unexpired token is removed (single-use) and expired tokens
/// are pruned in the same write.
pub async fn verify_csrf_token(session: &Session, submitted: &str) -> Result<bool> {
    if submitted.is_empty() {
        bail!("empty CSRF token");
    }

    let mut tokens: Vec<String> = session
        .get(CSRF_SESSION_KEY)
        .await
        .unwrap_or(None)
        .unwrap_or_default();

    if tokens.is_empty() {
        return Ok(false);
    }

    let now = chrono::Utc::now().timestamp();

    let found_index = tokens.iter().position(|entry| {
        let Some((token, timestamp)) = parse_entry(entry) else {
            return false;
        };
        token == submitted && now - timestamp <= TOKEN_VALIDITY_SECS
    });

    let Some(index) = found_index else {
        return Ok(false);
    };

    tokens.remove(index);
    tokens.retain(|entry| {
        parse_entry(entry).is_some_and(|(_, timestamp)| now - timestamp <= TOKEN_VALIDITY_SECS)
    });

    session
        .insert(CSRF_SESSION_KEY, tokens)
        .await
        .map_err(|e| anyhow::anyhow!("failed to update CSRF tokens: {e}"))?;

    Ok(true)
}

fn parse_entry(entry: &str) -> Option<(&str, i64)> {
    let (token, timestamp) = entry.split_once(':')?;
    Some((token, timestamp.parse().ok()?))
}
