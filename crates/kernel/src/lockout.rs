//! Account lockout service using Redis.
//!
//! Tracks failed login attempts per login email and temporarily locks the
//! account after too many failures within the tracking window. Keys live
//! under the `intarsio:auth:` prefix so the counters are easy to find next
//! to the session keys in the same Redis instance.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::Client as RedisClient;

/// Maximum failed attempts before lockout.
const MAX_FAILED_ATTEMPTS: u32 = 5;

/// Lockout duration in seconds (15 minutes).
const LOCKOUT_DURATION_SECS: u64 = 15 * 60;

/// Failed attempt tracking window in seconds (15 minutes).
const ATTEMPT_WINDOW_SECS: u64 = 15 * 60;

/// An active lock on an account.
#[derive(Debug, Clone, Copy)]
pub struct LockStatus {
    /// Seconds until the lock expires.
    pub remaining_secs: u64,
}

impl LockStatus {
    /// The message shown to the locked-out user, with the remaining time
    /// rounded up to whole minutes.
    pub fn client_message(&self) -> String {
        let minutes = self.remaining_secs.div_ceil(60).max(1);
        if minutes == 1 {
            "Account temporarily locked. Try again in 1 minute.".to_string()
        } else {
            format!("Account temporarily locked. Try again in {minutes} minutes.")
        }
    }
}

/// Account lockout service.
#[derive(Clone)]
pub struct LockoutService {
    redis: RedisClient,
}

impl LockoutService {
    /// Create a new lockout service.
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    /// Return the active lock on an account, if any.
    ///
    /// A single TTL lookup answers both questions: a positive TTL means the
    /// lock key exists and says how long it has left.
    pub async fn active_lock(&self, mail: &str) -> Result<Option<LockStatus>> {
        let key = lockout_key(mail);

        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .context("failed to get Redis connection")?;

        let ttl: i64 = conn.ttl(&key).await.context("failed to get lockout TTL")?;

        if ttl > 0 {
            Ok(Some(LockStatus {
                remaining_secs: ttl as u64,
            }))
        } else {
            Ok(None)
        }
    }

    /// Record a failed login attempt.
    ///
    /// Returns (is_now_locked, attempts_remaining).
    pub async fn record_failed_attempt(&self, mail: &str) -> Result<(bool, u32)> {
        let attempts_key = attempts_key(mail);
        let lockout_key = lockout_key(mail);

        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .context("failed to get Redis connection")?;

        let attempts: u32 = conn
            .incr(&attempts_key, 1)
            .await
            .context("failed to increment attempt counter")?;

        // The window starts at the first failure.
        if attempts == 1 {
            conn.expire::<_, ()>(&attempts_key, ATTEMPT_WINDOW_SECS as i64)
                .await
                .context("failed to set attempt expiry")?;
        }

        if attempts >= MAX_FAILED_ATTEMPTS {
            conn.set_ex::<_, _, ()>(&lockout_key, "locked", LOCKOUT_DURATION_SECS)
                .await
                .context("failed to set lockout")?;

            // Counter resets; a fresh window starts after the lock expires.
            conn.del::<_, ()>(&attempts_key)
                .await
                .context("failed to clear attempt counter")?;

            tracing::warn!(mail = %mail, "account locked due to failed attempts");

            return Ok((true, 0));
        }

        let remaining = MAX_FAILED_ATTEMPTS - attempts;
        Ok((false, remaining))
    }

    /// Clear failed attempts after successful login.
    pub async fn clear_attempts(&self, mail: &str) -> Result<()> {
        let attempts_key = attempts_key(mail);

        let mut conn = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .context("failed to get Redis connection")?;

        conn.del::<_, ()>(&attempts_key)
            .await
            .context("failed to clear attempt counter")?;

        Ok(())
    }
}

fn attempts_key(mail: &str) -> String {
    format!("intarsio:auth:attempts:{mail}")
}

fn lockout_key(mail: &str) -> String {
    format!("intarsio:auth:locked:{mail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_rounds_up_to_minutes() {
        let message = |secs| LockStatus { remaining_secs: secs }.client_message();

        assert_eq!(
            message(1),
            "Account temporarily locked. Try again in 1 minute."
        );
        assert_eq!(
            message(60),
            "Account temporarily locked. Try again in 1 minute."
        );
        assert_eq!(
            message(61),
            "Account temporarily locked. Try again in 2 minutes."
        );
        assert_eq!(
            message(LOCKOUT_DURATION_SECS),
            "Account temporarily locked. Try again in 15 minutes."
        );
    }

    #[test]
    fn test_keys_are_namespaced_per_account() {
        assert_eq!(
            attempts_key("a@example.com"),
            "intarsio:auth:attempts:a@example.com"
        );
        assert_eq!(
            lockout_key("a@example.com"),
            "intarsio:auth:locked:a@example.com"
        );
        assert_ne!(lockout_key("a@example.com"), lockout_key("b@example.com"));
    }
}
