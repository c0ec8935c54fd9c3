//! Role model.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Role record.
///
/// Roles are referenced by name from user records and from collection
/// permission maps. The `admin` and `editor` roles are seeded by the initial
/// migration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub is_admin: bool,
    pub permissions: serde_json::Value,
    pub created: DateTime<Utc>,
}

impl Role {
    /// Find a role by name.
    pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Self>> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .context("failed to fetch role by name")?;

        Ok(role)
    }

    /// The role's permission strings as a set.
    ///
    /// `permissions` is stored as a JSON array of strings; `"*"` grants
    /// everything. Non-string entries are ignored.
    pub fn permission_set(&self) -> HashSet<String> {
        self.permissions
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn role_with(permissions: serde_json::Value) -> Role {
        Role {
            id: Uuid::now_v7(),
            name: "editor".to_string(),
            label: "Editor".to_string(),
            is_admin: false,
            permissions,
            created: Utc::now(),
        }
    }

    #[test]
    fn test_permission_set() {
        let role = role_with(json!(["read", "write"]));
        let set = role.permission_set();
        assert!(set.contains("read"));
        assert!(set.contains("write"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_permission_set_ignores_junk() {
        assert!(role_with(json!("not an array")).permission_set().is_empty());
        assert_eq!(role_with(json!(["read", 42, null])).permission_set().len(), 1);
    }
}
