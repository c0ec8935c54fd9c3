//! Collection model: named document schemas with per-role permissions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Widget name marking a field as per-language rich text.
pub const WIDGET_RICH_TEXT: &str = "rich_text";

/// Collection record.
///
/// `fields` is an array of [`FieldDefinition`] objects; `permissions` maps a
/// role name to `{"read": bool, "write": bool}`. A missing role entry or a
/// missing flag means access is allowed; only an explicit `false` denies.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    pub label: String,
    pub fields: serde_json::Value,
    pub permissions: serde_json::Value,
    pub weight: i32,
    pub created: DateTime<Utc>,
    pub changed: DateTime<Utc>,
}

/// One field in a collection schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub widget: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub translated: bool,
}

impl Collection {
    /// Find a collection by name.
    pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Self>> {
        let collection = sqlx::query_as::<_, Collection>("SELECT * FROM collection WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .context("failed to fetch collection by name")?;

        Ok(collection)
    }

    /// List all collections ordered by weight, then name.
    pub async fn list_all(pool: &PgPool) -> Result<Vec<Self>> {
        let collections =
            sqlx::query_as::<_, Collection>("SELECT * FROM collection ORDER BY weight, name")
                .fetch_all(pool)
                .await
                .context("failed to list collections")?;

        Ok(collections)
    }

    /// Parse the field schema. Malformed entries are dropped with a warning.
    pub fn field_definitions(&self) -> Vec<FieldDefinition> {
        let Some(entries) = self.fields.as_array() else {
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| {
                match serde_json::from_value::<FieldDefinition>(entry.clone()) {
                    Ok(def) => Some(def),
                    Err(e) => {
                        tracing::warn!(
                            collection = %self.name,
                            error = %e,
                            "skipping malformed field definition"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Names of fields carrying per-language rich text.
    pub fn rich_text_fields(&self) -> Vec<String> {
        self.field_definitions()
            .into_iter()
            .filter(|f| f.widget == WIDGET_RICH_TEXT)
            .map(|f| f.name)
            .collect()
    }

    /// Whether a role may read documents in this collection.
    ///
    /// Default-allow: denied only when the permission map explicitly says
    /// `read: false` for this role.
    pub fn role_can_read(&self, role: &str) -> bool {
        !self.flag_is_false(role, "read")
    }

    /// Whether a role may create or update documents in this collection.
    pub fn role_can_write(&self, role: &str) -> bool {
        !self.flag_is_false(role, "write")
    }

    fn flag_is_false(&self, role: &str, action: &str) -> bool {
        self.permissions
            .get(role)
            .and_then(|entry| entry.get(action))
            .and_then(|flag| flag.as_bool())
            == Some(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection_with(fields: serde_json::Value, permissions: serde_json::Value) -> Collection {
        Collection {
            id: Uuid::now_v7(),
            name: "posts".to_string(),
            label: "Posts".to_string(),
            fields,
            permissions,
            weight: 0,
            created: Utc::now(),
            changed: Utc::now(),
        }
    }

    #[test]
    fn test_rich_text_fields() {
        let collection = collection_with(
            json!([
                {"name": "title", "widget": "text", "required": true},
                {"name": "body", "widget": "rich_text", "translated": true},
                {"name": "teaser", "widget": "rich_text"}
            ]),
            json!({}),
        );

        assert_eq!(collection.rich_text_fields(), vec!["body", "teaser"]);
    }

    #[test]
    fn test_malformed_field_entries_are_skipped() {
        let collection = collection_with(
            json!([
                {"name": "body", "widget": "rich_text"},
                {"widget": 42},
                "not an object"
            ]),
            json!({}),
        );

        assert_eq!(collection.rich_text_fields(), vec!["body"]);
    }

    #[test]
    fn test_permissions_default_allow() {
        let collection = collection_with(json!([]), json!({}));

        // No permission map at all: everyone may read and write.
        assert!(collection.role_can_read("editor"));
        assert!(collection.role_can_write("editor"));
    }

    #[test]
    fn test_permissions_explicit_deny() {
        let collection = collection_with(
            json!([]),
            json!({
                "editor": {"read": false},
                "reviewer": {"write": false}
            }),
        );

        assert!(!collection.role_can_read("editor"));
        // Only `read` was denied for editor.
        assert!(collection.role_can_write("editor"));

        assert!(collection.role_can_read("reviewer"));
        assert!(!collection.role_can_write("reviewer"));

        // Unlisted roles keep full access.
        assert!(collection.role_can_read("author"));
        assert!(collection.role_can_write("author"));
    }

    #[test]
    fn test_permissions_explicit_allow_is_not_deny() {
        let collection = collection_with(json!([]), json!({"editor": {"read": true}}));

        assert!(collection.role_can_read("editor"));
    }
}
