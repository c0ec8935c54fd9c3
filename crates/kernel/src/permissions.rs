//! Permission checks for system surfaces and collection actions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::debug;

use crate::models::{Collection, Role, User};

/// TTL for cached role permission sets (60 seconds).
/// Role edits may take up to this long to apply.
const ROLE_CACHE_TTL_SECS: u64 = 60;

/// An action on a collection's documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
        }
    }
}

/// What a permission check is about.
#[derive(Debug)]
pub enum ResourceContext<'a> {
    /// A named system surface, e.g. token administration. Admin only.
    System { context_id: &'a str },
    /// An action on documents of a collection, governed by the role's
    /// permission list and the collection's per-role map.
    Collection {
        collection: &'a Collection,
        action: Action,
    },
}

/// Permission checking service.
#[derive(Clone)]
pub struct PermissionService {
    inner: Arc<PermissionServiceInner>,
}

struct PermissionServiceInner {
    pool: PgPool,
    /// Role name -> permission strings, cached briefly.
    role_cache: moka::sync::Cache<String, Arc<HashSet<String>>>,
}

impl PermissionService {
    /// Create a new permission service.
    pub fn new(pool: PgPool) -> Self {
        let role_cache = moka::sync::Cache::builder()
            .max_capacity(100)
            .time_to_live(Duration::from_secs(ROLE_CACHE_TTL_SECS))
            .build();

        Self {
            inner: Arc::new(PermissionServiceInner { pool, role_cache }),
        }
    }

    /// Check whether a user may act in the given context.
    ///
    /// Admins pass every check. Everyone else needs the action in their
    /// role's permission list (`*` is a wildcard); collection contexts
    /// additionally apply the collection's per-role map, which denies only
    /// on an explicit `false`.
    pub async fn check(&self, user: &User, context: &ResourceContext<'_>) -> Result<bool> {
        if user.is_admin {
            return Ok(true);
        }

        let permissions = self.role_permissions(&user.role).await?;
        let allowed = decide(&permissions, &user.role, context);

        if !allowed {
            debug!(
                user = %user.name,
                role = %user.role,
                context = ?context,
                "permission denied"
            );
        }

        Ok(allowed)
    }

    /// Permission strings for a role, from cache or the roles table.
    ///
    /// An unknown role has no permissions.
    async fn role_permissions(&self, role_name: &str) -> Result<Arc<HashSet<String>>> {
        if let Some(cached) = self.inner.role_cache.get(role_name) {
            return Ok(cached);
        }

        let permissions = match Role::find_by_name(&self.inner.pool, role_name).await? {
            Some(role) => Arc::new(role.permission_set()),
            None => Arc::new(HashSet::new()),
        };

        self.inner
            .role_cache
            .insert(role_name.to_string(), permissions.clone());

        Ok(permissions)
    }
}

/// The permission decision for a non-admin user.
fn decide(permissions: &HashSet<String>, user_role: &str, context: &ResourceContext<'_>) -> bool {
    match context {
        // System surfaces are admin territory; only a wildcard role
        // reaches them.
        ResourceContext::System { .. } => permissions.contains("*"),
        ResourceContext::Collection { collection, action } => {
            let role_allows =
                permissions.contains("*") || permissions.contains(action.as_str());
            let collection_allows = match action {
                Action::Read => collection.role_can_read(user_role),
                Action::Write => collection.role_can_write(user_role),
            };
            role_allows && collection_allows
        }
    }
}

impl std::fmt::Debug for PermissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionService").finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn collection_with_permissions(permissions: serde_json::Value) -> Collection {
        Collection {
            id: Uuid::now_v7(),
            name: "posts".to_string(),
            label: "Posts".to_string(),
            fields: json!([]),
            permissions,
            weight: 0,
            created: Utc::now(),
            changed: Utc::now(),
        }
    }

    fn perms(entries: &[&str]) -> HashSet<String> {
        entries.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn system_context_requires_wildcard() {
        let context = ResourceContext::System {
            context_id: "registration_tokens",
        };

        assert!(!decide(&perms(&["read", "write"]), "editor", &context));
        assert!(decide(&perms(&["*"]), "editor", &context));
    }

    #[test]
    fn collection_action_needs_role_permission() {
        let collection = collection_with_permissions(json!({}));
        let context = ResourceContext::Collection {
            collection: &collection,
            action: Action::Write,
        };

        assert!(decide(&perms(&["read", "write"]), "editor", &context));
        // A read-only role may not write even though the collection map
        // does not deny it.
        assert!(!decide(&perms(&["read"]), "editor", &context));
    }

    #[test]
    fn collection_map_deny_wins_over_role_permission() {
        let collection = collection_with_permissions(json!({"editor": {"write": false}}));

        assert!(!decide(
            &perms(&["read", "write"]),
            "editor",
            &ResourceContext::Collection {
                collection: &collection,
                action: Action::Write,
            }
        ));
        // Reads were not denied.
        assert!(decide(
            &perms(&["read", "write"]),
            "editor",
            &ResourceContext::Collection {
                collection: &collection,
                action: Action::Read,
            }
        ));
    }

    #[test]
    fn unknown_role_has_no_permissions() {
        let collection = collection_with_permissions(json!({}));
        assert!(!decide(
            &HashSet::new(),
            "ghost",
            &ResourceContext::Collection {
                collection: &collection,
                action: Action::Read,
            }
        ));
    }
}
