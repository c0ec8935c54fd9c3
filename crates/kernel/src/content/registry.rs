//! Collection registry.
//!
//! Collection definitions live in the database and are cached in memory with
//! a short TTL, so definition edits become visible on every instance without
//! a restart.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moka::future::Cache;
use sqlx::PgPool;
use tracing::debug;

use crate::models::Collection;

/// TTL for cached collection definitions (60 seconds).
/// Edits may take up to this long to be visible.
const CACHE_TTL_SECS: u64 = 60;

/// Maximum cached definitions.
const CACHE_MAX_CAPACITY: u64 = 1_000;

/// Registry of collection definitions.
#[derive(Clone)]
pub struct CollectionRegistry {
    inner: Arc<CollectionRegistryInner>,
}

struct CollectionRegistryInner {
    pool: PgPool,
    /// Lookup cache, including negative entries for unknown names.
    by_name: Cache<String, Option<Arc<Collection>>>,
}

impl CollectionRegistry {
    /// Create a new collection registry.
    pub fn new(pool: PgPool) -> Self {
        let by_name = Cache::builder()
            .max_capacity(CACHE_MAX_CAPACITY)
            .time_to_live(Duration::from_secs(CACHE_TTL_SECS))
            .build();

        Self {
            inner: Arc::new(CollectionRegistryInner { pool, by_name }),
        }
    }

    /// Look up a collection definition by name.
    pub async fn get(&self, name: &str) -> Result<Option<Arc<Collection>>> {
        if let Some(cached) = self.inner.by_name.get(name).await {
            debug!(collection = %name, "collection definition cache hit");
            return Ok(cached);
        }

        let collection = Collection::find_by_name(&self.inner.pool, name)
            .await?
            .map(Arc::new);

        self.inner
            .by_name
            .insert(name.to_string(), collection.clone())
            .await;

        Ok(collection)
    }

    /// All collections ordered by weight, uncached.
    pub async fn list(&self) -> Result<Vec<Collection>> {
        Collection::list_all(&self.inner.pool).await
    }
}

impl std::fmt::Debug for CollectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionRegistry").finish()
    }
}
