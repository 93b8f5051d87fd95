//! SQLite-backed cache of resolved manifests.
//!
//! Entries are keyed by the trimmed request URL and stamped with
//! [`MANIFEST_CACHE_VERSION`]. Entries written under another version, or
//! whose JSON no longer validates, are treated as misses and overwritten.

use sqlx::Row;
use tracing::{debug, instrument, warn};

use crate::db::Database;
use crate::manifest::CanonicalManifest;

use super::{ResolveContext, ResolveError, ResolverRegistry};

/// Version of the cached manifest encoding. Bump when `CanonicalManifest`
/// serialization changes.
pub const MANIFEST_CACHE_VERSION: i64 = 1;

/// Manifest cache over the shared database.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    db: Database,
}

impl ManifestCache {
    /// Creates a cache on `db`.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the cached manifest for `url`, if a current entry exists.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Cache`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, url: &str) -> Result<Option<CanonicalManifest>, ResolveError> {
        let row = sqlx::query(
            "SELECT manifest_json, schema_version FROM manifest_cache WHERE url = ?",
        )
        .bind(url.trim())
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| ResolveError::Cache(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.get("schema_version");
        if version != MANIFEST_CACHE_VERSION {
            debug!(version, "ignoring cache entry from another schema version");
            return Ok(None);
        }
        let json: String = row.get("manifest_json");
        match serde_json::from_str::<CanonicalManifest>(&json) {
            Ok(manifest) if manifest.validate().is_ok() => Ok(Some(manifest)),
            Ok(_) | Err(_) => {
                warn!("discarding unreadable manifest cache entry");
                Ok(None)
            }
        }
    }

    /// Stores `manifest` for `url`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Cache`] if serialization or the write fails.
    #[instrument(skip(self, manifest), fields(source_id = manifest.source_id()))]
    pub async fn put(&self, url: &str, manifest: &CanonicalManifest) -> Result<(), ResolveError> {
        let json = serde_json::to_string(manifest).map_err(|e| ResolveError::Cache(e.to_string()))?;
        sqlx::query(
            "INSERT INTO manifest_cache (url, source_id, manifest_json, schema_version, cached_at)
             VALUES (?, ?, ?, ?, datetime('now'))
             ON CONFLICT(url) DO UPDATE SET
                source_id = excluded.source_id,
                manifest_json = excluded.manifest_json,
                schema_version = excluded.schema_version,
                cached_at = excluded.cached_at",
        )
        .bind(url.trim())
        .bind(manifest.source_id())
        .bind(json)
        .bind(MANIFEST_CACHE_VERSION)
        .execute(self.db.pool())
        .await
        .map_err(|e| ResolveError::Cache(e.to_string()))?;
        Ok(())
    }

    /// Removes the entry for `url`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Cache`] if the delete fails.
    pub async fn invalidate(&self, url: &str) -> Result<bool, ResolveError> {
        let result = sqlx::query("DELETE FROM manifest_cache WHERE url = ?")
            .bind(url.trim())
            .execute(self.db.pool())
            .await
            .map_err(|e| ResolveError::Cache(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Resolves through the cache: a current entry is returned without
    /// network access, otherwise the registry resolves and the result is stored.
    /// A failed cache write is logged and does not fail the resolution.
    ///
    /// # Errors
    ///
    /// Propagates registry errors and cache read failures.
    pub async fn resolve_cached(
        &self,
        registry: &ResolverRegistry,
        url: &str,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        if let Some(manifest) = self.get(url).await? {
            debug!(source_id = manifest.source_id(), "manifest cache hit");
            return Ok(manifest);
        }
        let manifest = registry.resolve(url, ctx).await?;
        if let Err(error) = self.put(url, &manifest).await {
            warn!(error = %error, "failed to cache manifest");
        }
        Ok(manifest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{ImageTarget, ManifestBuilder};

    fn manifest() -> CanonicalManifest {
        let mut builder = ManifestBuilder::new("iiif", "Cached");
        builder.push_page(ImageTarget::url("https://img/1.jpg"), Some("1r".to_string()));
        builder.push_page(ImageTarget::iiif_service("https://img/iiif/2"), None);
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = ManifestCache::new(Database::new_in_memory().await.unwrap());
        cache.put("https://x/manifest.json", &manifest()).await.unwrap();
        let cached = cache.get(" https://x/manifest.json ").await.unwrap().unwrap();
        assert_eq!(cached, manifest());
    }

    #[tokio::test]
    async fn test_get_miss() {
        let cache = ManifestCache::new(Database::new_in_memory().await.unwrap());
        assert!(cache.get("https://nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_is_a_miss() {
        let db = Database::new_in_memory().await.unwrap();
        let cache = ManifestCache::new(db.clone());
        cache.put("https://x/manifest.json", &manifest()).await.unwrap();
        sqlx::query("UPDATE manifest_cache SET schema_version = 0")
            .execute(db.pool())
            .await
            .unwrap();
        assert!(cache.get("https://x/manifest.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = ManifestCache::new(Database::new_in_memory().await.unwrap());
        cache.put("https://x/manifest.json", &manifest()).await.unwrap();
        assert!(cache.invalidate("https://x/manifest.json").await.unwrap());
        assert!(!cache.invalidate("https://x/manifest.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_cached_hit_skips_registry() {
        let cache = ManifestCache::new(Database::new_in_memory().await.unwrap());
        cache.put("https://x/manifest.json", &manifest()).await.unwrap();
        let empty = ResolverRegistry::new();
        let resolved = cache
            .resolve_cached(&empty, "https://x/manifest.json", &ResolveContext::default())
            .await
            .unwrap();
        assert_eq!(resolved.page_count(), 2);
    }
}
