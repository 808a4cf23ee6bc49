//! TTL cache of scraped records with single-flight population.
//!
//! Backed by `moka::future::Cache`: concurrent `get_or_compute` calls for the
//! same key coalesce onto one in-flight computation, errors are handed to
//! every waiter but never stored, and expired entries read as misses.

use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::CacheSettings;
use crate::core::types::{CacheEntry, LookupKey};

#[derive(Clone)]
pub struct LookupCache {
    inner: Cache<LookupKey, CacheEntry>,
    settings: CacheSettings,
}

impl std::fmt::Debug for LookupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupCache")
            .field("ttl", &self.settings.ttl)
            .field("max_entries", &self.settings.max_entries)
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl LookupCache {
    pub fn new(settings: CacheSettings) -> Self {
        let inner = Cache::builder()
            .max_capacity(settings.max_entries)
            .time_to_live(settings.ttl)
            .eviction_listener(|key: Arc<LookupKey>, _entry, cause| {
                debug!("Cache entry for RUC {} evicted ({:?})", key, cause);
            })
            .build();
        Self { inner, settings }
    }

    /// Unexpired entry for `key`, if any.
    pub async fn get(&self, key: &LookupKey) -> Option<CacheEntry> {
        self.inner.get(key).await
    }

    /// Return the cached entry, or run `compute` to produce one.
    ///
    /// At most one `compute` runs per key at a time; concurrent callers wait
    /// for it and share its outcome. The returned flag is `true` only for
    /// the caller whose `compute` installed the entry.
    pub async fn get_or_compute<F, E>(
        &self,
        key: &LookupKey,
        compute: F,
    ) -> Result<(CacheEntry, bool), Arc<E>>
    where
        F: Future<Output = Result<CacheEntry, E>>,
        E: Send + Sync + 'static,
    {
        let entry = self
            .inner
            .entry_by_ref(key)
            .or_try_insert_with(compute)
            .await?;
        let fresh = entry.is_fresh();
        if fresh {
            info!("💾 Cached record for RUC {} (ttl {:?})", key, self.settings.ttl);
        } else {
            debug!("Cache hit for RUC {}", key);
        }
        Ok((entry.into_value(), fresh))
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Apply pending evictions now (moka otherwise does this lazily).
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}
