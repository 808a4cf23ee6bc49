use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::core::config::{PortalSettings, ScoutSettings};
use crate::core::error::{LookupError, SessionError};
use crate::core::types::{CacheEntry, LookupKey, LookupOutcome, LookupSource, TaxpayerRecord};
use crate::scraping::browser_manager::SessionLauncher;
use crate::scraping::{extract, portal_form};
use crate::tools::lookup_cache::LookupCache;

/// Entry point of the scrape pipeline: validate → cache → (browser → form →
/// extract) → cache. Owns the retry policy and the global session cap.
pub struct LookupService {
    launcher: Arc<dyn SessionLauncher>,
    cache: LookupCache,
    portal: PortalSettings,
    sessions: Arc<Semaphore>,
    portal_retries: u32,
}

impl std::fmt::Debug for LookupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupService")
            .field("portal", &self.portal.url)
            .field("cache", &self.cache)
            .field("free_sessions", &self.sessions.available_permits())
            .field("portal_retries", &self.portal_retries)
            .finish()
    }
}

impl LookupService {
    pub fn new(settings: &ScoutSettings, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            cache: LookupCache::new(settings.cache.clone()),
            portal: settings.portal.clone(),
            sessions: Arc::new(Semaphore::new(settings.max_concurrent_sessions)),
            portal_retries: settings.portal_retries,
        }
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    /// Look up a raw identifier.
    ///
    /// Invalid input fails before the cache or a browser is touched. Failures
    /// from the scrape path leave the cache slot empty, so the next call
    /// for the same key starts over.
    pub async fn lookup(&self, raw_key: &str) -> Result<LookupOutcome, LookupError> {
        let started = Instant::now();
        let key = LookupKey::parse(raw_key).map_err(|reason| {
            warn!("Rejected RUC {:?}: {}", raw_key, reason);
            LookupError::InvalidKey(reason)
        })?;

        let (entry, fresh) = self
            .cache
            .get_or_compute(&key, self.scrape_with_retry(&key))
            .await
            .map_err(|e| (*e).clone())?;

        let source = if fresh {
            LookupSource::Portal
        } else {
            LookupSource::Cache
        };
        info!(
            "Lookup RUC {} served from {:?} in {:?}",
            key,
            source,
            started.elapsed()
        );
        Ok(LookupOutcome {
            key,
            entry,
            source,
            elapsed: started.elapsed(),
        })
    }

    /// Up to `1 + portal_retries` attempts, retrying only on portal
    /// unavailability, each attempt with its own browser session.
    async fn scrape_with_retry(&self, key: &LookupKey) -> Result<CacheEntry, LookupError> {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.portal_retries + 1;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(None)
            .build();

        let attempts_ref = &attempts;
        let record = retry(policy, move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            match self.scrape_once(key).await {
                Ok(record) => Ok(record),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "⚠️ Attempt {}/{} for RUC {} failed: {}; retrying with a fresh session",
                        attempt, max_attempts, key, e
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => {
                    warn!("❌ Lookup RUC {} failed after {} attempt(s): {}", key, attempt, e);
                    Err(backoff::Error::permanent(e))
                }
            }
        })
        .await?;

        Ok(CacheEntry::new(record))
    }

    /// One attempt: fresh session, submit, extract. The session is closed on
    /// every path before the outcome is inspected.
    async fn scrape_once(&self, key: &LookupKey) -> Result<TaxpayerRecord, LookupError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| LookupError::from(SessionError::Unavailable("session pool closed".into())))?;

        let started = Instant::now();
        let mut session = self.launcher.launch().await?;
        let page = portal_form::submit_lookup(session.as_mut(), &self.portal, key).await;
        session.close().await;

        let html = page?;
        let record = extract::extract_record(&html, key)?;
        info!("Scraped RUC {} in {:?}", key, started.elapsed());
        Ok(record)
    }
}
