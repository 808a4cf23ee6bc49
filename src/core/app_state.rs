use std::sync::Arc;

use crate::core::config::ScoutSettings;
use crate::http::metrics::ScoutMetrics;
use crate::http::rate_limit::RateLimitState;
use crate::scraping::browser_manager::SessionLauncher;
use crate::tools::lookup::LookupService;

/// Everything a request handler needs. Built once per process (or per test).
#[derive(Clone)]
pub struct AppState {
    pub lookup: Arc<LookupService>,
    pub metrics: Arc<ScoutMetrics>,
    pub rate_limit: RateLimitState,
    pub settings: Arc<ScoutSettings>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("lookup", &self.lookup)
            .field("rate_limit_per_minute", &self.rate_limit.per_minute())
            .finish()
    }
}

impl AppState {
    pub fn new(
        settings: ScoutSettings,
        launcher: Arc<dyn SessionLauncher>,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            lookup: Arc::new(LookupService::new(&settings, launcher)),
            metrics: Arc::new(ScoutMetrics::new()?),
            rate_limit: RateLimitState::new(
                settings.rate_limit_per_minute,
                settings.trust_forwarded_for,
            ),
            settings: Arc::new(settings),
        })
    }
}
