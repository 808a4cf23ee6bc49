use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ScoutConfig — file-based config loader (sunat-scout.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const DEFAULT_PORTAL_URL: &str =
    "https://e-consultaruc.sunat.gob.pe/cl-ti-itmrconsruc/FrameCriterioBusquedaWeb.jsp";

pub const ENV_CONFIG_PATH: &str = "SUNAT_SCOUT_CONFIG";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";
pub const ENV_RUNTIME: &str = "SUNAT_SCOUT_ENV";

/// Top-level config loaded from `sunat-scout.json`. Every field is optional;
/// an absent field falls back to its environment variable, then to a default.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct ScoutConfig {
    /// Search form URL of the portal.
    pub portal_url: Option<String>,
    /// Seconds a scraped record stays servable from cache. Default: 300.
    pub cache_ttl_secs: Option<u64>,
    /// Upper bound on cached records. Default: 1000.
    pub cache_max_entries: Option<u64>,
    /// Hard ceiling on the initial page load. Default: 20.
    pub navigation_timeout_secs: Option<u64>,
    /// Hard ceiling on the form controls and the result container appearing. Default: 20.
    pub result_timeout_secs: Option<u64>,
    /// Extra attempts (fresh session each) after a transient portal failure. Default: 1.
    pub portal_retries: Option<u32>,
    /// Browser processes allowed to run at once across all keys. Default: 5.
    pub max_concurrent_sessions: Option<usize>,
    /// Per-client request ceiling for the HTTP layer. Default: 60.
    pub rate_limit_per_minute: Option<u32>,
    /// Identify clients by `X-Forwarded-For` / `X-Real-IP`. Only for
    /// deployments behind a proxy that sets them. Default: false.
    pub trust_forwarded_for: Option<bool>,
    /// Fixed User-Agent. Default: rotate through realistic desktop agents.
    pub user_agent: Option<String>,
    /// Browser binary. Default: auto-discovery.
    pub chrome_executable: Option<String>,
    /// HTTP listen port. Default: 5000.
    pub port: Option<u16>,
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ScoutConfig {
    /// Portal URL: JSON field → `PORTAL_URL` env var → SUNAT search page.
    /// Anything that is not an absolute http(s) URL is ignored with a warning.
    pub fn resolve_portal_url(&self) -> String {
        self.portal_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| env_string("PORTAL_URL"))
            .and_then(|u| match url::Url::parse(&u) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(u),
                _ => {
                    tracing::warn!("Ignoring invalid portal URL {:?}", u);
                    None
                }
            })
            .unwrap_or_else(|| DEFAULT_PORTAL_URL.to_string())
    }

    /// Cache TTL: JSON field → `CACHE_TTL` env var → 300 s.
    pub fn resolve_cache_ttl(&self) -> Duration {
        let secs = self
            .cache_ttl_secs
            .or_else(|| env_value("CACHE_TTL"))
            .unwrap_or(300);
        Duration::from_secs(secs)
    }

    /// Cache capacity: JSON field → `MAX_CACHE_SIZE` env var → 1000.
    pub fn resolve_cache_max_entries(&self) -> u64 {
        self.cache_max_entries
            .or_else(|| env_value("MAX_CACHE_SIZE"))
            .unwrap_or(1000)
    }

    /// Navigation timeout: JSON field → `NAVIGATION_TIMEOUT_SECS` env var → 20 s.
    pub fn resolve_navigation_timeout(&self) -> Duration {
        let secs = self
            .navigation_timeout_secs
            .or_else(|| env_value("NAVIGATION_TIMEOUT_SECS"))
            .unwrap_or(20);
        Duration::from_secs(secs.max(1))
    }

    /// Result timeout: JSON field → `RESULT_TIMEOUT_SECS` env var → 20 s.
    pub fn resolve_result_timeout(&self) -> Duration {
        let secs = self
            .result_timeout_secs
            .or_else(|| env_value("RESULT_TIMEOUT_SECS"))
            .unwrap_or(20);
        Duration::from_secs(secs.max(1))
    }

    /// Retries on portal unavailability: JSON field → `PORTAL_RETRIES` env var → 1.
    /// Capped at 3 so an outage is never amplified into a retry storm.
    pub fn resolve_portal_retries(&self) -> u32 {
        self.portal_retries
            .or_else(|| env_value("PORTAL_RETRIES"))
            .unwrap_or(1)
            .min(3)
    }

    /// Session cap: JSON field → `MAX_CONCURRENT_REQUESTS` env var → 5.
    pub fn resolve_max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions
            .or_else(|| env_value("MAX_CONCURRENT_REQUESTS"))
            .unwrap_or(5)
            .max(1)
    }

    /// Rate limit: JSON field → `RATE_LIMIT_PER_MINUTE` env var → 60.
    pub fn resolve_rate_limit_per_minute(&self) -> u32 {
        self.rate_limit_per_minute
            .or_else(|| env_value("RATE_LIMIT_PER_MINUTE"))
            .unwrap_or(60)
    }

    /// Forwarded-header trust: JSON field → `TRUST_FORWARDED_FOR` env var → false.
    pub fn resolve_trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
            .or_else(|| env_value("TRUST_FORWARDED_FOR"))
            .unwrap_or(false)
    }

    /// User-Agent: JSON field → `USER_AGENT` env var → `None` (rotate).
    pub fn resolve_user_agent(&self) -> Option<String> {
        self.user_agent
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| env_string("USER_AGENT"))
    }

    /// Browser binary: JSON field → `CHROME_EXECUTABLE` env var, only if the path exists.
    pub fn resolve_chrome_executable(&self) -> Option<String> {
        self.chrome_executable
            .clone()
            .or_else(|| env_string(ENV_CHROME_EXECUTABLE))
            .filter(|p| Path::new(p).exists())
    }

    /// Port: JSON field → `PORT` env var → 5000.
    pub fn resolve_port(&self) -> u16 {
        self.port.or_else(|| env_value("PORT")).unwrap_or(5000)
    }

    /// Freeze every value. Components only ever see the result of this call.
    pub fn settings(&self) -> ScoutSettings {
        ScoutSettings {
            portal: PortalSettings {
                url: self.resolve_portal_url(),
                navigation_timeout: self.resolve_navigation_timeout(),
                result_timeout: self.resolve_result_timeout(),
            },
            cache: CacheSettings {
                ttl: self.resolve_cache_ttl(),
                max_entries: self.resolve_cache_max_entries(),
            },
            browser: BrowserSettings {
                executable: self.resolve_chrome_executable(),
                user_agent: self.resolve_user_agent(),
            },
            portal_retries: self.resolve_portal_retries(),
            max_concurrent_sessions: self.resolve_max_concurrent_sessions(),
            rate_limit_per_minute: self.resolve_rate_limit_per_minute(),
            trust_forwarded_for: self.resolve_trust_forwarded_for(),
            port: self.resolve_port(),
        }
    }
}

/// Where and how long to wait on the external portal.
#[derive(Clone, Debug)]
pub struct PortalSettings {
    pub url: String,
    pub navigation_timeout: Duration,
    pub result_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_entries: u64,
}

#[derive(Clone, Debug, Default)]
pub struct BrowserSettings {
    pub executable: Option<String>,
    pub user_agent: Option<String>,
}

/// Resolved, immutable settings injected into every component.
#[derive(Clone, Debug)]
pub struct ScoutSettings {
    pub portal: PortalSettings,
    pub cache: CacheSettings,
    pub browser: BrowserSettings,
    pub portal_retries: u32,
    pub max_concurrent_sessions: usize,
    pub rate_limit_per_minute: u32,
    pub trust_forwarded_for: bool,
    pub port: u16,
}

impl Default for ScoutSettings {
    fn default() -> Self {
        Self {
            portal: PortalSettings {
                url: DEFAULT_PORTAL_URL.to_string(),
                navigation_timeout: Duration::from_secs(20),
                result_timeout: Duration::from_secs(20),
            },
            cache: CacheSettings {
                ttl: Duration::from_secs(300),
                max_entries: 1000,
            },
            browser: BrowserSettings::default(),
            portal_retries: 1,
            max_concurrent_sessions: 5,
            rate_limit_per_minute: 60,
            trust_forwarded_for: false,
            port: 5000,
        }
    }
}

/// Load `sunat-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `SUNAT_SCOUT_CONFIG` env var path
/// 2. `./sunat-scout.json`
/// 3. `../sunat-scout.json`
///
/// Missing file → `ScoutConfig::default()` (silent, all env-var fallbacks apply).
/// Parse error → log a warning, return `ScoutConfig::default()`.
pub fn load_scout_config() -> ScoutConfig {
    let mut candidates = vec![
        PathBuf::from("sunat-scout.json"),
        PathBuf::from("../sunat-scout.json"),
    ];
    if let Some(env_path) = env_string(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return parse_scout_config(&contents, path);
    }

    ScoutConfig::default()
}

fn parse_scout_config(contents: &str, path: &Path) -> ScoutConfig {
    match serde_json::from_str::<ScoutConfig>(contents) {
        Ok(cfg) => {
            tracing::info!("sunat-scout.json loaded from {}", path.display());
            cfg
        }
        Err(e) => {
            tracing::warn!(
                "sunat-scout.json parse error at {}: {} — using defaults",
                path.display(),
                e
            );
            ScoutConfig::default()
        }
    }
}

/// Default log filter; production mode only reports warnings and errors.
pub fn default_log_filter() -> &'static str {
    match env_string(ENV_RUNTIME).as_deref() {
        Some("production") => "warn,tower_http=warn",
        _ => "info,tower_http=warn",
    }
}
