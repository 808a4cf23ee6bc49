//! Native browser management using `chromiumoxide`.
//!
//! This module owns:
//! * Finding a usable browser executable (Chrome → Chromium → Brave, cross-platform).
//! * Building a headless `BrowserConfig` with stealth defaults.
//! * [`ChromeLauncher`] — launches **one fresh browser process per scrape attempt**.
//!   Sessions are never pooled: a prior query's cookies or history must not leak
//!   into the next lookup.
//! * [`ChromeSession`] — the live process; torn down by [`PortalSession::close`]
//!   or, on any other exit path (cancellation, panic), by `Drop`.
//!
//! Everything above this module talks to the [`PortalSession`] /
//! [`SessionLauncher`] traits, so the form and extraction steps run unchanged
//! against an in-memory fake in tests.

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::BrowserSettings;
use crate::core::error::SessionError;

/// Upper bound for a single CDP round-trip (click, type, content read).
const CDP_CALL_TIMEOUT: Duration = Duration::from_secs(15);
/// Launching Chromium on a cold machine can be slow, but never this slow.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

// ── Capability interface ─────────────────────────────────────────────────────

/// A live, isolated browser tab driven on behalf of exactly one lookup.
///
/// Callers bound each call with their own timeout; implementations must keep
/// working after a call future is dropped mid-flight, at least far enough to
/// `close`.
#[async_trait]
pub trait PortalSession: Send {
    /// Load `url` and return once the document has loaded.
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// `true` as soon as `selector` matches an element; `false` if it did not
    /// appear within `timeout`.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, SessionError>;

    /// Clear the input matched by `selector` and type `text` into it.
    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), SessionError>;

    async fn click(&mut self, selector: &str) -> Result<(), SessionError>;

    /// Current rendered HTML of the page.
    async fn content(&mut self) -> Result<String, SessionError>;

    /// Terminate the underlying browser process and release its resources.
    async fn close(self: Box<Self>);
}

/// Produces fresh sessions. Failure to spawn is `SessionError::Unavailable`
/// and is never retried here.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn PortalSession>, SessionError>;
}

// ── Realistic User-Agent pool ────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `explicit` (config file / `CHROME_EXECUTABLE`), when the path exists
/// 2. PATH lookup of the usual binary names
/// 3. OS-specific well-known install paths
pub fn find_chrome_executable(explicit: Option<&str>) -> Option<String> {
    if let Some(p) = explicit {
        if Path::new(p).exists() {
            return Some(p.to_string());
        }
    }

    for exe in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "chrome",
        "brave-browser",
    ] {
        if let Ok(full) = which::which(exe) {
            return Some(full.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/local/bin/chromium",
            "/snap/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Headless browser config builder ──────────────────────────────────────────

/// Build a `BrowserConfig` for headless operation.
///
/// `--no-sandbox` / `--disable-dev-shm-usage` keep it running in containers;
/// `--disable-blink-features=AutomationControlled` hides `navigator.webdriver`.
pub fn build_headless_config(
    exe: &str,
    user_agent: &str,
    width: u32,
    height: u32,
) -> Result<BrowserConfig, SessionError> {
    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--disable-crash-reporter")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", user_agent))
        .build()
        .map_err(|e| SessionError::Unavailable(format!("invalid browser config: {}", e)))
}

// ── Launcher ─────────────────────────────────────────────────────────────────

/// Spawns a brand-new headless browser for every call to `launch`.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    /// Resolved executable, if one is installed. Checked per launch so a
    /// browser installed after startup is picked up.
    pub fn executable(&self) -> Option<String> {
        find_chrome_executable(self.settings.executable.as_deref())
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn PortalSession>, SessionError> {
        let exe = self.executable().ok_or_else(|| {
            SessionError::Unavailable(
                "no browser found; install Chrome or Chromium, or set CHROME_EXECUTABLE".into(),
            )
        })?;
        let user_agent = self
            .settings
            .user_agent
            .clone()
            .unwrap_or_else(|| random_user_agent().to_string());

        let config = build_headless_config(&exe, &user_agent, 1920, 1080)?;

        info!("🚀 Launching headless browser ({})", exe);
        let (browser, mut handler) = tokio::time::timeout(LAUNCH_TIMEOUT, Browser::launch(config))
            .await
            .map_err(|_| SessionError::Unavailable(format!("browser launch exceeded {:?}", LAUNCH_TIMEOUT)))?
            .map_err(|e| SessionError::Unavailable(format!("failed to launch {}: {}", exe, e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }
        });

        let page = tokio::time::timeout(CDP_CALL_TIMEOUT, browser.new_page("about:blank")).await;
        let mut session = ChromeSession {
            browser: Some(browser),
            page: None,
            handler_task: Some(handler_task),
        };
        match page {
            Ok(Ok(page)) => session.page = Some(page),
            Ok(Err(e)) => {
                Box::new(session).close().await;
                return Err(SessionError::Unavailable(format!("failed to open tab: {}", e)));
            }
            Err(_) => {
                Box::new(session).close().await;
                return Err(SessionError::Unavailable("timed out opening tab".into()));
            }
        }

        Ok(Box::new(session))
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One browser process with one tab.
pub struct ChromeSession {
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, SessionError> {
        self.page
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("session has no open tab".into()))
    }

    async fn bounded<T, F>(what: &str, fut: F) -> Result<T, SessionError>
    where
        F: std::future::Future<Output = Result<T, chromiumoxide::error::CdpError>>,
    {
        match tokio::time::timeout(CDP_CALL_TIMEOUT, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(SessionError::Protocol(format!("{}: {}", what, e))),
            Err(_) => Err(SessionError::Protocol(format!(
                "{} exceeded {:?}",
                what, CDP_CALL_TIMEOUT
            ))),
        }
    }
}

#[async_trait]
impl PortalSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let page = self.page()?;
        info!("🌐 Navigating to: {}", url);
        page.goto(url)
            .await
            .map_err(|e| SessionError::Protocol(format!("navigation failed: {}", e)))?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, SessionError> {
        let page = self.page()?;
        let poll = async {
            loop {
                if page.find_element(selector).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        Ok(tokio::time::timeout(timeout, poll).await.is_ok())
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), SessionError> {
        let page = self.page()?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|_| SessionError::ElementNotFound(selector.to_string()))?;
        Self::bounded(
            "clear input",
            element.call_js_fn("function() { this.value = ''; }", false),
        )
        .await?;
        Self::bounded("focus input", element.click()).await?;
        Self::bounded("type input", element.type_str(text)).await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), SessionError> {
        let page = self.page()?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|_| SessionError::ElementNotFound(selector.to_string()))?;
        Self::bounded("click", element.click()).await?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        let page = self.page()?;
        Self::bounded("read content", page.content()).await
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        drop(this.page.take());
        if let Some(mut browser) = this.browser.take() {
            if tokio::time::timeout(CDP_CALL_TIMEOUT, browser.close()).await.is_err() {
                warn!("Browser close timed out, killing process");
            }
            // Kill and reap the child so no zombie Chromium outlives the lookup.
            if let Some(Err(e)) = browser.kill().await {
                debug!("Browser kill after close: {}", e);
            }
            let _ = tokio::time::timeout(CDP_CALL_TIMEOUT, browser.wait()).await;
        }
        if let Some(task) = this.handler_task.take() {
            task.abort();
        }
        info!("🛑 Browser session closed");
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // Reached only when `close` was skipped (cancelled lookup, panic).
        // Dropping `Browser` kills its child process; the CDP handler task is
        // aborted so it does not outlive the process.
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        if self.browser.is_some() {
            warn!("Browser session dropped without close; killing process");
        }
    }
}
