//! Scripted stand-in for the portal browser, shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sunat_scout::config::ScoutSettings;
use sunat_scout::error::SessionError;
use sunat_scout::scraping::portal_form::{
    RESULT_CONTAINER_SELECTOR, SEARCH_BUTTON_SELECTOR, SEARCH_INPUT_SELECTOR,
};
use sunat_scout::{PortalSession, SessionLauncher};

pub const ENTEL_RUC: &str = "20106897914";
pub const ENTEL_PAGE: &str = include_str!("../fixtures/entel_result.html");
pub const PARTIAL_PAGE: &str = include_str!("../fixtures/partial_result.html");
pub const NOT_REGISTERED_PAGE: &str = include_str!("../fixtures/not_registered.html");

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Settings with short deadlines and no retries; tests override what they need.
pub fn test_settings() -> ScoutSettings {
    let mut settings = ScoutSettings::default();
    settings.portal.url = "https://portal.test/consulta".to_string();
    settings.portal.navigation_timeout = Duration::from_millis(300);
    settings.portal.result_timeout = Duration::from_millis(300);
    settings.cache.ttl = Duration::from_secs(60);
    settings.portal_retries = 0;
    // The router tests tell clients apart by X-Forwarded-For.
    settings.trust_forwarded_for = true;
    settings
}

/// How the fake portal misbehaves, if at all.
#[derive(Debug, Clone)]
pub struct Script {
    /// Page served after the search; the ENTEL RUC in it is swapped for the typed one.
    pub page: String,
    /// Number of sessions whose navigation never completes before the portal recovers.
    pub hanging_navigations: usize,
    pub fail_launch: bool,
    pub form_missing: bool,
    pub result_never_renders: bool,
    /// Time the portal takes to answer a submitted search.
    pub answer_delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            page: ENTEL_PAGE.to_string(),
            hanging_navigations: 0,
            fail_launch: false,
            form_missing: false,
            result_never_renders: false,
            answer_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub launches: AtomicUsize,
    pub closes: AtomicUsize,
    pub live: AtomicUsize,
    pub peak_live: AtomicUsize,
    pub navigations: AtomicUsize,
    pub typed: Mutex<Vec<String>>,
}

impl Counters {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    script: Script,
    pub counters: Arc<Counters>,
}

impl FakeLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn serving(page: &str) -> Arc<Self> {
        Self::new(Script {
            page: page.to_string(),
            ..Script::default()
        })
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn PortalSession>, SessionError> {
        let launch_no = self.counters.launches.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_launch {
            return Err(SessionError::Unavailable("no browser in test".into()));
        }
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            counters: self.counters.clone(),
            hangs: launch_no < self.script.hanging_navigations,
            navigated: false,
            typed: None,
            submitted: false,
        }))
    }
}

struct FakeSession {
    script: Script,
    counters: Arc<Counters>,
    hangs: bool,
    navigated: bool,
    typed: Option<String>,
    submitted: bool,
}

#[async_trait]
impl PortalSession for FakeSession {
    async fn navigate(&mut self, _url: &str) -> Result<(), SessionError> {
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        if self.hangs {
            futures::future::pending::<()>().await;
        }
        self.navigated = true;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, SessionError> {
        if !self.navigated {
            return Ok(false);
        }
        match selector {
            SEARCH_INPUT_SELECTOR | SEARCH_BUTTON_SELECTOR => Ok(!self.script.form_missing),
            RESULT_CONTAINER_SELECTOR => {
                if !self.submitted || self.script.result_never_renders {
                    tokio::time::sleep(timeout).await;
                    return Ok(false);
                }
                tokio::time::sleep(self.script.answer_delay).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<(), SessionError> {
        if selector != SEARCH_INPUT_SELECTOR {
            return Err(SessionError::ElementNotFound(selector.to_string()));
        }
        self.typed = Some(text.to_string());
        if let Ok(mut typed) = self.counters.typed.lock() {
            typed.push(text.to_string());
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), SessionError> {
        if selector != SEARCH_BUTTON_SELECTOR {
            return Err(SessionError::ElementNotFound(selector.to_string()));
        }
        self.submitted = self.typed.is_some();
        Ok(())
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        let typed = self.typed.as_deref().unwrap_or(ENTEL_RUC);
        Ok(self.script.page.replace(ENTEL_RUC, typed))
    }

    async fn close(self: Box<Self>) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}
