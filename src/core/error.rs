use std::time::Duration;
use thiserror::Error;

/// Why a raw identifier was rejected before reaching the cache or the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidKeyReason {
    #[error("RUC is empty")]
    Empty,

    #[error("RUC must contain only ASCII digits")]
    NonDigit,

    #[error("RUC must have exactly 11 digits (got {0})")]
    WrongLength(usize),

    #[error("RUC check digit does not match")]
    CheckDigit,
}

/// Failures of the browser session and of form submission/navigation.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("browser session unavailable: {0}")]
    Unavailable(String),

    #[error("portal navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("portal element not found: {0}")]
    ElementNotFound(String),

    #[error("portal result did not render within {0:?}")]
    ResultTimeout(Duration),

    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// Failures reading a rendered result page.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("malformed result page: {0}")]
    MalformedPage(String),

    #[error("portal reports no taxpayer for RUC {0}")]
    NoSuchTaxpayer(String),
}

/// Stable, machine-readable error codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidKey,
    NotFound,
    ScrapeFailed,
    PortalUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ScrapeFailed => "scrape_failed",
            ErrorKind::PortalUnavailable => "portal_unavailable",
        }
    }
}

/// The small error surface returned by [`crate::tools::lookup::LookupService::lookup`].
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("invalid RUC: {0}")]
    InvalidKey(#[from] InvalidKeyReason),

    #[error("{0}")]
    NotFound(String),

    #[error("scrape failed: {0}")]
    ScrapeFailed(String),

    #[error("portal unavailable: {0}")]
    PortalUnavailable(String),
}

impl LookupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LookupError::InvalidKey(_) => ErrorKind::InvalidKey,
            LookupError::NotFound(_) => ErrorKind::NotFound,
            LookupError::ScrapeFailed(_) => ErrorKind::ScrapeFailed,
            LookupError::PortalUnavailable(_) => ErrorKind::PortalUnavailable,
        }
    }

    /// Only transient portal failures are worth another attempt with a fresh session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LookupError::PortalUnavailable(_))
    }
}

impl From<SessionError> for LookupError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ElementNotFound(_) => LookupError::ScrapeFailed(err.to_string()),
            SessionError::Unavailable(_)
            | SessionError::NavigationTimeout(_)
            | SessionError::ResultTimeout(_)
            | SessionError::Protocol(_) => LookupError::PortalUnavailable(err.to_string()),
        }
    }
}

impl From<ExtractError> for LookupError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::MalformedPage(_) => LookupError::ScrapeFailed(err.to_string()),
            ExtractError::NoSuchTaxpayer(_) => LookupError::NotFound(err.to_string()),
        }
    }
}
