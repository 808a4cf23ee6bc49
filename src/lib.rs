pub mod core;
pub mod http;
pub mod scraping;
pub mod tools;

// --- Primary core exports ---
pub use crate::core::config;
pub use crate::core::error;
pub use crate::core::types;
pub use crate::core::types::*;
pub use crate::core::AppState;

pub use crate::core::error::{ErrorKind, LookupError};
pub use scraping::browser_manager::{ChromeLauncher, PortalSession, SessionLauncher};
pub use tools::lookup::LookupService;
pub use tools::lookup_cache::LookupCache;
