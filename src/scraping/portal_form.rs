//! Search-form submission against the SUNAT "Consulta RUC" page.
//!
//! Every step carries a hard ceiling; there is no retry loop here. A failed
//! navigation leaves the session in an unknown state, so retries (if any)
//! belong to the orchestrator and always use a fresh session.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::browser_manager::PortalSession;
use crate::core::config::PortalSettings;
use crate::core::error::SessionError;
use crate::core::types::LookupKey;

/// RUC input box on the search form.
pub const SEARCH_INPUT_SELECTOR: &str = "input[name='search1']";
/// "Buscar" button.
pub const SEARCH_BUTTON_SELECTOR: &str = "#btnAceptar";
/// Container rendered once the portal has answered.
pub const RESULT_CONTAINER_SELECTOR: &str = ".list-group";

/// Navigate to the portal, submit `key`, and return the rendered result page.
pub async fn submit_lookup(
    session: &mut dyn PortalSession,
    portal: &PortalSettings,
    key: &LookupKey,
) -> Result<String, SessionError> {
    let nav_timeout = portal.navigation_timeout;
    match tokio::time::timeout(nav_timeout, session.navigate(&portal.url)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("⏱️ Portal navigation exceeded {:?}", nav_timeout);
            return Err(SessionError::NavigationTimeout(nav_timeout));
        }
    }

    // The form is served by the navigation itself; if it is not there the
    // layout has changed (or we were handed an error page).
    for selector in [SEARCH_INPUT_SELECTOR, SEARCH_BUTTON_SELECTOR] {
        if !bounded_wait(session, selector, portal.result_timeout).await? {
            warn!("Search form element missing: {}", selector);
            return Err(SessionError::ElementNotFound(selector.to_string()));
        }
    }

    bounded_call(portal.result_timeout, session.fill(SEARCH_INPUT_SELECTOR, key.as_str())).await?;
    debug!("RUC {} typed into search box", key);
    bounded_call(portal.result_timeout, session.click(SEARCH_BUTTON_SELECTOR)).await?;
    debug!("Search submitted for RUC {}", key);

    let result_timeout = portal.result_timeout;
    if !bounded_wait(session, RESULT_CONTAINER_SELECTOR, result_timeout).await? {
        warn!("⏱️ Result container did not render within {:?}", result_timeout);
        return Err(SessionError::ResultTimeout(result_timeout));
    }
    info!("Result page rendered for RUC {}", key);

    bounded_call(result_timeout, session.content()).await
}

/// `wait_for` with the timeout enforced on this side as well, so a session
/// that ignores its own deadline cannot stall the lookup.
async fn bounded_wait(
    session: &mut dyn PortalSession,
    selector: &str,
    timeout: Duration,
) -> Result<bool, SessionError> {
    let grace = timeout + Duration::from_millis(500);
    match tokio::time::timeout(grace, session.wait_for(selector, timeout)).await {
        Ok(result) => result,
        Err(_) => Ok(false),
    }
}

async fn bounded_call<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ResultTimeout(timeout)),
    }
}
