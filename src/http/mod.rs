pub mod metrics;
pub mod rate_limit;

use axum::{
    extract::{Query, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::core::error::{ErrorKind, LookupError};
use crate::core::types::{ErrorResponse, LookupQuery};
use crate::AppState;

/// Full HTTP surface: lookup, health, metrics, with rate limiting on the
/// lookup route only and request metrics on everything.
pub fn router(state: AppState) -> Router {
    let lookup_routes = Router::new()
        .route("/consultar_ruc", get(lookup_handler))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limit.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state.metrics.clone());

    let health_routes = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .with_state(state.clone());

    Router::new()
        .merge(health_routes)
        .merge(lookup_routes)
        .merge(metrics_routes)
        // route_layer so MatchedPath is already set when the request is timed.
        .route_layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics::track_requests,
        ))
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "sunat-scout",
        "version": env!("CARGO_PKG_VERSION"),
        "cached_records": state.lookup.cache().entry_count(),
        "cache_ttl_secs": state.settings.cache.ttl.as_secs(),
        "max_concurrent_sessions": state.settings.max_concurrent_sessions,
    }))
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidKey => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ScrapeFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::PortalUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message,
            kind: kind.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for LookupError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        error_response(status_for(kind), kind.as_str(), self.to_string())
    }
}

/// GET /consultar_ruc?ruc=<RUC>
async fn lookup_handler(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Response {
    // LookupKey rejects surrounding whitespace, so trim at the edge.
    let Some(ruc) = query
        .ruc
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
    else {
        warn!("Request without 'ruc' parameter");
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_parameter",
            "query parameter 'ruc' is required".to_string(),
        );
    };

    let result = state.lookup.lookup(&ruc).await;
    state.metrics.record_lookup(&result);
    state
        .metrics
        .set_cached_records(state.lookup.cache().entry_count());

    match result {
        Ok(outcome) => {
            info!(
                "RUC {} answered ({}, {:?})",
                outcome.key,
                outcome.source.cache_header(),
                outcome.elapsed
            );
            let mut response = Json(outcome.record()).into_response();
            let headers = response.headers_mut();
            headers.insert(
                HeaderName::from_static("x-cache"),
                HeaderValue::from_static(outcome.source.cache_header()),
            );
            if let Ok(v) = HeaderValue::from_str(&outcome.entry.created_at.to_rfc3339()) {
                headers.insert(HeaderName::from_static("x-fetched-at"), v);
            }
            response
        }
        Err(e) => {
            if matches!(e.kind(), ErrorKind::ScrapeFailed | ErrorKind::PortalUnavailable) {
                error!("Lookup for {:?} failed: {}", ruc, e);
            }
            e.into_response()
        }
    }
}
