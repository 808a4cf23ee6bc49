/// HTTP surface tests: status codes, error bodies, cache headers, rate
/// limiting and the metrics endpoint, driven through the router in-process.
mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use tower::ServiceExt;

use common::{init_logger, test_settings, FakeLauncher, Script, ENTEL_PAGE, ENTEL_RUC, NOT_REGISTERED_PAGE};
use sunat_scout::config::ScoutSettings;
use sunat_scout::http::router;
use sunat_scout::AppState;

fn app(settings: ScoutSettings, launcher: Arc<FakeLauncher>) -> Router {
    let state = AppState::new(settings, launcher).expect("metrics registry");
    router(state)
}

async fn get(app: &Router, uri: &str, client: &str) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .header("x-forwarded-for", client)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, headers, json)
}

#[tokio::test]
async fn lookup_returns_record_with_cache_header() {
    init_logger();
    let launcher = FakeLauncher::serving(ENTEL_PAGE);
    let app = app(test_settings(), launcher.clone());
    let uri = format!("/consultar_ruc?ruc={}", ENTEL_RUC);

    let (status, headers, body) = get(&app, &uri, "10.1.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-cache"], "miss");
    assert!(headers.contains_key("x-fetched-at"));
    assert_eq!(body["identifier"], ENTEL_RUC);
    assert_eq!(body["legal name"], "ENTEL PERU S.A.");
    assert_eq!(body["taxpayer status"], "ACTIVO");
    assert_eq!(body.as_object().map(|o| o.len()), Some(13));

    let (status, headers, _) = get(&app, &uri, "10.1.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-cache"], "hit");

    // The request layer trims stray whitespace before validation.
    let (status, headers, _) =
        get(&app, &format!("/consultar_ruc?ruc=%20{}%20", ENTEL_RUC), "10.1.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-cache"], "hit");
    assert_eq!(launcher.counters.launches(), 1);
}

#[tokio::test]
async fn missing_and_invalid_keys_are_bad_requests() {
    init_logger();
    let launcher = FakeLauncher::serving(ENTEL_PAGE);
    let app = app(test_settings(), launcher.clone());

    let (status, _, body) = get(&app, "/consultar_ruc", "10.1.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "missing_parameter");

    let (status, _, body) = get(&app, "/consultar_ruc?ruc=", "10.1.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "missing_parameter");

    let (status, _, body) = get(&app, "/consultar_ruc?ruc=123", "10.1.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_key");
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));

    assert_eq!(launcher.counters.launches(), 0);
}

#[tokio::test]
async fn scrape_outcomes_map_to_statuses() {
    init_logger();

    let not_found = app(test_settings(), FakeLauncher::serving(NOT_REGISTERED_PAGE));
    let (status, _, body) = get(&not_found, "/consultar_ruc?ruc=20131623764", "10.1.0.3").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let broken = app(test_settings(), FakeLauncher::serving("<html><body>???</body></html>"));
    let (status, _, body) = get(&broken, "/consultar_ruc?ruc=20131623764", "10.1.0.3").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "scrape_failed");

    let down = app(
        test_settings(),
        FakeLauncher::new(Script {
            fail_launch: true,
            ..Script::default()
        }),
    );
    let (status, _, body) = get(&down, "/consultar_ruc?ruc=20131623764", "10.1.0.3").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "portal_unavailable");
}

#[tokio::test]
async fn clients_over_the_ceiling_get_429() {
    init_logger();
    let mut settings = test_settings();
    settings.rate_limit_per_minute = 2;
    let app = app(settings, FakeLauncher::serving(ENTEL_PAGE));

    for _ in 0..2 {
        let (status, headers, _) = get(&app, "/consultar_ruc?ruc=123", "10.2.0.1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers["x-ratelimit-limit"], "2");
    }

    let (status, headers, body) = get(&app, "/consultar_ruc?ruc=123", "10.2.0.1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["kind"], "rate_limited");
    assert!(headers.contains_key("retry-after"));

    // Other clients and other routes are unaffected.
    let (status, _, _) = get(&app, "/consultar_ruc?ruc=123", "10.2.0.2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = get(&app, "/health", "10.2.0.1").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn rotating_forwarded_for_is_ignored_without_a_trusted_proxy() {
    init_logger();
    let mut settings = test_settings();
    settings.rate_limit_per_minute = 2;
    settings.trust_forwarded_for = false;
    let app = app(settings, FakeLauncher::serving(ENTEL_PAGE));

    let mut statuses = Vec::new();
    for i in 0..5 {
        let (status, _, _) =
            get(&app, "/consultar_ruc?ruc=123", &format!("198.51.100.{}", i)).await;
        statuses.push(status);
    }
    println!("🚦 statuses: {:?}", statuses);
    assert_eq!(
        statuses,
        vec![
            StatusCode::BAD_REQUEST,
            StatusCode::BAD_REQUEST,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    init_logger();
    let app = app(test_settings(), FakeLauncher::serving(ENTEL_PAGE));

    let (status, _, body) = get(&app, "/health", "10.3.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["cache_ttl_secs"], 60);

    get(&app, &format!("/consultar_ruc?ruc={}", ENTEL_RUC), "10.3.0.1").await;
    get(&app, "/consultar_ruc?ruc=123", "10.3.0.1").await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    println!("📈 metrics:\n{}", text);

    assert!(text.contains("sunat_scout_requests_total"));
    assert!(text.contains("endpoint=\"/consultar_ruc\""));
    assert!(text.contains("sunat_scout_lookups_total"));
    assert!(text.contains("outcome=\"invalid_key\""));
}
