use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use sunat_scout::config::{default_log_filter, load_scout_config};
use sunat_scout::{http, AppState, ChromeLauncher};

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_log_filter()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting sunat-scout");

    let config = load_scout_config();
    let settings = config.settings();

    let launcher = ChromeLauncher::new(settings.browser.clone());
    match launcher.executable() {
        Some(exe) => info!("Browser executable: {}", exe),
        None => warn!(
            "No Chromium-family browser found; lookups will fail with portal_unavailable until one is installed or CHROME_EXECUTABLE is set"
        ),
    }
    info!(
        "Portal {} | cache ttl {:?}, max {} | timeouts nav {:?} / result {:?} | retries {} | sessions {} | {} req/min per client (forwarded headers trusted: {})",
        settings.portal.url,
        settings.cache.ttl,
        settings.cache.max_entries,
        settings.portal.navigation_timeout,
        settings.portal.result_timeout,
        settings.portal_retries,
        settings.max_concurrent_sessions,
        settings.rate_limit_per_minute,
        settings.trust_forwarded_for,
    );

    let port = parse_port_from_args().unwrap_or(settings.port);
    let state = AppState::new(settings, Arc::new(launcher))?;
    let pruner = state.rate_limit.spawn_pruner();
    let app = http::router(state);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("Listening on http://{}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pruner.abort();
    info!("sunat-scout stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received; draining in-flight lookups");
}
