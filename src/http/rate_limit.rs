//! Per-client request ceiling, enforced before the lookup pipeline is reached.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{clock::DefaultClock, DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::types::ErrorResponse;

/// Idle clients are pruned at least this often under load.
const PRUNE_EVERY_CHECKS: u64 = 1024;
/// Interval of the background prune started by [`RateLimitState::spawn_pruner`].
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// One keyed limiter over client IPs. Clients whose quota has fully
/// replenished are dropped by [`RateLimitState::prune`], so memory tracks the
/// clients active within the last window, not every client ever seen.
#[derive(Clone)]
pub struct RateLimitState {
    per_minute: NonZeroU32,
    trust_forwarded: bool,
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
    checks: Arc<AtomicU64>,
}

impl RateLimitState {
    /// `per_minute == 0` is treated as 1; there is no "unlimited" mode.
    /// `trust_forwarded` makes `X-Forwarded-For` / `X-Real-IP` the client
    /// identity; leave it off unless a proxy sets those headers.
    pub fn new(per_minute: u32, trust_forwarded: bool) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Self::with_quota(Quota::per_minute(per_minute), per_minute, trust_forwarded)
    }

    fn with_quota(quota: Quota, per_minute: NonZeroU32, trust_forwarded: bool) -> Self {
        Self {
            per_minute,
            trust_forwarded,
            limiter: Arc::new(RateLimiter::keyed(quota)),
            checks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute.get()
    }

    /// Clients currently holding limiter state.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }

    /// Forget clients whose quota has fully replenished.
    pub fn prune(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(
            "Rate limiter pruned {} idle client(s), {} tracked",
            before.saturating_sub(self.limiter.len()),
            self.limiter.len()
        );
    }

    /// Prune every [`PRUNE_INTERVAL`] until the runtime shuts down.
    pub fn spawn_pruner(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.prune();
            }
        })
    }

    /// `Ok` if `client` may proceed, otherwise the seconds until it may retry.
    pub fn check(&self, client: IpAddr) -> Result<(), u64> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY_CHECKS == PRUNE_EVERY_CHECKS - 1 {
            self.prune();
        }
        self.limiter.check_key(&client).map_err(|not_until| {
            not_until
                .wait_time_from(governor::clock::Clock::now(&DefaultClock::default()))
                .as_secs()
                .max(1)
        })
    }

    /// Client IP: the socket peer, or with `trust_forwarded` the first
    /// `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
    fn client_ip(&self, request: &Request) -> IpAddr {
        let header_ip = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        };
        let peer = || {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        };

        let forwarded = if self.trust_forwarded {
            header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
        } else {
            None
        };
        forwarded
            .or_else(peer)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let client = state.client_ip(&request);
    match state.check(client) {
        Ok(()) => {
            let mut response = next.run(request).await;
            response.headers_mut().insert(
                header::HeaderName::from_static("x-ratelimit-limit"),
                HeaderValue::from(state.per_minute()),
            );
            response
        }
        Err(retry_after) => {
            warn!("Rate limit exceeded for {}", client);
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse {
                    error: format!(
                        "rate limit of {} requests per minute exceeded",
                        state.per_minute()
                    ),
                    kind: "rate_limited".to_string(),
                }),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}
