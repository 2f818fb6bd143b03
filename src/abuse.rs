//! Submission rate limiting.
//!
//! Limits how many POSTs a single client may make per window. Clients are
//! keyed by remote IP address, which survives session token rotation and
//! dropped cookies. When the server runs without connect info the session
//! cookie is used instead.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Method, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::session::token_from_headers;

/// Fixed-window request counter per key
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// key -> (requests in window, window start)
    requests: Arc<RwLock<HashMap<String, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count a request for `key`. Returns false once the key is over its limit.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.write().await;

        match requests.get_mut(key) {
            Some((count, window_start)) => {
                if now.duration_since(*window_start) >= self.window {
                    *count = 1;
                    *window_start = now;
                    true
                } else if *count >= self.max_requests {
                    false
                } else {
                    *count += 1;
                    true
                }
            }
            None => {
                requests.insert(key.to_string(), (1, now));
                true
            }
        }
    }

    /// Forget keys whose window has long passed. Returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
        before - requests.len()
    }

    pub async fn tracked(&self) -> usize {
        self.requests.read().await.len()
    }
}

/// Anti-abuse configuration
#[derive(Debug, Clone, Default)]
pub struct AbuseConfig {
    /// Rate limiter for submissions (None = disabled)
    pub rate_limiter: Option<RateLimiter>,
}

impl AbuseConfig {
    pub fn disabled() -> Self {
        Self { rate_limiter: None }
    }

    /// Load config from environment variables
    pub fn from_env() -> Self {
        let enabled = std::env::var("JAMTHEMES_RATE_LIMIT")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        if !enabled {
            tracing::info!("Submission rate limiting disabled");
            return Self::disabled();
        }

        let max_requests: u32 = std::env::var("JAMTHEMES_RATE_LIMIT_MAX")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&max| max > 0)
            .unwrap_or(10);

        let window_secs: u64 = std::env::var("JAMTHEMES_RATE_LIMIT_WINDOW")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&secs| secs > 0)
            .unwrap_or(60);

        tracing::info!(max_requests, window_secs, "Submission rate limiting enabled");

        Self {
            rate_limiter: Some(RateLimiter::new(
                max_requests,
                Duration::from_secs(window_secs),
            )),
        }
    }
}

fn rate_limited(retry_after: Duration) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
        "Too many submissions. Please slow down.",
    )
        .into_response()
}

/// Bucket for a request: remote IP when known, else the session token
fn rate_limit_key(request: &Request<Body>) -> Option<String> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(format!("ip:{}", addr.ip()));
    }
    token_from_headers(request.headers()).map(|token| format!("session:{}", token))
}

/// Middleware limiting POSTs per client
pub async fn submission_rate_limit(
    State(config): State<Arc<AbuseConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    if let Some(ref limiter) = config.rate_limiter {
        if let Some(key) = rate_limit_key(&request) {
            if !limiter.check(&key).await {
                tracing::warn!(key, "Submission rate limited");
                return rate_limited(limiter.window());
            }
        }
    }

    next.run(request).await
}
