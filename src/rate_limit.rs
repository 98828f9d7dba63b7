//! Per-client request limiting for the screenshot route
//!
//! Counters live either in process memory or in Redis so several replicas can
//! share one budget per client. A counter store that cannot be reached never
//! blocks traffic: the request is let through and the failure is logged.

use crate::{Metrics, RateLimitConfig, RateLimitError};
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests from this IP, please try again later.";

/// Outcome of counting one request against a client's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Counts one request for `client` and reports whether it is within `limit`.
    async fn acquire(&self, client: &str, window: Duration, limit: u64) -> Result<Decision, RateLimitError>;

    fn name(&self) -> &'static str;

    /// Drops counters with no requests inside `window`; stores that expire
    /// keys on their own have nothing to do.
    fn prune(&self, _window: Duration) -> usize {
        0
    }
}

/// Sliding-window counters held in process memory.
///
/// Only admitted requests are recorded, so a rejected client regains capacity
/// as its oldest admitted request leaves the window.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    request_times: DashMap<String, Vec<Instant>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_clients(&self) -> usize {
        self.request_times.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn acquire(&self, client: &str, window: Duration, limit: u64) -> Result<Decision, RateLimitError> {
        let now = Instant::now();
        let mut times = self.request_times.entry(client.to_string()).or_default();

        times.retain(|&time| now.duration_since(time) < window);

        let allowed = (times.len() as u64) < limit;
        if allowed {
            times.push(now);
        }

        let reset_after = times
            .first()
            .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(window);

        Ok(Decision {
            allowed,
            limit,
            remaining: limit.saturating_sub(times.len() as u64),
            reset_after,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn prune(&self, window: Duration) -> usize {
        let now = Instant::now();
        let before = self.request_times.len();
        self.request_times.retain(|_, times| {
            times.retain(|&time| now.duration_since(time) < window);
            !times.is_empty()
        });
        before - self.request_times.len()
    }
}

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {current, redis.call('PTTL', KEYS[1])}
"#;

/// Fixed-window counters in Redis, one key per client per window.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    connection: ConnectionManager,
    script: Arc<redis::Script>,
    prefix: String,
}

impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            script: Arc::new(redis::Script::new(INCREMENT_SCRIPT)),
            prefix: "screenshot-rl:".to_string(),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn acquire(&self, client: &str, window: Duration, limit: u64) -> Result<Decision, RateLimitError> {
        let mut connection = self.connection.clone();
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(format!("{}{}", self.prefix, client))
            .arg(window_ms)
            .invoke_async(&mut connection)
            .await?;

        let reset_after = if ttl_ms > 0 {
            Duration::from_millis(ttl_ms as u64)
        } else {
            window
        };

        Ok(Decision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: Duration,
    max_requests: u64,
    trust_proxy: bool,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: &RateLimitConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            window: config.window,
            max_requests: config.max_requests,
            trust_proxy: config.trust_proxy,
            metrics,
        }
    }

    /// Picks the Redis store when a URL is configured and reachable, memory otherwise.
    pub async fn from_config(config: &RateLimitConfig, metrics: Arc<Metrics>) -> Self {
        let store: Arc<dyn RateLimitStore> = match &config.redis_url {
            Some(url) => match RedisRateLimitStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!("Redis unavailable ({}), rate limiting with in-memory counters", e);
                    Arc::new(MemoryRateLimitStore::new())
                }
            },
            None => Arc::new(MemoryRateLimitStore::new()),
        };
        Self::new(store, config, metrics)
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn prune(&self) -> usize {
        self.store.prune(self.window)
    }

    /// Client identity: peer address, or the first `X-Forwarded-For` hop when
    /// running behind a trusted proxy.
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if self.trust_proxy {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(client) = forwarded {
                return client.to_string();
            }
        }
        peer.map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Returns `None` when the counter store failed and the request should pass.
    pub async fn check(&self, client: &str) -> Option<Decision> {
        match self.store.acquire(client, self.window, self.max_requests).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!("Rate limit exceeded for {}", client);
                    self.metrics.record_rate_limited();
                }
                Some(decision)
            }
            Err(e) => {
                warn!("Rate limit store error, allowing request: {}", e);
                self.metrics.record_rate_limit_store_error();
                None
            }
        }
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    // Round the reset up so clients never retry a moment too early.
    let reset_secs = decision.reset_after.as_millis().div_ceil(1000) as u64;
    headers.insert("ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("ratelimit-reset", HeaderValue::from(reset_secs));
}

/// Axum middleware guarding the screenshot route.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let client = limiter.client_key(request.headers(), peer);

    match limiter.check(&client).await {
        Some(decision) if !decision.allowed => {
            let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE).into_response();
            apply_headers(response.headers_mut(), &decision);
            response
        }
        Some(decision) => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &decision);
            response
        }
        None => next.run(request).await,
    }
}
