//! Delivery rate limiting: one token bucket per hook token plus a gateway-wide
//! bucket every delivery draws from.
//!
//! Per-token buckets live in a bounded map. When it reaches `max_tracked`,
//! buckets that refilled to capacity are dropped first, then the least
//! recently used one.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use hookgram_telemetry::{TelemetryLabels, record_counter};
use tower::{Layer, Service, util::ServiceExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub per_token_cap: u32,
    pub per_token_refill_per_sec: u32,
    pub global_cap: u32,
    pub global_refill_per_sec: u32,
    pub max_tracked: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_token_cap: 30,
            per_token_refill_per_sec: 10,
            global_cap: 600,
            global_refill_per_sec: 200,
            max_tracked: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    TokenExhausted,
    GatewayExhausted,
}

impl Verdict {
    fn as_str(self) -> &'static str {
        match self {
            Verdict::Allowed => "allowed",
            Verdict::TokenExhausted => "rate_limited",
            Verdict::GatewayExhausted => "rate_limited_global",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    refilled_at: Instant,
    used_at: Instant,
}

impl Bucket {
    fn full(cap: u32, now: Instant) -> Self {
        Self {
            tokens: cap,
            refilled_at: now,
            used_at: now,
        }
    }

    fn refill(&mut self, cap: u32, per_sec: u32, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at);
        let gained = (elapsed.as_secs_f64() * f64::from(per_sec)).floor() as u32;
        if gained > 0 {
            self.tokens = self.tokens.saturating_add(gained).min(cap);
            self.refilled_at = now;
        }
    }
}

struct Buckets {
    per_token: HashMap<String, Bucket>,
    global: Bucket,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Buckets>>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(Buckets {
                per_token: HashMap::new(),
                global: Bucket::full(limits.global_cap, now),
            })),
            limits,
        }
    }

    /// Takes one token from `key`'s bucket and one from the gateway bucket.
    /// Nothing is taken unless both have a token left.
    pub fn check(&self, key: &str) -> Verdict {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Verdict {
        let limits = self.limits;
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let buckets = &mut *guard;

        if !buckets.per_token.contains_key(key) && buckets.per_token.len() >= limits.max_tracked {
            evict(&mut buckets.per_token, &limits, now);
        }
        let bucket = buckets
            .per_token
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(limits.per_token_cap, now));
        bucket.refill(limits.per_token_cap, limits.per_token_refill_per_sec, now);
        bucket.used_at = now;
        buckets
            .global
            .refill(limits.global_cap, limits.global_refill_per_sec, now);

        if bucket.tokens == 0 {
            return Verdict::TokenExhausted;
        }
        if buckets.global.tokens == 0 {
            return Verdict::GatewayExhausted;
        }
        bucket.tokens -= 1;
        buckets.global.tokens -= 1;
        Verdict::Allowed
    }

    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .per_token
            .len()
    }
}

fn evict(per_token: &mut HashMap<String, Bucket>, limits: &RateLimits, now: Instant) {
    per_token.retain(|_, bucket| {
        bucket.refill(limits.per_token_cap, limits.per_token_refill_per_sec, now);
        bucket.tokens < limits.per_token_cap
    });
    if per_token.len() < limits.max_tracked {
        return;
    }
    let stalest = per_token
        .iter()
        .min_by_key(|(_, bucket)| bucket.used_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = stalest {
        per_token.remove(&key);
    }
}

/// Bucket key for a request path: the token segment, or `service/{name}` for
/// auto-detect deliveries.
pub fn bucket_key(path: &str) -> String {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some("service"), Some(name)) => format!("service/{name}"),
        (Some(first), _) => first.to_string(),
        (None, _) => String::new(),
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limiter: RateLimiter::new(limits),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer
where
    S: Service<Request<Body>, Response = Response> + Clone,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let key = bucket_key(req.uri().path());
        let verdict = self.limiter.check(&key);
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if verdict == Verdict::Allowed {
                return inner.ready().await?.call(req).await;
            }
            tracing::warn!(token = %key, limit = verdict.as_str(), "delivery rate limit exceeded");
            record_counter(
                "hookgram_deliveries_total",
                1,
                &TelemetryLabels::default().with_outcome(verdict.as_str()),
            );
            Ok(StatusCode::TOO_MANY_REQUESTS.into_response())
        })
    }
}
