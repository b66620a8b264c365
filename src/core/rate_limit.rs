//! Sliding-window rate limiting backed by redis.
//!
//! Counters are keyed by `(route class, caller identity)` and live entirely
//! in the external store. When redis is unconfigured or unreachable the gate
//! fails open: availability of the product takes priority over strict
//! enforcement, and the degraded mode is logged rather than silent.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::core::state::AppState;

const REDIS_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Route classes and their windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Signup/login traffic, guarded against credential stuffing.
    Auth,
    /// General authenticated API traffic.
    Api,
    /// Expensive AI-backed operations.
    Ai,
    /// Inbound processor/automation callbacks.
    Webhook,
}

impl RouteClass {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Ai => "ai",
            Self::Webhook => "webhook",
        }
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u32 {
        match self {
            Self::Auth => 5,
            Self::Api => 10,
            Self::Ai => 5,
            Self::Webhook => 100,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            Self::Auth => Duration::from_secs(15 * 60),
            Self::Api => Duration::from_secs(10),
            Self::Ai => Duration::from_secs(60),
            Self::Webhook => Duration::from_secs(60),
        }
    }

    /// Classify a request path into a route class.
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/api/auth") {
            Self::Auth
        } else if path.starts_with("/api/webhooks") {
            Self::Webhook
        } else if path.starts_with("/api/ai") {
            Self::Ai
        } else {
            Self::Api
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the window frees up.
    pub reset_at: i64,
}

impl RateLimitDecision {
    fn open(class: RouteClass, now_ms: i64) -> Self {
        Self {
            admitted: true,
            limit: class.limit(),
            remaining: class.limit(),
            reset_at: now_ms,
        }
    }
}

/// Admission decision from a window count, kept separate from the redis
/// plumbing so the arithmetic is testable.
pub fn decide(class: RouteClass, current_count: i64, now_ms: i64) -> RateLimitDecision {
    let limit = class.limit() as i64;
    let admitted = current_count < limit;
    RateLimitDecision {
        admitted,
        limit: class.limit(),
        remaining: (limit - current_count - 1).max(0) as u32,
        reset_at: now_ms + class.window().as_millis() as i64,
    }
}

pub struct RateLimitService {
    cache: Option<Arc<redis::Client>>,
}

impl RateLimitService {
    pub fn new(cache: Option<Arc<redis::Client>>) -> Self {
        Self { cache }
    }

    /// Check and record one hit for `identity` against `class`.
    pub async fn admit(&self, class: RouteClass, identity: &str) -> RateLimitDecision {
        let now_ms = Utc::now().timestamp_millis();

        let client = match &self.cache {
            Some(client) => Arc::clone(client),
            None => return RateLimitDecision::open(class, now_ms),
        };

        match tokio::time::timeout(REDIS_OP_TIMEOUT, self.hit(&client, class, identity, now_ms))
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!("rate limiter degraded (redis error), admitting: {e}");
                RateLimitDecision::open(class, now_ms)
            }
            Err(_) => {
                tracing::warn!("rate limiter degraded (redis timeout), admitting");
                RateLimitDecision::open(class, now_ms)
            }
        }
    }

    async fn hit(
        &self,
        client: &redis::Client,
        class: RouteClass,
        identity: &str,
        now_ms: i64,
    ) -> redis::RedisResult<RateLimitDecision> {
        let mut conn = client.get_multiplexed_async_connection().await?;

        let key = format!("ratelimit:{}:{}", class.prefix(), identity);
        let window_ms = class.window().as_millis() as i64;
        let window_start = now_ms - window_ms;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(window_start)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        let decision = decide(class, count, now_ms);

        if decision.admitted {
            let member = format!("{now_ms}-{}", Uuid::new_v4());
            let _: () = redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(&key)
                .arg(now_ms)
                .arg(member)
                .ignore()
                .cmd("PEXPIRE")
                .arg(&key)
                .arg(window_ms)
                .ignore()
                .query_async(&mut conn)
                .await?;
        }

        Ok(decision)
    }
}

/// Caller identity for counter keys: the authenticated subject when the
/// fronting proxy supplied one, otherwise the forwarded client address.
fn caller_identity(req: &Request) -> String {
    if let Some(user) = req.headers().get("x-user-id").and_then(|v| v.to_str().ok()) {
        return format!("user:{user}");
    }
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(ip) = forwarded.split(',').next() {
            return ip.trim().to_string();
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }
    "anonymous".to_string()
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let class = RouteClass::classify(req.uri().path());
    let identity = caller_identity(&req);

    let decision = state.rate_limits.admit(class, &identity).await;

    if decision.admitted {
        return next.run(req).await;
    }

    let body = serde_json::json!({
        "error": "Too many requests",
        "limit": decision.limit,
        "remaining": 0,
        "reset": decision.reset_at,
    });

    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            ("X-RateLimit-Limit", decision.limit.to_string()),
            ("X-RateLimit-Remaining", "0".to_string()),
            ("X-RateLimit-Reset", decision.reset_at.to_string()),
        ],
        Json(body),
    )
        .into_response()
}
