//! Fixed-window rate limiting on the shared store
//!
//! `INCR rate_limit:<scope>:<identifier>`; the first hit of a window sets the
//! TTL. Requests beyond the limit are rejected until the key expires. Store
//! failures fail open: the request proceeds uncounted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::redis_manager::keys;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Submission,
    Run,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Submission => "submission",
            RateLimitScope::Run => "run",
        }
    }
}

/// Counter state after one hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: i64,
    /// Time left in the window; `None` when the store did not report it
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, starting a `window` long TTL on the first hit.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount>;
}

pub struct RedisCounters {
    conn: ConnectionManager,
}

impl RedisCounters {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.conn.clone();
        let window_secs = window.as_secs().max(1) as i64;

        let count: i64 = conn.incr(key, 1).await.context("INCR failed")?;
        if count == 1 {
            conn.expire::<_, ()>(key, window_secs)
                .await
                .context("EXPIRE failed")?;
        }

        let ttl: i64 = conn.ttl(key).await.context("TTL failed")?;
        let ttl = if ttl == -1 {
            // Counter lost its expiry (e.g. a crash between INCR and EXPIRE).
            conn.expire::<_, ()>(key, window_secs)
                .await
                .context("EXPIRE failed")?;
            Some(Duration::from_secs(window_secs as u64))
        } else if ttl >= 0 {
            Some(Duration::from_secs(ttl as u64))
        } else {
            None
        };

        Ok(WindowCount { count, ttl })
    }
}

/// Outcome of one rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix second at which the current window ends
    pub reset: i64,
}

impl RateLimitDecision {
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
        ]
    }
}

/// Pure decision over a counter snapshot.
pub fn decide(count: i64, limit: u32, time_left: Duration, now_unix: i64) -> RateLimitDecision {
    RateLimitDecision {
        allowed: count <= limit as i64,
        limit,
        remaining: (limit as i64 - count).max(0) as u32,
        reset: now_unix + time_left.as_secs() as i64,
    }
}

/// One limiter instance (submission or run)
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    scope: RateLimitScope,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, scope: RateLimitScope, config: RateLimitConfig) -> Self {
        Self {
            store,
            scope,
            config,
        }
    }

    pub fn scope(&self) -> RateLimitScope {
        self.scope
    }

    /// Count one request for `user_id` in this limiter's window.
    pub async fn check(&self, user_id: i64) -> RateLimitDecision {
        let key = keys::rate_limit(self.scope.as_str(), &user_id.to_string());
        let now = Utc::now().timestamp();

        match self.store.increment(&key, self.config.window).await {
            Ok(hit) => decide(
                hit.count,
                self.config.max_requests,
                hit.ttl.unwrap_or(self.config.window),
                now,
            ),
            Err(e) => {
                warn!(
                    "Rate limiter store unavailable for {}: {:#}. Allowing request",
                    key, e
                );
                RateLimitDecision {
                    allowed: true,
                    limit: self.config.max_requests,
                    remaining: self.config.max_requests,
                    reset: now + self.config.window.as_secs() as i64,
                }
            }
        }
    }
}
