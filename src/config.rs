//! Process configuration loaded from environment variables.
//!
//! `.env` is honoured through dotenvy in `main`. Every value has a default so a
//! local Redis + Postgres + sandbox setup works without any variables set.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::sandbox::config::SandboxConfig;

/// Which loops this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppRole {
    Worker,
    Server,
    All,
}

impl AppRole {
    pub fn runs_worker(&self) -> bool {
        matches!(self, AppRole::Worker | AppRole::All)
    }

    pub fn runs_server(&self) -> bool {
        matches!(self, AppRole::Server | AppRole::All)
    }
}

impl FromStr for AppRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "worker" => Ok(AppRole::Worker),
            "server" => Ok(AppRole::Server),
            "all" => Ok(AppRole::All),
            other => anyhow::bail!("Unknown APP_ROLE '{}' (expected worker, server or all)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_concurrent_submissions: usize,
    pub max_concurrent_test_cases: usize,
    pub heartbeat_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_submissions: 4,
            max_concurrent_test_cases: 4,
            heartbeat_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Limit and window of one rate limiter
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub stale_after: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub role: AppRole,
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub queue_poll_timeout: Duration,
    pub http_bind: String,
    pub sandbox: SandboxConfig,
    pub worker: WorkerConfig,
    pub submit_limit: RateLimitConfig,
    pub run_limit: RateLimitConfig,
    pub reaper: ReaperConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let sandbox = SandboxConfig {
            base_url: env_or("SANDBOX_URL", "http://localhost:2000/api/v2".to_string())?,
            request_timeout: Duration::from_secs(env_or("SANDBOX_TIMEOUT_SECS", 45u64)?),
            run_timeout_ms: env_or("SANDBOX_RUN_TIMEOUT_MS", 15_000u32)?,
            compile_timeout_ms: env_or("SANDBOX_COMPILE_TIMEOUT_MS", 20_000u32)?,
            run_memory_limit: env_or("SANDBOX_RUN_MEMORY_LIMIT", 512 * 1024 * 1024i64)?,
            compile_memory_limit: env_or("SANDBOX_COMPILE_MEMORY_LIMIT", 1024 * 1024 * 1024i64)?,
            ..SandboxConfig::default()
        }
        .normalized();

        let worker = WorkerConfig {
            max_concurrent_submissions: env_or("WORKER_MAX_CONCURRENT_SUBMISSIONS", 4usize)?.max(1),
            max_concurrent_test_cases: env_or("WORKER_MAX_CONCURRENT_TEST_CASES", 4usize)?.max(1),
            heartbeat_interval: Duration::from_secs(
                env_or("WORKER_HEARTBEAT_INTERVAL_SECS", 10u64)?.max(1),
            ),
            drain_timeout: Duration::from_secs(env_or("SHUTDOWN_DRAIN_SECS", 30u64)?),
        };

        Ok(Self {
            role: env_or("APP_ROLE", AppRole::All)?,
            database_url: env_or("DATABASE_URL", "postgres://localhost/judge".to_string())?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10u32)?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379".to_string())?,
            queue_poll_timeout: Duration::from_secs(env_or("QUEUE_POLL_TIMEOUT_SECS", 2u64)?.max(1)),
            http_bind: env_or("HTTP_BIND", "0.0.0.0:8080".to_string())?,
            sandbox,
            worker,
            submit_limit: RateLimitConfig {
                max_requests: env_or("RATE_LIMIT_SUBMIT_MAX", 5u32)?,
                window: Duration::from_secs(env_or("RATE_LIMIT_SUBMIT_WINDOW_SECS", 60u64)?),
            },
            run_limit: RateLimitConfig {
                max_requests: env_or("RATE_LIMIT_RUN_MAX", 10u32)?,
                window: Duration::from_secs(env_or("RATE_LIMIT_RUN_WINDOW_SECS", 60u64)?),
            },
            reaper: ReaperConfig {
                enabled: env_or("REAPER_ENABLED", true)?,
                stale_after: Duration::from_secs(env_or("REAPER_STALE_AFTER_SECS", 600u64)?),
                interval: Duration::from_secs(env_or("REAPER_INTERVAL_SECS", 60u64)?.max(1)),
            },
        })
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid value for {}: '{}'", key, raw))
}
