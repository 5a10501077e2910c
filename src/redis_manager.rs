//! Redis Manager - Centralized Redis connection handling
//!
//! This module owns:
//! - The key layout shared with every other process (queues, heartbeats,
//!   rate limits, pub/sub channels)
//! - A reconnecting `ConnectionManager` for ordinary commands
//! - Dedicated connections for blocking pops, which must not share a
//!   multiplexed pipeline with other callers

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tracing::{info, warn};

/// Redis key constants
pub mod keys {
    /// Submission job queue (LPUSH / BRPOP)
    pub const SUBMISSION_QUEUE: &str = "submission:queue";

    /// Achievement job queue (LPUSH / BRPOP)
    pub const ACHIEVEMENT_QUEUE: &str = "achievement:queue";

    /// Achievement notification channel (for pub/sub)
    pub const ACHIEVEMENT_CHANNEL: &str = "notifications:achievements";

    /// Pattern matching every live worker heartbeat
    pub const HEARTBEAT_PATTERN: &str = "worker:*:heartbeat";

    /// Value written to heartbeat keys
    pub const HEARTBEAT_VALUE: &str = "alive";

    /// Heartbeat key of one worker
    pub fn heartbeat(worker_id: &str) -> String {
        format!("worker:{}:heartbeat", worker_id)
    }

    /// Rate limit counter of one identifier within a scope
    pub fn rate_limit(scope: &str, identifier: &str) -> String {
        format!("rate_limit:{}:{}", scope, identifier)
    }
}

/// Shared Redis handles for one process
#[derive(Clone)]
pub struct RedisManager {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisManager {
    /// Connect to Redis, retrying until the server is reachable.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) => {
                    warn!(
                        "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                        e
                    );
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        };
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }

    /// Reconnecting handle for non-blocking commands
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Fresh connection reserved for one blocking consumer
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        get_connection_with_retry(&self.client).await
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}

/// Get a Redis connection with retry logic
pub async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
