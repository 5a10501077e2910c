//! Worker liveness
//!
//! Each worker refreshes `worker:<id>:heartbeat` every interval with a TTL of
//! twice the interval. A key that expired means the worker is presumed dead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::redis_manager::keys;

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Mark `worker_id` alive for `ttl`.
    async fn beat(&self, worker_id: &str, ttl: Duration) -> Result<()>;

    /// Remove the liveness key of `worker_id`.
    async fn clear(&self, worker_id: &str) -> Result<()>;

    /// Number of workers whose key has not expired.
    async fn live_workers(&self) -> Result<usize>;
}

pub struct RedisHeartbeats {
    conn: ConnectionManager,
}

impl RedisHeartbeats {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl HeartbeatStore for RedisHeartbeats {
    async fn beat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(keys::heartbeat(worker_id), keys::HEARTBEAT_VALUE, ttl.as_secs().max(1))
            .await
            .context("Failed to write heartbeat")?;
        Ok(())
    }

    async fn clear(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::heartbeat(worker_id))
            .await
            .context("Failed to delete heartbeat")?;
        Ok(())
    }

    async fn live_workers(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let live: Vec<String> = redis::cmd("KEYS")
            .arg(keys::HEARTBEAT_PATTERN)
            .query_async(&mut conn)
            .await
            .context("Failed to list heartbeats")?;
        Ok(live.len())
    }
}

/// Process-unique worker id: `<pid>-<unix nanos>`
pub fn generate_worker_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    format!("{}-{}", std::process::id(), nanos)
}

/// Spawn the heartbeat loop of one worker.
///
/// Beats immediately, then every `interval` with TTL `2 * interval`. When
/// `cancel` fires the key is deleted before the task returns.
pub fn spawn_heartbeat(
    store: Arc<dyn HeartbeatStore>,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = interval * 2;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.beat(&worker_id, ttl).await {
                        warn!("Failed to refresh heartbeat for worker {}: {:#}", worker_id, e);
                    } else {
                        debug!("Heartbeat refreshed: worker_id={}", worker_id);
                    }
                }
            }
        }

        if let Err(e) = store.clear(&worker_id).await {
            warn!("Failed to delete heartbeat for worker {}: {:#}", worker_id, e);
        }
    })
}
