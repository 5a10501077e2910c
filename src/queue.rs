//! Job queues on the shared key-value store
//!
//! Two FIFO lists: producers `LPUSH` to the head, consumers `BRPOP` from the
//! tail. Delivery is at-least-once; there is no ack or redelivery here, stale
//! work is reclaimed from the database by the reaper.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::redis_manager::{keys, RedisManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Submission,
    Achievement,
}

impl QueueName {
    pub fn key(&self) -> &'static str {
        match self {
            QueueName::Submission => keys::SUBMISSION_QUEUE,
            QueueName::Achievement => keys::ACHIEVEMENT_QUEUE,
        }
    }
}

/// Queue payload, identical for both queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub submission_id: i64,
    pub enqueued_at: DateTime<Utc>,
}

pub type SubmissionJob = QueueJob;
pub type AchievementJob = QueueJob;

impl QueueJob {
    pub fn new(submission_id: i64) -> Self {
        Self {
            submission_id,
            enqueued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Push a job to the head of `queue`; returns once the store acknowledged it.
    async fn enqueue(&self, queue: QueueName, submission_id: i64) -> Result<()>;

    /// Block until a job is available. Returns `None` once `cancel` fires.
    async fn dequeue(&self, queue: QueueName, cancel: &CancellationToken)
        -> Result<Option<QueueJob>>;

    async fn length(&self, queue: QueueName) -> Result<u64>;

    /// Submission ids currently waiting in `queue`.
    async fn queued_ids(&self, queue: QueueName) -> Result<HashSet<i64>>;

    async fn enqueue_submission(&self, submission_id: i64) -> Result<()> {
        self.enqueue(QueueName::Submission, submission_id).await
    }

    async fn enqueue_achievement(&self, submission_id: i64) -> Result<()> {
        self.enqueue(QueueName::Achievement, submission_id).await
    }

    async fn dequeue_submission(&self, cancel: &CancellationToken) -> Result<Option<SubmissionJob>> {
        self.dequeue(QueueName::Submission, cancel).await
    }

    async fn dequeue_achievement(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<AchievementJob>> {
        self.dequeue(QueueName::Achievement, cancel).await
    }
}

/// Redis list backed queues
pub struct RedisJobQueue {
    redis: RedisManager,
    conn: ConnectionManager,
    submission_consumer: Mutex<Option<MultiplexedConnection>>,
    achievement_consumer: Mutex<Option<MultiplexedConnection>>,
    /// Length of one BRPOP slice; cancellation is checked between slices
    poll_timeout: Duration,
}

impl RedisJobQueue {
    pub fn new(redis: RedisManager, poll_timeout: Duration) -> Self {
        Self {
            conn: redis.connection(),
            redis,
            submission_consumer: Mutex::new(None),
            achievement_consumer: Mutex::new(None),
            poll_timeout,
        }
    }

    fn consumer(&self, queue: QueueName) -> &Mutex<Option<MultiplexedConnection>> {
        match queue {
            QueueName::Submission => &self.submission_consumer,
            QueueName::Achievement => &self.achievement_consumer,
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, queue: QueueName, submission_id: i64) -> Result<()> {
        let payload = serde_json::to_string(&QueueJob::new(submission_id))?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue.key(), &payload)
            .await
            .with_context(|| format!("Failed to push job to {}", queue.key()))?;
        debug!("Enqueued job: queue={}, submission_id={}", queue.key(), submission_id);
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        cancel: &CancellationToken,
    ) -> Result<Option<QueueJob>> {
        let mut slot = self.consumer(queue).lock().await;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if slot.is_none() {
                let conn = tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    conn = self.redis.blocking_connection() => conn?,
                };
                *slot = Some(conn);
            }
            let Some(conn) = slot.as_mut() else {
                continue;
            };

            let popped: Option<(String, String)> = match conn
                .brpop(queue.key(), self.poll_timeout.as_secs_f64())
                .await
            {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BRPOP failed: {}. Reconnecting...", e);
                    *slot = None;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if let Some((_, job_data)) = popped {
                match serde_json::from_str::<QueueJob>(&job_data) {
                    Ok(job) => return Ok(Some(job)),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    async fn length(&self, queue: QueueName) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .llen(queue.key())
            .await
            .with_context(|| format!("Failed to read length of {}", queue.key()))?;
        Ok(len)
    }

    async fn queued_ids(&self, queue: QueueName) -> Result<HashSet<i64>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .lrange(queue.key(), 0, -1)
            .await
            .with_context(|| format!("Failed to read {}", queue.key()))?;
        Ok(payloads
            .iter()
            .filter_map(|payload| serde_json::from_str::<QueueJob>(payload).ok())
            .map(|job| job.submission_id)
            .collect())
    }
}
