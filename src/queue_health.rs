//! Queue health and per-submission queue position, derived on demand.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::SubmissionStatus;
use crate::heartbeat::HeartbeatStore;
use crate::queue::{JobQueue, QueueName};
use crate::store::Repository;

/// Advisory seconds of processing per queued submission
pub const SECONDS_PER_SUBMISSION: i64 = 30;

const CRITICAL_PENDING_AGE_SECS: i64 = 300;
const WARNING_PENDING_AGE_SECS: i64 = 120;
const WARNING_QUEUE_SIZE: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub queue_size: u64,
    #[serde(rename = "pendingInDB")]
    pub pending_in_db: i64,
    pub oldest_pending_age_sec: i64,
    pub active_workers: usize,
    pub health: HealthLevel,
    pub estimated_wait_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionQueueInfo {
    pub submission_id: i64,
    pub status: SubmissionStatus,
    /// 1-based position among Pending submissions; 0 once picked up
    pub position: i64,
    pub estimated_wait_secs: i64,
}

pub fn classify(queue_size: u64, pending_in_db: i64, oldest_pending_age_sec: i64, active_workers: usize) -> HealthLevel {
    if (active_workers == 0 && pending_in_db > 0) || oldest_pending_age_sec > CRITICAL_PENDING_AGE_SECS {
        HealthLevel::Critical
    } else if oldest_pending_age_sec > WARNING_PENDING_AGE_SECS || queue_size > WARNING_QUEUE_SIZE {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

pub fn estimated_wait_secs(queue_size: u64, active_workers: usize) -> i64 {
    queue_size as i64 * SECONDS_PER_SUBMISSION / active_workers.max(1) as i64
}

fn health_message(level: HealthLevel, active_workers: usize, pending_in_db: i64, oldest_age: i64) -> Option<String> {
    match level {
        HealthLevel::Healthy => None,
        HealthLevel::Critical if active_workers == 0 && pending_in_db > 0 => Some(format!(
            "No active workers while {} submission(s) are pending",
            pending_in_db
        )),
        HealthLevel::Critical => Some(format!(
            "Oldest pending submission has waited {}s",
            oldest_age
        )),
        HealthLevel::Warning => Some("Submissions are queueing up; results may be delayed".to_string()),
    }
}

pub struct QueueHealthService {
    queue: Arc<dyn JobQueue>,
    repo: Arc<dyn Repository>,
    heartbeats: Arc<dyn HeartbeatStore>,
}

impl QueueHealthService {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        repo: Arc<dyn Repository>,
        heartbeats: Arc<dyn HeartbeatStore>,
    ) -> Self {
        Self {
            queue,
            repo,
            heartbeats,
        }
    }

    pub async fn health(&self) -> Result<QueueHealth> {
        self.health_at(Utc::now()).await
    }

    async fn health_at(&self, now: DateTime<Utc>) -> Result<QueueHealth> {
        let queue_size = self.queue.length(QueueName::Submission).await?;
        let pending_in_db = self.repo.count_pending().await?;
        let oldest_pending_age_sec = self
            .repo
            .oldest_pending_created_at()
            .await?
            .map(|created| (now - created).num_seconds().max(0))
            .unwrap_or(0);
        let active_workers = self.heartbeats.live_workers().await?;

        let health = classify(queue_size, pending_in_db, oldest_pending_age_sec, active_workers);
        Ok(QueueHealth {
            queue_size,
            pending_in_db,
            oldest_pending_age_sec,
            active_workers,
            health,
            estimated_wait_secs: estimated_wait_secs(queue_size, active_workers),
            message: health_message(health, active_workers, pending_in_db, oldest_pending_age_sec),
        })
    }

    /// Position of one submission in the pending backlog. `None` when it does not exist.
    pub async fn submission_queue_info(&self, submission_id: i64) -> Result<Option<SubmissionQueueInfo>> {
        let Some(submission) = self.repo.get_submission(submission_id).await? else {
            return Ok(None);
        };
        if submission.status != SubmissionStatus::Pending {
            return Ok(Some(SubmissionQueueInfo {
                submission_id,
                status: submission.status,
                position: 0,
                estimated_wait_secs: 0,
            }));
        }

        let ahead = self.repo.count_pending_before(submission_id).await?;
        let active_workers = self.heartbeats.live_workers().await?;
        let position = ahead + 1;
        Ok(Some(SubmissionQueueInfo {
            submission_id,
            status: submission.status,
            position,
            estimated_wait_secs: estimated_wait_secs(position as u64, active_workers),
        }))
    }
}
