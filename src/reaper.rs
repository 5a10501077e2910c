//! Stale-pending reaper
//!
//! A worker that dies between dequeue and its terminal write leaves the
//! submission Pending with no job on the queue. The reaper re-enqueues such
//! submissions; the worker's Pending claim absorbs any duplicate delivery.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReaperConfig;
use crate::queue::{JobQueue, QueueName};
use crate::store::Repository;

/// Submissions re-enqueued per scan
const BATCH_SIZE: i64 = 100;

pub struct Reaper {
    queue: Arc<dyn JobQueue>,
    repo: Arc<dyn Repository>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(queue: Arc<dyn JobQueue>, repo: Arc<dyn Repository>, config: ReaperConfig) -> Self {
        Self {
            queue,
            repo,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Stale-pending reaper disabled");
            return;
        }
        info!(
            "Stale-pending reaper started: stale_after={:?}, interval={:?}",
            self.config.stale_after, self.config.interval
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!("Stale-pending sweep failed: {:#}", e);
            }
        }
        info!("Stale-pending reaper stopped");
    }

    /// Re-enqueue every Pending submission queued before the stale cutoff.
    /// Returns how many were re-enqueued.
    pub async fn sweep(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)?;
        let now = Utc::now();
        let stale = self.repo.stale_pending(now - stale_after, BATCH_SIZE).await?;
        if stale.is_empty() {
            debug!("No stale pending submissions");
            return Ok(0);
        }

        // Backlogged jobs are still on the list; pushing them again only
        // inflates the queue.
        let queued = self.queue.queued_ids(QueueName::Submission).await?;
        let mut requeued = 0;
        for id in stale {
            if queued.contains(&id) {
                debug!("Submission {} is still queued, not re-enqueuing", id);
                continue;
            }
            if let Err(e) = self.queue.enqueue_submission(id).await {
                warn!("Failed to re-enqueue submission {}: {:#}", id, e);
                continue;
            }
            self.repo.touch_queued_at(id, now).await?;
            requeued += 1;
        }
        info!("Re-enqueued {} stale pending submission(s)", requeued);
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NewSubmission, SubmissionFlags, SubmissionStatus};
    use crate::store::memory::MemoryStore;
    use crate::store::SubmissionStore;
    use crate::testing::MemoryQueue;
    use std::time::Duration;

    fn reaper(store: Arc<MemoryStore>, queue: Arc<MemoryQueue>) -> Reaper {
        Reaper::new(
            queue,
            store,
            ReaperConfig {
                enabled: true,
                stale_after: Duration::from_secs(600),
                interval: Duration::from_millis(10),
            },
        )
    }

    async fn pending(store: &MemoryStore) -> i64 {
        store
            .create_submission(NewSubmission {
                user_id: 1,
                problem_id: 1,
                language_id: 1,
                submitted_code: "x".into(),
                effective_code: "x".into(),
                flags: SubmissionFlags::default(),
                submitted_by: Some(1),
                queued_at: Utc::now(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_requeues_only_stale_pending() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let old = Utc::now() - chrono::Duration::minutes(30);

        let stale = pending(&store).await;
        store.set_created_at(stale, old);
        let fresh = pending(&store).await;
        let finished = pending(&store).await;
        store.set_created_at(finished, old);
        store.set_status(finished, SubmissionStatus::Accepted);

        let reaper = reaper(store.clone(), queue.clone());
        assert_eq!(reaper.sweep().await.unwrap(), 1);
        assert_eq!(queue.pending(QueueName::Submission), vec![stale]);
        assert!(store.submission(stale).unwrap().queued_at.unwrap() > old);
        assert!(store.submission(fresh).unwrap().status == SubmissionStatus::Pending);

        // queued_at was refreshed, so the next sweep leaves it alone.
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disabled_reaper_returns_immediately() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let reaper = Reaper::new(
            queue,
            store,
            ReaperConfig {
                enabled: false,
                stale_after: Duration::from_secs(1),
                interval: Duration::from_secs(1),
            },
        );
        tokio::time::timeout(Duration::from_secs(1), reaper.run(CancellationToken::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let reaper = Arc::new(reaper(store, queue));
        let cancel = CancellationToken::new();
        let handle = {
            let reaper = reaper.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { reaper.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_skips_submissions_still_on_the_queue() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::default());
        let old = Utc::now() - chrono::Duration::minutes(30);

        let backlogged = pending(&store).await;
        store.set_created_at(backlogged, old);
        queue.enqueue_submission(backlogged).await.unwrap();
        let lost = pending(&store).await;
        store.set_created_at(lost, old);

        let reaper = reaper(store.clone(), queue.clone());
        assert_eq!(reaper.sweep().await.unwrap(), 1);
        assert_eq!(queue.pending(QueueName::Submission), vec![backlogged, lost]);
        assert_eq!(queue.length(QueueName::Submission).await.unwrap(), 2);
    }
}
