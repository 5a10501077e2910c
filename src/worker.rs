//! Submission worker
//!
//! Drives submissions from Pending to a terminal status:
//! - registers a heartbeat for the lifetime of the dispatch loop
//! - takes a submission slot, then dequeues one job and judges it in its own task
//! - fans test cases out to the sandbox, aggregates, persists
//! - updates problem/user stats and hands off to the achievement queue
//!
//! Only `start` and `stop` are public; per-submission work is internal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::core::{
    Language, Submission, SubmissionOutcome, SubmissionStatus, TestCase, ValidationRecord,
};
use crate::heartbeat::{generate_worker_id, spawn_heartbeat, HeartbeatStore};
use crate::judger::{aggregate, run_test_cases};
use crate::queue::JobQueue;
use crate::sandbox::SandboxClient;
use crate::store::Repository;

/// Shared state of every submission task
struct Judge {
    queue: Arc<dyn JobQueue>,
    repo: Arc<dyn Repository>,
    sandbox: Arc<dyn SandboxClient>,
    max_concurrent_test_cases: usize,
}

pub struct SubmissionWorker {
    id: String,
    judge: Arc<Judge>,
    heartbeats: Arc<dyn HeartbeatStore>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl SubmissionWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        repo: Arc<dyn Repository>,
        sandbox: Arc<dyn SandboxClient>,
        heartbeats: Arc<dyn HeartbeatStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: generate_worker_id(),
            judge: Arc::new(Judge {
                queue,
                repo,
                sandbox,
                max_concurrent_test_cases: config.max_concurrent_test_cases.max(1),
            }),
            heartbeats,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop dequeuing and drain. `start` returns once draining finished.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run the dispatch loop until `cancel` fires or `stop` is called.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let token = self.shutdown.clone();
        let forward = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        };

        let heartbeat_token = CancellationToken::new();
        let heartbeat = spawn_heartbeat(
            self.heartbeats.clone(),
            self.id.clone(),
            self.config.heartbeat_interval,
            heartbeat_token.clone(),
        );
        info!(
            "Worker started: worker_id={}, max_submissions={}, max_test_cases={}",
            self.id, self.config.max_concurrent_submissions, self.judge.max_concurrent_test_cases
        );

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_submissions.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.judge.queue.dequeue_submission(&token).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to dequeue submission: {:#}. Retrying...", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            let waited_ms = (Utc::now() - job.enqueued_at).num_milliseconds();
            info!(
                "Received submission job: submission_id={}, waited_ms={}",
                job.submission_id, waited_ms
            );

            let judge = self.judge.clone();
            let task_token = token.clone();
            tasks.spawn(async move {
                let _permit = permit;
                judge.process(job.submission_id, &task_token).await;
            });

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("Submission task failed: {}", e);
                }
            }
        }

        if !tasks.is_empty() {
            info!(
                "Worker {} draining {} in-flight submission(s)",
                self.id,
                tasks.len()
            );
        }
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    error!("Submission task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Worker {} drain window elapsed, aborting {} task(s)",
                self.id,
                tasks.len()
            );
            tasks.abort_all();
        }

        heartbeat_token.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task for worker {} failed: {}", self.id, e);
        }
        forward.abort();

        info!("Worker stopped: worker_id={}", self.id);
        Ok(())
    }
}

/// Everything loaded for a submission before it is claimed
struct Prepared {
    language: Language,
    cases: Vec<TestCase>,
}

impl Judge {
    /// Judge one submission.
    ///
    /// Nothing is written until the Pending claim succeeds. Once claimed, any
    /// error ends the submission InternalError.
    async fn process(&self, submission_id: i64, cancel: &CancellationToken) {
        let submission = match self.repo.get_submission(submission_id).await {
            Ok(Some(submission)) => submission,
            Ok(None) => {
                warn!("Submission {} not found, discarding job", submission_id);
                return;
            }
            Err(e) => {
                error!(
                    "Failed to load submission {}, leaving it for redelivery: {:#}",
                    submission_id, e
                );
                return;
            }
        };

        if submission.status != SubmissionStatus::Pending {
            info!(
                "Submission {} is already {}, skipping",
                submission_id, submission.status
            );
            return;
        }

        let prepared = self.prepare(&submission).await;

        match self.repo.claim_submission(submission_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "Submission {} was claimed by another worker, skipping",
                    submission_id
                );
                return;
            }
            Err(e) => {
                error!(
                    "Failed to claim submission {}, leaving it for redelivery: {:#}",
                    submission_id, e
                );
                return;
            }
        }

        let result = match prepared {
            Ok(prepared) => self.judge(&submission, prepared, cancel).await,
            Err(message) => self.fail(&submission, message).await,
        };
        if let Err(e) = result {
            error!("Failed to process submission {}: {:#}", submission_id, e);
            let outcome = SubmissionOutcome::failure(
                SubmissionStatus::InternalError,
                "Internal error while processing submission",
            );
            if let Err(e) = self
                .repo
                .complete_submission(submission_id, &outcome, Utc::now())
                .await
            {
                error!(
                    "Failed to mark submission {} as internal error: {:#}",
                    submission_id, e
                );
            }
        }
    }

    /// Load problem, language and test cases. `Err` carries the terminal message.
    async fn prepare(&self, submission: &Submission) -> std::result::Result<Prepared, &'static str> {
        match self.repo.get_problem(submission.problem_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err("Problem not found"),
            Err(e) => {
                error!("Failed to load problem {}: {:#}", submission.problem_id, e);
                return Err("Failed to load problem");
            }
        }

        let language = match self.repo.get_language(submission.language_id).await {
            Ok(Some(language)) => language,
            Ok(None) => return Err("Language not found"),
            Err(e) => {
                error!("Failed to load language {}: {:#}", submission.language_id, e);
                return Err("Failed to load language");
            }
        };

        let samples_only = submission.flags.is_run_only;
        match self
            .repo
            .list_test_cases(submission.problem_id, samples_only)
            .await
        {
            Ok(cases) if cases.is_empty() => Err("No test cases available"),
            Ok(cases) => Ok(Prepared { language, cases }),
            Err(e) => {
                error!(
                    "Failed to load test cases for problem {}: {:#}",
                    submission.problem_id, e
                );
                Err("Failed to fetch test cases")
            }
        }
    }

    async fn judge(
        &self,
        submission: &Submission,
        prepared: Prepared,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Prepared { language, cases } = prepared;
        info!(
            "Judging submission: submission_id={}, language={}:{}, test_cases={}, run_only={}",
            submission.id,
            language.slug,
            language.runtime_version,
            cases.len(),
            submission.flags.is_run_only
        );

        let runs = run_test_cases(
            self.sandbox.as_ref(),
            &language,
            &submission.effective_code,
            &cases,
            self.max_concurrent_test_cases,
            cancel,
        )
        .await;
        let outcome = aggregate(&cases, runs);

        let stored = self
            .repo
            .complete_submission(submission.id, &outcome, Utc::now())
            .await?;
        if !stored {
            warn!(
                "Submission {} was already terminal, dropping result {}",
                submission.id, outcome.status
            );
            return Ok(());
        }
        info!(
            "Submission judged: submission_id={}, status={}, passed={}/{}, runtime_ms={:?}, memory_kb={:?}",
            submission.id,
            outcome.status,
            outcome.passed_count,
            outcome.total_count,
            outcome.runtime_ms,
            outcome.memory_kb
        );

        self.record_downstream(submission, &outcome).await
    }

    /// Terminal failure before any sandbox call; touches no stats.
    async fn fail(&self, submission: &Submission, message: &str) -> Result<()> {
        warn!(
            "Submission {} failed before execution: {}",
            submission.id, message
        );
        let outcome = SubmissionOutcome::failure(SubmissionStatus::InternalError, message);
        self.repo
            .complete_submission(submission.id, &outcome, Utc::now())
            .await?;
        Ok(())
    }

    async fn record_downstream(
        &self,
        submission: &Submission,
        outcome: &SubmissionOutcome,
    ) -> Result<()> {
        let accepted = outcome.status == SubmissionStatus::Accepted;

        if submission.flags.is_validation {
            let record = ValidationRecord {
                problem_id: submission.problem_id,
                language_id: submission.language_id,
                last_status: outcome.status,
                last_error: outcome.error_message.clone(),
                last_pass_count: outcome.passed_count,
                last_total_count: outcome.total_count,
                is_validated: accepted,
                validated_at: Utc::now(),
            };
            return self.repo.record_validation(&record).await;
        }

        if !submission.flags.affects_progress() {
            return Ok(());
        }

        self.repo
            .record_problem_result(submission.problem_id, accepted)
            .await?;
        self.repo
            .record_user_result(
                submission.user_id,
                submission.problem_id,
                submission.id,
                accepted,
                Utc::now(),
            )
            .await?;

        if let Err(e) = self.queue.enqueue_achievement(submission.id).await {
            warn!(
                "Failed to enqueue achievement job for submission {}: {:#}",
                submission.id, e
            );
        }
        Ok(())
    }
}
