//! Submission intake
//!
//! Every entry point (submit, run, admin submit, validate) shares one path:
//! validate -> rate limit -> wrap in harness -> insert Pending -> enqueue.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::{NewSubmission, Submission, SubmissionFlags, SubmissionOutcome, SubmissionStatus};
use crate::error::IntakeError;
use crate::harness::HarnessProvider;
use crate::queue::JobQueue;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::store::Repository;

/// Largest accepted source file
pub const MAX_CODE_BYTES: usize = 64 * 1024;

const ENQUEUE_FAILED: &str = "Failed to enqueue submission for processing";

/// Caller identity as established by the gateway
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Option<i64>,
    pub is_admin: bool,
}

impl Viewer {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub language_id: i64,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub submission_id: i64,
    pub status: SubmissionStatus,
    #[serde(skip)]
    pub rate_limit: Option<RateLimitDecision>,
}

pub struct SubmissionService {
    repo: Arc<dyn Repository>,
    queue: Arc<dyn JobQueue>,
    harness: Arc<dyn HarnessProvider>,
    submit_limiter: RateLimiter,
    run_limiter: RateLimiter,
}

impl SubmissionService {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<dyn JobQueue>,
        harness: Arc<dyn HarnessProvider>,
        submit_limiter: RateLimiter,
        run_limiter: RateLimiter,
    ) -> Self {
        Self {
            repo,
            queue,
            harness,
            submit_limiter,
            run_limiter,
        }
    }

    pub async fn submit(
        &self,
        viewer: &Viewer,
        problem_id: i64,
        request: SubmitRequest,
    ) -> Result<SubmissionReceipt, IntakeError> {
        let limiter = (!viewer.is_admin).then_some(&self.submit_limiter);
        self.intake(viewer, problem_id, request, SubmissionFlags::default(), limiter)
            .await
    }

    /// Judge against sample test cases only; progress is untouched.
    pub async fn run_code(
        &self,
        viewer: &Viewer,
        problem_id: i64,
        request: SubmitRequest,
    ) -> Result<SubmissionReceipt, IntakeError> {
        let flags = SubmissionFlags {
            is_run_only: true,
            ..Default::default()
        };
        self.intake(viewer, problem_id, request, flags, Some(&self.run_limiter))
            .await
    }

    pub async fn admin_submit(
        &self,
        viewer: &Viewer,
        problem_id: i64,
        request: SubmitRequest,
    ) -> Result<SubmissionReceipt, IntakeError> {
        require_admin(viewer)?;
        let flags = SubmissionFlags {
            is_admin: true,
            ..Default::default()
        };
        self.intake(viewer, problem_id, request, flags, None).await
    }

    /// Judge a reference solution and record the (problem, language) validation result.
    pub async fn validate(
        &self,
        viewer: &Viewer,
        problem_id: i64,
        request: SubmitRequest,
    ) -> Result<SubmissionReceipt, IntakeError> {
        require_admin(viewer)?;
        let flags = SubmissionFlags {
            is_admin: true,
            is_validation: true,
            ..Default::default()
        };
        self.intake(viewer, problem_id, request, flags, None).await
    }

    /// Owners and admins only. Non-admins get hidden test data blanked.
    pub async fn get_submission(&self, id: i64, viewer: &Viewer) -> Result<Submission, IntakeError> {
        let not_found = || IntakeError::NotFound("Submission not found".into());
        let submission = self.repo.get_submission(id).await?.ok_or_else(not_found)?;

        if viewer.is_admin {
            return Ok(submission);
        }
        if viewer.user_id != Some(submission.user_id) {
            return Err(not_found());
        }
        Ok(submission.sanitized())
    }

    async fn intake(
        &self,
        viewer: &Viewer,
        problem_id: i64,
        request: SubmitRequest,
        flags: SubmissionFlags,
        limiter: Option<&RateLimiter>,
    ) -> Result<SubmissionReceipt, IntakeError> {
        let Some(user_id) = viewer.user_id else {
            return Err(IntakeError::Validation("User identity is required".into()));
        };
        if request.code.trim().is_empty() {
            return Err(IntakeError::Validation("Code must not be empty".into()));
        }
        if request.code.len() > MAX_CODE_BYTES {
            return Err(IntakeError::Validation(format!(
                "Code must be at most {} bytes",
                MAX_CODE_BYTES
            )));
        }

        if self.repo.get_problem(problem_id).await?.is_none() {
            return Err(IntakeError::NotFound("Problem not found".into()));
        }
        let language = match self.repo.get_language(request.language_id).await? {
            Some(language) if language.is_active => language,
            _ => return Err(IntakeError::Validation("Language is not available".into())),
        };

        let rate_limit = match limiter {
            Some(limiter) => {
                let decision = limiter.check(user_id).await;
                if !decision.allowed {
                    info!(
                        "Rate limited: scope={}, user_id={}",
                        limiter.scope().as_str(),
                        user_id
                    );
                    return Err(IntakeError::RateLimited(decision));
                }
                Some(decision)
            }
            None => None,
        };

        let template = self
            .repo
            .harness_template(problem_id, language.id)
            .await?;
        let effective_code =
            self.harness
                .effective_code(template.as_ref(), &language, &request.code);

        let submission = self
            .repo
            .create_submission(NewSubmission {
                user_id,
                problem_id,
                language_id: language.id,
                submitted_code: request.code,
                effective_code,
                flags,
                submitted_by: Some(user_id),
                queued_at: Utc::now(),
            })
            .await?;

        if let Err(e) = self.queue.enqueue_submission(submission.id).await {
            error!("Failed to enqueue submission {}: {:#}", submission.id, e);
            let outcome = SubmissionOutcome::failure(SubmissionStatus::InternalError, ENQUEUE_FAILED);
            if let Err(e) = self
                .repo
                .complete_submission(submission.id, &outcome, Utc::now())
                .await
            {
                warn!(
                    "Failed to mark submission {} as failed: {:#}",
                    submission.id, e
                );
            }
            return Err(IntakeError::Internal(e.context(ENQUEUE_FAILED)));
        }

        info!(
            "Submission queued: submission_id={}, user_id={}, problem_id={}, language={}, run_only={}, admin={}, validation={}",
            submission.id,
            user_id,
            problem_id,
            language.slug,
            flags.is_run_only,
            flags.is_admin,
            flags.is_validation
        );

        Ok(SubmissionReceipt {
            submission_id: submission.id,
            status: submission.status,
            rate_limit,
        })
    }
}

fn require_admin(viewer: &Viewer) -> Result<(), IntakeError> {
    if viewer.is_admin {
        Ok(())
    } else {
        Err(IntakeError::NotFound("Not found".into()))
    }
}
