//! Submission aggregate persistence.
//!
//! The Pending -> Processing claim is a conditional UPDATE so two workers
//! racing on a re-enqueued submission cannot both own it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use super::{Database, SubmissionRow, SUBMISSION_COLUMNS};
use crate::core::{NewSubmission, Submission, SubmissionOutcome, SubmissionStatus};
use crate::store::SubmissionStore;

#[async_trait]
impl SubmissionStore for Database {
    async fn create_submission(&self, new: NewSubmission) -> Result<Submission> {
        let row: SubmissionRow = sqlx::query_as(&format!(
            "INSERT INTO submissions
               (user_id, problem_id, language_id, submitted_code, effective_code, status,
                is_admin, is_validation, is_run_only, submitted_by, queued_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
             RETURNING {}",
            SUBMISSION_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.problem_id)
        .bind(new.language_id)
        .bind(&new.submitted_code)
        .bind(&new.effective_code)
        .bind(SubmissionStatus::Pending.as_str())
        .bind(new.flags.is_admin)
        .bind(new.flags.is_validation)
        .bind(new.flags.is_run_only)
        .bind(new.submitted_by)
        .bind(new.queued_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_submission(&self, id: i64) -> Result<Option<Submission>> {
        let row: Option<SubmissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM submissions WHERE id = $1",
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Submission::try_from).transpose()
    }

    async fn claim_submission(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE submissions SET status = $2 WHERE id = $1 AND status = $3")
            .bind(id)
            .bind(SubmissionStatus::Processing.as_str())
            .bind(SubmissionStatus::Pending.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_submission(
        &self,
        id: i64,
        outcome: &SubmissionOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE submissions SET
               status = $2, error_message = $3, runtime_ms = $4, memory_kb = $5,
               passed_count = $6, total_count = $7, test_results = $8, processed_at = $9
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(&outcome.error_message)
        .bind(outcome.runtime_ms)
        .bind(outcome.memory_kb)
        .bind(outcome.passed_count)
        .bind(outcome.total_count)
        .bind(Json(&outcome.test_results))
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_pending(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submissions WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn oldest_pending_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let oldest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MIN(created_at) FROM submissions WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(oldest)
    }

    async fn count_pending_before(&self, id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM submissions WHERE status = 'pending' AND id < $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM submissions
             WHERE status = 'pending' AND COALESCE(queued_at, created_at) < $1
             ORDER BY id
             LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn touch_queued_at(&self, id: i64, queued_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE submissions SET queued_at = $2 WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .bind(queued_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
