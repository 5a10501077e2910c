//! Problem aggregates and user progress.
//!
//! Both writes are single statements: the row lock taken by UPDATE / the
//! upsert serializes concurrent increments per problem and per (user, problem).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Database, UserProblemStatsRow};
use crate::core::{ProblemAggregate, UserProblemStats};
use crate::store::StatsStore;

#[async_trait]
impl StatsStore for Database {
    async fn record_problem_result(&self, problem_id: i64, accepted: bool) -> Result<()> {
        let accepted_delta: i64 = if accepted { 1 } else { 0 };
        sqlx::query(
            "UPDATE problems SET
               total_submissions = total_submissions + 1,
               total_accepted = total_accepted + $2,
               acceptance_rate = (total_accepted + $2)::double precision / (total_submissions + 1)
             WHERE id = $1",
        )
        .bind(problem_id)
        .bind(accepted_delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_user_result(
        &self,
        user_id: i64,
        problem_id: i64,
        submission_id: i64,
        accepted: bool,
        at: DateTime<Utc>,
    ) -> Result<UserProblemStats> {
        let row: UserProblemStatsRow = sqlx::query_as(
            "INSERT INTO user_problem_stats
               (user_id, problem_id, status, attempts, first_solved_at, best_submission_id, updated_at)
             VALUES (
               $1, $2,
               CASE WHEN $4 THEN 'solved' ELSE 'attempted' END,
               1,
               CASE WHEN $4 THEN $5 END,
               CASE WHEN $4 THEN $3 END,
               $5)
             ON CONFLICT (user_id, problem_id) DO UPDATE SET
               attempts = user_problem_stats.attempts + 1,
               status = CASE
                 WHEN user_problem_stats.status = 'solved' OR $4 THEN 'solved'
                 ELSE 'attempted' END,
               first_solved_at = CASE
                 WHEN user_problem_stats.status <> 'solved' AND $4 THEN $5
                 ELSE user_problem_stats.first_solved_at END,
               best_submission_id = CASE
                 WHEN user_problem_stats.status <> 'solved' AND $4 THEN $3
                 ELSE user_problem_stats.best_submission_id END,
               updated_at = $5
             RETURNING user_id, problem_id, status, attempts, first_solved_at, best_submission_id",
        )
        .bind(user_id)
        .bind(problem_id)
        .bind(submission_id)
        .bind(accepted)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_user_problem_stats(
        &self,
        user_id: i64,
        problem_id: i64,
    ) -> Result<Option<UserProblemStats>> {
        let row: Option<UserProblemStatsRow> = sqlx::query_as(
            "SELECT user_id, problem_id, status, attempts, first_solved_at, best_submission_id
             FROM user_problem_stats WHERE user_id = $1 AND problem_id = $2",
        )
        .bind(user_id)
        .bind(problem_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserProblemStats::try_from).transpose()
    }

    async fn get_problem_aggregate(&self, problem_id: i64) -> Result<ProblemAggregate> {
        let row: Option<(i64, i64, f64)> = sqlx::query_as(
            "SELECT total_submissions, total_accepted, acceptance_rate FROM problems WHERE id = $1",
        )
        .bind(problem_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|(total_submissions, total_accepted, acceptance_rate)| ProblemAggregate {
                total_submissions,
                total_accepted,
                acceptance_rate,
            })
            .unwrap_or_default())
    }
}
