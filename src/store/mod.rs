//! Persistence seams
//!
//! The pipeline talks to the relational store only through these traits:
//! - [`SubmissionStore`] - the submission aggregate and its pending queries
//! - [`ProblemStore`] - read-only catalog data plus validation records
//! - [`StatsStore`] - problem aggregates and per-user progress
//! - [`AchievementStore`] - seeding, unlocks and the user progress snapshot
//!
//! [`postgres::Database`] implements all of them; tests use `memory::MemoryStore`.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::achievements::catalog::AchievementDefinition;
use crate::core::{
    Achievement, Difficulty, HarnessTemplate, Language, NewSubmission, Problem, ProblemAggregate,
    Submission, SubmissionOutcome, TestCase, UserProblemStats, ValidationRecord, XpGrant,
};

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn create_submission(&self, new: NewSubmission) -> Result<Submission>;

    async fn get_submission(&self, id: i64) -> Result<Option<Submission>>;

    /// Move a submission from Pending to Processing. Returns false when the
    /// submission was no longer Pending, i.e. another worker owns it.
    async fn claim_submission(&self, id: i64) -> Result<bool>;

    /// Persist a terminal outcome. Already terminal submissions are left
    /// untouched; returns whether this call wrote the outcome.
    async fn complete_submission(
        &self,
        id: i64,
        outcome: &SubmissionOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn count_pending(&self) -> Result<i64>;

    async fn oldest_pending_created_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Pending submissions queued ahead of `id`.
    async fn count_pending_before(&self, id: i64) -> Result<i64>;

    /// Ids of Pending submissions whose `queued_at` is older than `cutoff`, oldest first.
    async fn stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>>;

    async fn touch_queued_at(&self, id: i64, queued_at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn get_problem(&self, id: i64) -> Result<Option<Problem>>;

    async fn get_language(&self, id: i64) -> Result<Option<Language>>;

    /// Test cases ordered by `order_index`; samples only when `samples_only`.
    async fn list_test_cases(&self, problem_id: i64, samples_only: bool) -> Result<Vec<TestCase>>;

    async fn harness_template(
        &self,
        problem_id: i64,
        language_id: i64,
    ) -> Result<Option<HarnessTemplate>>;

    async fn record_validation(&self, record: &ValidationRecord) -> Result<()>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// `total_submissions += 1`, `total_accepted += accepted`, rate recomputed atomically.
    async fn record_problem_result(&self, problem_id: i64, accepted: bool) -> Result<()>;

    /// Upsert the (user, problem) progress row. Never downgrades a solve.
    async fn record_user_result(
        &self,
        user_id: i64,
        problem_id: i64,
        submission_id: i64,
        accepted: bool,
        at: DateTime<Utc>,
    ) -> Result<UserProblemStats>;

    async fn get_user_problem_stats(
        &self,
        user_id: i64,
        problem_id: i64,
    ) -> Result<Option<UserProblemStats>>;

    async fn get_problem_aggregate(&self, problem_id: i64) -> Result<ProblemAggregate>;
}

/// What the achievement rules look at for one user after one submission
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub total_solved: i64,
    pub total_accepted: i64,
    pub solved_by_difficulty: HashMap<Difficulty, i64>,
    /// Attempts on the submission's problem up to and including it
    pub attempts_on_problem: i64,
    /// Distinct UTC days with an accepted submission, most recent first
    pub solving_days: Vec<NaiveDate>,
}

#[async_trait]
pub trait AchievementStore: Send + Sync {
    /// Upsert the catalog by slug.
    async fn seed_achievements(&self, definitions: &[AchievementDefinition]) -> Result<()>;

    async fn achievement_by_slug(&self, slug: &str) -> Result<Option<Achievement>>;

    /// Insert-if-absent `(user, achievement)`; grants XP only when the row was
    /// inserted. Returns the user's new XP and level, or `None` if already unlocked.
    async fn unlock_achievement(&self, user_id: i64, achievement: &Achievement)
        -> Result<Option<XpGrant>>;

    async fn unlocked_slugs(&self, user_id: i64) -> Result<Vec<String>>;

    async fn progress_snapshot(&self, submission: &Submission) -> Result<ProgressSnapshot>;
}

/// Everything the pipeline needs from the relational store
pub trait Repository: SubmissionStore + ProblemStore + StatsStore + AchievementStore {}

impl<T> Repository for T where T: SubmissionStore + ProblemStore + StatsStore + AchievementStore {}
