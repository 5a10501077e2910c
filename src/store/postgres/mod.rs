//! # Database - PostgreSQL storage
//!
//! `Database` wraps a `sqlx::PgPool` and implements every store trait.
//! The schema it expects is documented in `files/schema.sql`.
//!
//! ## Module Structure
//!
//! - [`submissions`] - submission aggregate, pending queries
//! - [`problems`] - problems, languages, test cases, harness and validation records
//! - [`stats`] - problem aggregates and user progress upserts
//! - [`achievements`] - catalog seeding, unlocks, progress snapshot
//!
//! Status-like columns are stored as snake_case text.

mod achievements;
mod problems;
mod stats;
mod submissions;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use crate::core::{
    Achievement, Language, Problem, ProgressStatus, Submission, SubmissionFlags, TestCase,
    TestCaseResult, UserProblemStats,
};

/// Filter selecting submissions that count towards user progression
const PROGRESS_FILTER: &str = "NOT is_admin AND NOT is_validation AND NOT is_run_only";

const SUBMISSION_COLUMNS: &str = "id, user_id, problem_id, language_id, submitted_code, \
     effective_code, status, error_message, runtime_ms, memory_kb, passed_count, total_count, \
     test_results, is_admin, is_validation, is_run_only, submitted_by, queued_at, processed_at, \
     created_at";

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: i64,
    user_id: i64,
    problem_id: i64,
    language_id: i64,
    submitted_code: String,
    effective_code: String,
    status: String,
    error_message: Option<String>,
    runtime_ms: Option<i64>,
    memory_kb: Option<i64>,
    passed_count: i32,
    total_count: i32,
    test_results: Json<Vec<TestCaseResult>>,
    is_admin: bool,
    is_validation: bool,
    is_run_only: bool,
    submitted_by: Option<i64>,
    queued_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = anyhow::Error;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        Ok(Submission {
            id: row.id,
            user_id: row.user_id,
            problem_id: row.problem_id,
            language_id: row.language_id,
            submitted_code: row.submitted_code,
            effective_code: row.effective_code,
            status: row.status.parse()?,
            error_message: row.error_message,
            runtime_ms: row.runtime_ms,
            memory_kb: row.memory_kb,
            passed_count: row.passed_count,
            total_count: row.total_count,
            test_results: row.test_results.0,
            flags: SubmissionFlags {
                is_admin: row.is_admin,
                is_validation: row.is_validation,
                is_run_only: row.is_run_only,
            },
            submitted_by: row.submitted_by,
            queued_at: row.queued_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProblemRow {
    id: i64,
    title: String,
    difficulty: String,
}

impl TryFrom<ProblemRow> for Problem {
    type Error = anyhow::Error;

    fn try_from(row: ProblemRow) -> Result<Self> {
        Ok(Problem {
            id: row.id,
            title: row.title,
            difficulty: row.difficulty.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LanguageRow {
    id: i64,
    slug: String,
    runtime_version: String,
    is_active: bool,
}

impl From<LanguageRow> for Language {
    fn from(row: LanguageRow) -> Self {
        Language {
            id: row.id,
            slug: row.slug,
            runtime_version: row.runtime_version,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TestCaseRow {
    id: i64,
    problem_id: i64,
    order_index: i32,
    input: String,
    expected_output: String,
    is_sample: bool,
}

impl From<TestCaseRow> for TestCase {
    fn from(row: TestCaseRow) -> Self {
        TestCase {
            id: row.id,
            problem_id: row.problem_id,
            order_index: row.order_index,
            input: row.input,
            expected_output: row.expected_output,
            is_sample: row.is_sample,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserProblemStatsRow {
    user_id: i64,
    problem_id: i64,
    status: String,
    attempts: i32,
    first_solved_at: Option<DateTime<Utc>>,
    best_submission_id: Option<i64>,
}

impl TryFrom<UserProblemStatsRow> for UserProblemStats {
    type Error = anyhow::Error;

    fn try_from(row: UserProblemStatsRow) -> Result<Self> {
        Ok(UserProblemStats {
            user_id: row.user_id,
            problem_id: row.problem_id,
            status: row.status.parse::<ProgressStatus>()?,
            attempts: row.attempts,
            first_solved_at: row.first_solved_at,
            best_submission_id: row.best_submission_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AchievementRow {
    id: i64,
    slug: String,
    name: String,
    description: String,
    xp_reward: i32,
    icon_url: Option<String>,
}

impl From<AchievementRow> for Achievement {
    fn from(row: AchievementRow) -> Self {
        Achievement {
            id: row.id,
            slug: row.slug,
            name: row.name,
            description: row.description,
            xp_reward: row.xp_reward,
            icon_url: row.icon_url,
        }
    }
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Database { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
