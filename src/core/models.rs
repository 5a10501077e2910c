//! Domain records shared by the intake surface, the worker and the stores.
//!
//! Back-references (submission -> user / problem / language) are plain ids;
//! the stores resolve them on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::verdict::{Difficulty, ProgressStatus, SubmissionStatus, TestStatus};

/// Flags that decide which downstream state a submission may touch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFlags {
    pub is_admin: bool,
    pub is_validation: bool,
    pub is_run_only: bool,
}

impl SubmissionFlags {
    /// Only regular user submissions feed problem stats, user progress and achievements.
    pub fn affects_progress(&self) -> bool {
        !self.is_admin && !self.is_validation && !self.is_run_only
    }
}

/// Result of evaluating one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub status: TestStatus,
    pub is_sample: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<i64>,
}

impl TestCaseResult {
    /// Blank the data of hidden test cases.
    pub fn sanitize(&mut self) {
        if !self.is_sample {
            self.input.clear();
            self.expected_output.clear();
            self.actual_output.clear();
        }
    }
}

/// One unit of evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: i64,
    pub user_id: i64,
    pub problem_id: i64,
    pub language_id: i64,
    pub submitted_code: String,
    /// User code wrapped in the problem's harness
    pub effective_code: String,
    pub status: SubmissionStatus,
    pub error_message: Option<String>,
    pub runtime_ms: Option<i64>,
    pub memory_kb: Option<i64>,
    pub passed_count: i32,
    pub total_count: i32,
    pub test_results: Vec<TestCaseResult>,
    #[serde(flatten)]
    pub flags: SubmissionFlags,
    pub submitted_by: Option<i64>,
    pub queued_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Submission {
    /// View handed to non-admin viewers: hidden test data is blanked and the
    /// harness-wrapped code is not exposed.
    ///
    /// Wrong-answer and runtime-error messages quote the failing case's input
    /// or output, so they are replaced when that case is hidden.
    pub fn sanitized(mut self) -> Self {
        let first_failure = self
            .test_results
            .iter()
            .position(|result| result.status == TestStatus::Failed);
        if let Some(idx) = first_failure {
            let quotes_case = matches!(
                self.status,
                SubmissionStatus::WrongAnswer | SubmissionStatus::RuntimeError
            );
            if quotes_case && !self.test_results[idx].is_sample {
                self.error_message = Some(format!("Failed on hidden test case {}", idx + 1));
            }
        }
        for result in &mut self.test_results {
            result.sanitize();
        }
        self.effective_code.clear();
        self
    }
}

/// Everything needed to insert a new Pending submission
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub user_id: i64,
    pub problem_id: i64,
    pub language_id: i64,
    pub submitted_code: String,
    pub effective_code: String,
    pub flags: SubmissionFlags,
    pub submitted_by: Option<i64>,
    pub queued_at: DateTime<Utc>,
}

/// Terminal state written back by the worker
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub status: SubmissionStatus,
    pub error_message: Option<String>,
    pub runtime_ms: Option<i64>,
    pub memory_kb: Option<i64>,
    pub passed_count: i32,
    pub total_count: i32,
    pub test_results: Vec<TestCaseResult>,
}

impl SubmissionOutcome {
    /// Terminal failure that never reached the sandbox.
    pub fn failure(status: SubmissionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(message.into()),
            runtime_ms: None,
            memory_kb: None,
            passed_count: 0,
            total_count: 0,
            test_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    pub title: String,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub problem_id: i64,
    pub order_index: i32,
    pub input: String,
    pub expected_output: String,
    pub is_sample: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    pub id: i64,
    /// Sandbox language name (e.g. "python")
    pub slug: String,
    /// Sandbox runtime version (e.g. "3.10.0")
    pub runtime_version: String,
    pub is_active: bool,
}

/// Stored harness for a (problem, language) pair
#[derive(Debug, Clone, Default)]
pub struct HarnessTemplate {
    pub stub_code: Option<String>,
    pub harness_code: Option<String>,
}

/// Per (user, problem) progression. Once solved, never downgrades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProblemStats {
    pub user_id: i64,
    pub problem_id: i64,
    pub status: ProgressStatus,
    pub attempts: i32,
    pub first_solved_at: Option<DateTime<Utc>>,
    pub best_submission_id: Option<i64>,
}

impl UserProblemStats {
    /// Apply one terminal submission to the (possibly absent) stats row.
    pub fn record(
        existing: Option<UserProblemStats>,
        user_id: i64,
        problem_id: i64,
        submission_id: i64,
        accepted: bool,
        now: DateTime<Utc>,
    ) -> UserProblemStats {
        match existing {
            None => UserProblemStats {
                user_id,
                problem_id,
                status: if accepted {
                    ProgressStatus::Solved
                } else {
                    ProgressStatus::Attempted
                },
                attempts: 1,
                first_solved_at: accepted.then_some(now),
                best_submission_id: accepted.then_some(submission_id),
            },
            Some(mut stats) => {
                stats.attempts += 1;
                if stats.status != ProgressStatus::Solved {
                    if accepted {
                        stats.status = ProgressStatus::Solved;
                        stats.first_solved_at = Some(now);
                        stats.best_submission_id = Some(submission_id);
                    } else {
                        stats.status = ProgressStatus::Attempted;
                    }
                }
                stats
            }
        }
    }
}

/// Per problem counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemAggregate {
    pub total_submissions: i64,
    pub total_accepted: i64,
    pub acceptance_rate: f64,
}

impl ProblemAggregate {
    pub fn record(&mut self, accepted: bool) {
        self.total_submissions += 1;
        if accepted {
            self.total_accepted += 1;
        }
        self.acceptance_rate = self.total_accepted as f64 / self.total_submissions.max(1) as f64;
    }
}

/// Problem-language validation record written by validation submissions
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRecord {
    pub problem_id: i64,
    pub language_id: i64,
    pub last_status: SubmissionStatus,
    pub last_error: Option<String>,
    pub last_pass_count: i32,
    pub last_total_count: i32,
    pub is_validated: bool,
    pub validated_at: DateTime<Utc>,
}

/// Seeded achievement row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Achievement {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub xp_reward: i32,
    pub icon_url: Option<String>,
}

/// User XP after a successful unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpGrant {
    pub xp: i64,
    pub level: i32,
}

/// Level curve: one level per 100 XP, starting at 1.
pub fn level_for_xp(xp: i64) -> i32 {
    1 + (xp.max(0) / 100) as i32
}
