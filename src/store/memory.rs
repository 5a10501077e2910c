//! In-memory repository for tests.
//!
//! Mirrors the Postgres semantics that matter to the pipeline: the Pending
//! claim is a compare-and-set, terminal submissions are immutable and unlocks
//! are insert-if-absent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::{AchievementStore, ProblemStore, ProgressSnapshot, StatsStore, SubmissionStore};
use crate::achievements::catalog::AchievementDefinition;
use crate::core::{
    level_for_xp, Achievement, Difficulty, HarnessTemplate, Language, NewSubmission, Problem,
    ProblemAggregate, ProgressStatus, Submission, SubmissionOutcome, SubmissionStatus, TestCase,
    UserProblemStats, ValidationRecord, XpGrant,
};

#[derive(Default)]
struct State {
    next_id: i64,
    submissions: BTreeMap<i64, Submission>,
    problems: HashMap<i64, Problem>,
    aggregates: HashMap<i64, ProblemAggregate>,
    languages: HashMap<i64, Language>,
    test_cases: Vec<TestCase>,
    harnesses: HashMap<(i64, i64), HarnessTemplate>,
    validations: HashMap<(i64, i64), ValidationRecord>,
    user_stats: HashMap<(i64, i64), UserProblemStats>,
    achievements: Vec<Achievement>,
    unlocked: HashSet<(i64, i64)>,
    unlock_order: Vec<(i64, i64)>,
    user_xp: HashMap<i64, i64>,
    claims: usize,
    test_case_reads: usize,
    /// `test_case_reads` observed by each successful claim
    reads_at_claim: Vec<usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_reads: Mutex<bool>,
    fail_submission_reads: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_problem(&self, id: i64, difficulty: Difficulty) {
        self.state.lock().unwrap().problems.insert(
            id,
            Problem {
                id,
                title: format!("Problem {}", id),
                difficulty,
            },
        );
    }

    pub fn add_language(&self, id: i64, slug: &str, version: &str) {
        self.state.lock().unwrap().languages.insert(
            id,
            Language {
                id,
                slug: slug.to_string(),
                runtime_version: version.to_string(),
                is_active: true,
            },
        );
    }

    pub fn deactivate_language(&self, id: i64) {
        if let Some(lang) = self.state.lock().unwrap().languages.get_mut(&id) {
            lang.is_active = false;
        }
    }

    pub fn add_test_case(&self, problem_id: i64, order_index: i32, input: &str, expected: &str, is_sample: bool) {
        let mut state = self.state.lock().unwrap();
        let id = state.test_cases.len() as i64 + 1;
        state.test_cases.push(TestCase {
            id,
            problem_id,
            order_index,
            input: input.to_string(),
            expected_output: expected.to_string(),
            is_sample,
        });
    }

    pub fn set_harness(&self, problem_id: i64, language_id: i64, harness: &str) {
        self.state.lock().unwrap().harnesses.insert(
            (problem_id, language_id),
            HarnessTemplate {
                stub_code: None,
                harness_code: Some(harness.to_string()),
            },
        );
    }

    /// Insert a submission directly, bypassing intake.
    pub fn insert_submission(&self, submission: Submission) {
        let mut state = self.state.lock().unwrap();
        state.next_id = state.next_id.max(submission.id);
        state.submissions.insert(submission.id, submission);
    }

    pub fn set_created_at(&self, id: i64, created_at: DateTime<Utc>) {
        if let Some(s) = self.state.lock().unwrap().submissions.get_mut(&id) {
            s.created_at = created_at;
            s.queued_at = Some(created_at);
        }
    }

    pub fn set_status(&self, id: i64, status: SubmissionStatus) {
        if let Some(s) = self.state.lock().unwrap().submissions.get_mut(&id) {
            s.status = status;
        }
    }

    pub fn submission(&self, id: i64) -> Option<Submission> {
        self.state.lock().unwrap().submissions.get(&id).cloned()
    }

    pub fn validation(&self, problem_id: i64, language_id: i64) -> Option<ValidationRecord> {
        self.state
            .lock()
            .unwrap()
            .validations
            .get(&(problem_id, language_id))
            .cloned()
    }

    pub fn user_xp(&self, user_id: i64) -> i64 {
        self.state.lock().unwrap().user_xp.get(&user_id).copied().unwrap_or(0)
    }

    pub fn unlock_rows(&self, user_id: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .unlock_order
            .iter()
            .filter(|(u, _)| *u == user_id)
            .count()
    }

    pub fn successful_claims(&self) -> usize {
        self.state.lock().unwrap().claims
    }

    /// Make every subsequent catalog read fail.
    pub fn fail_reads(&self) {
        *self.fail_reads.lock().unwrap() = true;
    }

    /// Make every subsequent `get_submission` fail.
    pub fn fail_submission_reads(&self) {
        *self.fail_submission_reads.lock().unwrap() = true;
    }

    /// Test-case reads that had happened when each successful claim was made.
    pub fn test_case_reads_at_claims(&self) -> Vec<usize> {
        self.state.lock().unwrap().reads_at_claim.clone()
    }

    fn check_reads(&self) -> Result<()> {
        if *self.fail_reads.lock().unwrap() {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn create_submission(&self, new: NewSubmission) -> Result<Submission> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let submission = Submission {
            id: state.next_id,
            user_id: new.user_id,
            problem_id: new.problem_id,
            language_id: new.language_id,
            submitted_code: new.submitted_code,
            effective_code: new.effective_code,
            status: SubmissionStatus::Pending,
            error_message: None,
            runtime_ms: None,
            memory_kb: None,
            passed_count: 0,
            total_count: 0,
            test_results: Vec::new(),
            flags: new.flags,
            submitted_by: new.submitted_by,
            queued_at: Some(new.queued_at),
            processed_at: None,
            created_at: Utc::now(),
        };
        state.submissions.insert(submission.id, submission.clone());
        Ok(submission)
    }

    async fn get_submission(&self, id: i64) -> Result<Option<Submission>> {
        if *self.fail_submission_reads.lock().unwrap() {
            anyhow::bail!("connection reset by peer");
        }
        Ok(self.state.lock().unwrap().submissions.get(&id).cloned())
    }

    async fn claim_submission(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let claimed = match state.submissions.get_mut(&id) {
            Some(s) if s.status == SubmissionStatus::Pending => {
                s.status = SubmissionStatus::Processing;
                true
            }
            _ => false,
        };
        if claimed {
            state.claims += 1;
            let reads = state.test_case_reads;
            state.reads_at_claim.push(reads);
        }
        Ok(claimed)
    }

    async fn complete_submission(
        &self,
        id: i64,
        outcome: &SubmissionOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(s) = state.submissions.get_mut(&id) else {
            return Ok(false);
        };
        if s.status.is_terminal() {
            return Ok(false);
        }
        s.status = outcome.status;
        s.error_message = outcome.error_message.clone();
        s.runtime_ms = outcome.runtime_ms;
        s.memory_kb = outcome.memory_kb;
        s.passed_count = outcome.passed_count;
        s.total_count = outcome.total_count;
        s.test_results = outcome.test_results.clone();
        s.processed_at = Some(processed_at);
        Ok(true)
    }

    async fn count_pending(&self) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .submissions
            .values()
            .filter(|s| s.status == SubmissionStatus::Pending)
            .count() as i64)
    }

    async fn oldest_pending_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .submissions
            .values()
            .filter(|s| s.status == SubmissionStatus::Pending)
            .map(|s| s.created_at)
            .min())
    }

    async fn count_pending_before(&self, id: i64) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .submissions
            .range(..id)
            .filter(|(_, s)| s.status == SubmissionStatus::Pending)
            .count() as i64)
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .submissions
            .values()
            .filter(|s| {
                s.status == SubmissionStatus::Pending && s.queued_at.unwrap_or(s.created_at) < cutoff
            })
            .map(|s| s.id)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn touch_queued_at(&self, id: i64, queued_at: DateTime<Utc>) -> Result<()> {
        if let Some(s) = self.state.lock().unwrap().submissions.get_mut(&id) {
            if s.status == SubmissionStatus::Pending {
                s.queued_at = Some(queued_at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProblemStore for MemoryStore {
    async fn get_problem(&self, id: i64) -> Result<Option<Problem>> {
        self.check_reads()?;
        Ok(self.state.lock().unwrap().problems.get(&id).cloned())
    }

    async fn get_language(&self, id: i64) -> Result<Option<Language>> {
        self.check_reads()?;
        Ok(self.state.lock().unwrap().languages.get(&id).cloned())
    }

    async fn list_test_cases(&self, problem_id: i64, samples_only: bool) -> Result<Vec<TestCase>> {
        self.check_reads()?;
        let mut state = self.state.lock().unwrap();
        state.test_case_reads += 1;
        let mut cases: Vec<TestCase> = state
            .test_cases
            .iter()
            .filter(|tc| tc.problem_id == problem_id && (!samples_only || tc.is_sample))
            .cloned()
            .collect();
        cases.sort_by_key(|tc| (tc.order_index, tc.id));
        Ok(cases)
    }

    async fn harness_template(
        &self,
        problem_id: i64,
        language_id: i64,
    ) -> Result<Option<HarnessTemplate>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .harnesses
            .get(&(problem_id, language_id))
            .cloned())
    }

    async fn record_validation(&self, record: &ValidationRecord) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .validations
            .insert((record.problem_id, record.language_id), record.clone());
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn record_problem_result(&self, problem_id: i64, accepted: bool) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .aggregates
            .entry(problem_id)
            .or_default()
            .record(accepted);
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
        let mut state = self.state.lock().unwrap();
        let existing = state.user_stats.remove(&(user_id, problem_id));
        let stats = UserProblemStats::record(existing, user_id, problem_id, submission_id, accepted, at);
        state.user_stats.insert((user_id, problem_id), stats.clone());
        Ok(stats)
    }

    async fn get_user_problem_stats(
        &self,
        user_id: i64,
        problem_id: i64,
    ) -> Result<Option<UserProblemStats>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .user_stats
            .get(&(user_id, problem_id))
            .cloned())
    }

    async fn get_problem_aggregate(&self, problem_id: i64) -> Result<ProblemAggregate> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .aggregates
            .get(&problem_id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl AchievementStore for MemoryStore {
    async fn seed_achievements(&self, definitions: &[AchievementDefinition]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for def in definitions {
            let next_id = state.achievements.len() as i64 + 1;
            match state.achievements.iter_mut().find(|a| a.slug == def.slug) {
                Some(existing) => {
                    existing.name = def.name.clone();
                    existing.description = def.description.clone();
                    existing.xp_reward = def.xp_reward;
                    existing.icon_url = def.icon_url.clone();
                }
                None => state.achievements.push(Achievement {
                    id: next_id,
                    slug: def.slug.clone(),
                    name: def.name.clone(),
                    description: def.description.clone(),
                    xp_reward: def.xp_reward,
                    icon_url: def.icon_url.clone(),
                }),
            }
        }
        Ok(())
    }

    async fn achievement_by_slug(&self, slug: &str) -> Result<Option<Achievement>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .achievements
            .iter()
            .find(|a| a.slug == slug)
            .cloned())
    }

    async fn unlock_achievement(
        &self,
        user_id: i64,
        achievement: &Achievement,
    ) -> Result<Option<XpGrant>> {
        let mut state = self.state.lock().unwrap();
        if !state.unlocked.insert((user_id, achievement.id)) {
            return Ok(None);
        }
        state.unlock_order.push((user_id, achievement.id));
        let xp = state.user_xp.entry(user_id).or_insert(0);
        *xp += achievement.xp_reward as i64;
        let xp = *xp;
        Ok(Some(XpGrant {
            xp,
            level: level_for_xp(xp),
        }))
    }

    async fn unlocked_slugs(&self, user_id: i64) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .unlock_order
            .iter()
            .filter(|(u, _)| *u == user_id)
            .filter_map(|(_, id)| state.achievements.iter().find(|a| a.id == *id))
            .map(|a| a.slug.clone())
            .collect())
    }

    async fn progress_snapshot(&self, submission: &Submission) -> Result<ProgressSnapshot> {
        let state = self.state.lock().unwrap();
        let user_id = submission.user_id;

        let mut solved_by_difficulty = HashMap::new();
        let mut total_solved = 0;
        for stats in state.user_stats.values() {
            if stats.user_id == user_id && stats.status == ProgressStatus::Solved {
                total_solved += 1;
                if let Some(problem) = state.problems.get(&stats.problem_id) {
                    *solved_by_difficulty.entry(problem.difficulty).or_insert(0) += 1;
                }
            }
        }

        let progress = state
            .submissions
            .values()
            .filter(|s| s.user_id == user_id && s.flags.affects_progress());

        let mut total_accepted = 0;
        let mut attempts_on_problem = 0;
        let mut days: Vec<NaiveDate> = Vec::new();
        for s in progress {
            if s.status == SubmissionStatus::Accepted {
                total_accepted += 1;
                days.push(s.created_at.date_naive());
            }
            if s.problem_id == submission.problem_id && s.id <= submission.id {
                attempts_on_problem += 1;
            }
        }
        days.sort_unstable_by(|a, b| b.cmp(a));
        days.dedup();

        Ok(ProgressSnapshot {
            total_solved,
            total_accepted,
            solved_by_difficulty,
            attempts_on_problem,
            solving_days: days,
        })
    }
}
