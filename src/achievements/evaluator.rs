//! Achievement evaluator
//!
//! Rule evaluation is advisory. The store's insert-if-absent unlock is what
//! makes at-least-once delivery and concurrent evaluators safe.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::catalog::{AchievementCatalog, AchievementDefinition, Condition, SpecificRule};
use crate::core::{Achievement, Submission, SubmissionStatus};
use crate::notifications::{EventPublisher, NotificationEvent};
use crate::queue::JobQueue;
use crate::store::{ProgressSnapshot, Repository};

/// Earlier attempts needed before an accepted submission earns `persistence`
const PERSISTENCE_PRIOR_ATTEMPTS: i64 = 10;

/// Consecutive days with an accepted submission, counted back from `today`,
/// or from yesterday when nothing was solved today yet.
///
/// `days` must be distinct and most recent first.
pub fn current_streak(days: &[NaiveDate], today: NaiveDate) -> i64 {
    let Some(&latest) = days.first() else {
        return 0;
    };
    let yesterday = today.pred_opt().unwrap_or(today);
    if latest != today && latest != yesterday {
        return 0;
    }

    let mut streak = 0;
    let mut expected = latest;
    for &day in days {
        if day != expected {
            break;
        }
        streak += 1;
        match expected.pred_opt() {
            Some(prev) => expected = prev,
            None => break,
        }
    }
    streak
}

/// Whether `condition` holds for the user after `submission`.
pub fn earned(
    condition: &Condition,
    submission: &Submission,
    snapshot: &ProgressSnapshot,
    today: NaiveDate,
) -> bool {
    let accepted = submission.status == SubmissionStatus::Accepted;
    match condition {
        Condition::Count { solved } => snapshot.total_solved >= *solved,
        Condition::Status { status: None } => true,
        Condition::Status {
            status: Some(status),
        } => submission.status == *status,
        Condition::DifficultyCount { difficulty, count } => {
            snapshot
                .solved_by_difficulty
                .get(difficulty)
                .copied()
                .unwrap_or(0)
                >= *count
        }
        Condition::Streak { days } => current_streak(&snapshot.solving_days, today) >= *days,
        Condition::Specific {
            rule: SpecificRule::OneShot,
        } => accepted && snapshot.attempts_on_problem == 1,
        Condition::Specific {
            rule: SpecificRule::Persistence,
        } => accepted && snapshot.attempts_on_problem - 1 >= PERSISTENCE_PRIOR_ATTEMPTS,
    }
}

pub struct AchievementEvaluator {
    queue: Arc<dyn JobQueue>,
    repo: Arc<dyn Repository>,
    publisher: Arc<dyn EventPublisher>,
    catalog: AchievementCatalog,
}

impl AchievementEvaluator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        repo: Arc<dyn Repository>,
        publisher: Arc<dyn EventPublisher>,
        catalog: AchievementCatalog,
    ) -> Self {
        Self {
            queue,
            repo,
            publisher,
            catalog,
        }
    }

    /// Upsert the catalog into the achievements table.
    pub async fn seed(&self) -> Result<()> {
        self.repo
            .seed_achievements(self.catalog.definitions())
            .await?;
        info!("Seeded {} achievements", self.catalog.len());
        Ok(())
    }

    /// Consume achievement jobs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Achievement evaluator waiting for jobs...");
        loop {
            let job = match self.queue.dequeue_achievement(&cancel).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to dequeue achievement job: {:#}. Retrying...", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if let Err(e) = self.evaluate(job.submission_id).await {
                error!(
                    "Failed to evaluate achievements for submission {}: {:#}",
                    job.submission_id, e
                );
            }
        }
        info!("Achievement evaluator stopped");
        Ok(())
    }

    /// Unlock every achievement newly earned through `submission_id`.
    /// Returns the slugs unlocked by this call.
    pub async fn evaluate(&self, submission_id: i64) -> Result<Vec<String>> {
        let Some(submission) = self.repo.get_submission(submission_id).await? else {
            warn!("Submission {} not found, discarding achievement job", submission_id);
            return Ok(Vec::new());
        };

        if !submission.flags.affects_progress() {
            debug!(
                "Submission {} does not count towards achievements",
                submission_id
            );
            return Ok(Vec::new());
        }
        if !submission.status.is_terminal() {
            warn!(
                "Submission {} is still {}, skipping achievements",
                submission_id, submission.status
            );
            return Ok(Vec::new());
        }

        let snapshot = self.repo.progress_snapshot(&submission).await?;
        let already: HashSet<String> = self
            .repo
            .unlocked_slugs(submission.user_id)
            .await?
            .into_iter()
            .collect();
        let today = Utc::now().date_naive();

        let mut unlocked = Vec::new();
        for def in self.catalog.definitions() {
            if already.contains(&def.slug) || !earned(&def.condition, &submission, &snapshot, today) {
                continue;
            }
            match self.check_and_unlock(submission.user_id, def).await {
                Ok(Some(achievement)) => unlocked.push(achievement.slug),
                Ok(None) => {}
                Err(e) => warn!(
                    "Failed to unlock {} for user_id={}: {:#}",
                    def.slug, submission.user_id, e
                ),
            }
        }
        Ok(unlocked)
    }

    async fn check_and_unlock(
        &self,
        user_id: i64,
        def: &AchievementDefinition,
    ) -> Result<Option<Achievement>> {
        let Some(achievement) = self.repo.achievement_by_slug(&def.slug).await? else {
            anyhow::bail!("achievement {} is not seeded", def.slug);
        };

        let Some(grant) = self.repo.unlock_achievement(user_id, &achievement).await? else {
            return Ok(None);
        };
        info!(
            "Achievement unlocked: user_id={}, slug={}, xp_awarded={}, xp={}, level={}",
            user_id, achievement.slug, achievement.xp_reward, grant.xp, grant.level
        );

        let event = NotificationEvent::achievement_unlocked(user_id, &achievement);
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(
                "Failed to publish unlock of {} for user_id={}: {:#}",
                achievement.slug, user_id, e
            );
        }
        Ok(Some(achievement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Difficulty, NewSubmission, SubmissionFlags, SubmissionOutcome};
    use crate::store::memory::MemoryStore;
    use crate::store::{AchievementStore, StatsStore, SubmissionStore};
    use crate::testing::{MemoryPublisher, MemoryQueue};
    use std::collections::HashMap;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    struct Setup {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        publisher: Arc<MemoryPublisher>,
        evaluator: Arc<AchievementEvaluator>,
    }

    async fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        store.add_problem(3, Difficulty::Easy);
        store.add_language(1, "python", "3.10.0");
        let queue = Arc::new(MemoryQueue::default());
        let publisher = Arc::new(MemoryPublisher::default());
        let evaluator = Arc::new(AchievementEvaluator::new(
            queue.clone(),
            store.clone(),
            publisher.clone(),
            AchievementCatalog::builtin().unwrap(),
        ));
        evaluator.seed().await.unwrap();
        Setup {
            store,
            queue,
            publisher,
            evaluator,
        }
    }

    /// Judge a submission the way the worker would.
    async fn judged(store: &MemoryStore, user_id: i64, status: SubmissionStatus, flags: SubmissionFlags) -> i64 {
        let submission = store
            .create_submission(NewSubmission {
                user_id,
                problem_id: 3,
                language_id: 1,
                submitted_code: "x".into(),
                effective_code: "x".into(),
                flags,
                submitted_by: Some(user_id),
                queued_at: Utc::now(),
            })
            .await
            .unwrap();
        let mut outcome = SubmissionOutcome::failure(status, "");
        outcome.error_message = None;
        store
            .complete_submission(submission.id, &outcome, Utc::now())
            .await
            .unwrap();
        if flags.affects_progress() {
            store
                .record_user_result(user_id, 3, submission.id, status == SubmissionStatus::Accepted, Utc::now())
                .await
                .unwrap();
        }
        submission.id
    }

    fn snapshot(attempts: i64) -> ProgressSnapshot {
        ProgressSnapshot {
            total_solved: 0,
            total_accepted: 0,
            solved_by_difficulty: HashMap::new(),
            attempts_on_problem: attempts,
            solving_days: Vec::new(),
        }
    }

    #[test]
    fn test_streak_counts_back_from_today() {
        let today = day("2024-05-10");
        let days = vec![day("2024-05-10"), day("2024-05-09"), day("2024-05-08"), day("2024-05-05")];
        assert_eq!(current_streak(&days, today), 3);
    }

    #[test]
    fn test_streak_survives_until_end_of_today() {
        let today = day("2024-05-10");
        let days = vec![day("2024-05-09"), day("2024-05-08")];
        assert_eq!(current_streak(&days, today), 2);
    }

    #[test]
    fn test_streak_broken() {
        let today = day("2024-05-10");
        assert_eq!(current_streak(&[day("2024-05-08")], today), 0);
        assert_eq!(current_streak(&[], today), 0);
    }

    #[tokio::test]
    async fn test_specific_rules_use_attempt_count() {
        let s = setup().await;
        let id = judged(&s.store, 7, SubmissionStatus::Accepted, SubmissionFlags::default()).await;
        let submission = s.store.submission(id).unwrap();
        let today = Utc::now().date_naive();
        let one_shot = Condition::Specific { rule: SpecificRule::OneShot };
        let persistence = Condition::Specific { rule: SpecificRule::Persistence };

        assert!(earned(&one_shot, &submission, &snapshot(1), today));
        assert!(!earned(&one_shot, &submission, &snapshot(2), today));
        assert!(!earned(&persistence, &submission, &snapshot(10), today));
        assert!(earned(&persistence, &submission, &snapshot(11), today));
    }

    #[tokio::test]
    async fn test_first_accepted_submission_unlocks_starters() {
        let s = setup().await;
        let id = judged(&s.store, 7, SubmissionStatus::Accepted, SubmissionFlags::default()).await;

        let unlocked = s.evaluator.evaluate(id).await.unwrap();
        for slug in ["hello-world", "first-blood", "solver-i", "one-shot"] {
            assert!(unlocked.contains(&slug.to_string()), "missing {}", slug);
        }
        assert!(!unlocked.contains(&"bug-hunter".to_string()));
        assert!(!unlocked.contains(&"getting-serious".to_string()));
        assert_eq!(s.store.user_xp(7), 10 + 50 + 10 + 20);
        assert_eq!(s.publisher.events().len(), unlocked.len());
        assert!(s
            .publisher
            .events()
            .iter()
            .all(|e| e.user_id() == Some(7)));
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let s = setup().await;
        let id = judged(&s.store, 7, SubmissionStatus::Accepted, SubmissionFlags::default()).await;

        let first = s.evaluator.evaluate(id).await.unwrap();
        let xp = s.store.user_xp(7);
        let rows = s.store.unlock_rows(7);

        let second = s.evaluator.evaluate(id).await.unwrap();
        assert!(!first.is_empty());
        assert!(second.is_empty());
        assert_eq!(s.store.user_xp(7), xp);
        assert_eq!(s.store.unlock_rows(7), rows);
        assert_eq!(s.publisher.events().len(), first.len());
    }

    #[tokio::test]
    async fn test_concurrent_evaluation_unlocks_once() {
        let s = setup().await;
        let id = judged(&s.store, 7, SubmissionStatus::Accepted, SubmissionFlags::default()).await;

        let a = {
            let evaluator = s.evaluator.clone();
            tokio::spawn(async move { evaluator.evaluate(id).await })
        };
        let b = {
            let evaluator = s.evaluator.clone();
            tokio::spawn(async move { evaluator.evaluate(id).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.len() + b.len(), s.store.unlock_rows(7));
        assert_eq!(s.store.user_xp(7), 90);
        let slugs: HashSet<String> = s.store.unlocked_slugs(7).await.unwrap().into_iter().collect();
        assert_eq!(slugs.len(), s.store.unlock_rows(7));
    }

    #[tokio::test]
    async fn test_wrong_answer_unlocks_bug_hunter_only() {
        let s = setup().await;
        let id = judged(&s.store, 12, SubmissionStatus::WrongAnswer, SubmissionFlags::default()).await;

        let mut unlocked = s.evaluator.evaluate(id).await.unwrap();
        unlocked.sort();
        assert_eq!(unlocked, vec!["bug-hunter".to_string(), "hello-world".to_string()]);
        assert_eq!(s.store.user_xp(12), 20);
    }

    #[tokio::test]
    async fn test_admin_and_validation_submissions_are_discarded() {
        let s = setup().await;
        let admin = judged(
            &s.store,
            1,
            SubmissionStatus::Accepted,
            SubmissionFlags { is_admin: true, ..Default::default() },
        )
        .await;
        let validation = judged(
            &s.store,
            1,
            SubmissionStatus::Accepted,
            SubmissionFlags { is_admin: true, is_validation: true, ..Default::default() },
        )
        .await;

        assert!(s.evaluator.evaluate(admin).await.unwrap().is_empty());
        assert!(s.evaluator.evaluate(validation).await.unwrap().is_empty());
        assert_eq!(s.store.unlock_rows(1), 0);
        assert!(s.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_consumes_jobs_until_cancelled() {
        let s = setup().await;
        let id = judged(&s.store, 7, SubmissionStatus::Accepted, SubmissionFlags::default()).await;
        s.queue.enqueue_achievement(id).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let evaluator = s.evaluator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { evaluator.run(cancel).await })
        };

        for _ in 0..200 {
            if s.store.unlock_rows(7) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        tokio_test::assert_ok!(handle.await.unwrap());
        assert!(s.store.unlock_rows(7) >= 3);
    }
}
