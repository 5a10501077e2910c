//! Achievement seeding, unlocks and the progress snapshot.
//!
//! The unique index on `user_achievements (user_id, achievement_id)` is the
//! source of truth: XP is granted in the same transaction and only when the
//! insert actually created a row.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::types::Json;
use tracing::warn;

use super::{AchievementRow, Database, PROGRESS_FILTER};
use crate::achievements::catalog::AchievementDefinition;
use crate::core::{Achievement, Difficulty, Submission, XpGrant};
use crate::store::{AchievementStore, ProgressSnapshot};

/// Solving days older than this never extend a streak the catalog rewards.
const MAX_STREAK_DAYS: i64 = 400;

#[async_trait]
impl AchievementStore for Database {
    async fn seed_achievements(&self, definitions: &[AchievementDefinition]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for def in definitions {
            sqlx::query(
                "INSERT INTO achievements
                   (slug, name, description, category, condition_kind, condition_value, xp_reward, icon_url)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (slug) DO UPDATE SET
                   name = EXCLUDED.name,
                   description = EXCLUDED.description,
                   category = EXCLUDED.category,
                   condition_kind = EXCLUDED.condition_kind,
                   condition_value = EXCLUDED.condition_value,
                   xp_reward = EXCLUDED.xp_reward,
                   icon_url = EXCLUDED.icon_url",
            )
            .bind(&def.slug)
            .bind(&def.name)
            .bind(&def.description)
            .bind(&def.category)
            .bind(def.condition.kind())
            .bind(Json(def.condition.value()))
            .bind(def.xp_reward)
            .bind(&def.icon_url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn achievement_by_slug(&self, slug: &str) -> Result<Option<Achievement>> {
        let row: Option<AchievementRow> = sqlx::query_as(
            "SELECT id, slug, name, description, xp_reward, icon_url FROM achievements WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Achievement::from))
    }

    async fn unlock_achievement(
        &self,
        user_id: i64,
        achievement: &Achievement,
    ) -> Result<Option<XpGrant>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO user_achievements (user_id, achievement_id, unlocked_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (user_id, achievement_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(achievement.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let granted: Option<(i64, i32)> = sqlx::query_as(
            "UPDATE users SET
               xp = xp + $2,
               level = (1 + (xp + $2) / 100)::int
             WHERE id = $1
             RETURNING xp, level",
        )
        .bind(user_id)
        .bind(achievement.xp_reward as i64)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        match granted {
            Some((xp, level)) => Ok(Some(XpGrant { xp, level })),
            None => {
                warn!(
                    "Unlocked achievement {} for unknown user_id={}; no XP granted",
                    achievement.slug, user_id
                );
                Ok(Some(XpGrant { xp: 0, level: 1 }))
            }
        }
    }

    async fn unlocked_slugs(&self, user_id: i64) -> Result<Vec<String>> {
        let slugs: Vec<String> = sqlx::query_scalar(
            "SELECT a.slug FROM user_achievements ua
             JOIN achievements a ON a.id = ua.achievement_id
             WHERE ua.user_id = $1
             ORDER BY ua.unlocked_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(slugs)
    }

    async fn progress_snapshot(&self, submission: &Submission) -> Result<ProgressSnapshot> {
        let total_solved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_problem_stats WHERE user_id = $1 AND status = 'solved'",
        )
        .bind(submission.user_id)
        .fetch_one(&self.pool)
        .await?;

        let total_accepted: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM submissions WHERE user_id = $1 AND status = 'accepted' AND {}",
            PROGRESS_FILTER
        ))
        .bind(submission.user_id)
        .fetch_one(&self.pool)
        .await?;

        let by_difficulty: Vec<(String, i64)> = sqlx::query_as(
            "SELECT p.difficulty, COUNT(*) FROM user_problem_stats ups
             JOIN problems p ON p.id = ups.problem_id
             WHERE ups.user_id = $1 AND ups.status = 'solved'
             GROUP BY p.difficulty",
        )
        .bind(submission.user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut solved_by_difficulty = HashMap::new();
        for (difficulty, count) in by_difficulty {
            match difficulty.parse::<Difficulty>() {
                Ok(d) => *solved_by_difficulty.entry(d).or_insert(0) += count,
                Err(e) => warn!("Skipping solved count with {}", e),
            }
        }

        let attempts_on_problem: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM submissions
             WHERE user_id = $1 AND problem_id = $2 AND id <= $3 AND {}",
            PROGRESS_FILTER
        ))
        .bind(submission.user_id)
        .bind(submission.problem_id)
        .bind(submission.id)
        .fetch_one(&self.pool)
        .await?;

        let solving_days: Vec<NaiveDate> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT (created_at AT TIME ZONE 'UTC')::date AS day FROM submissions
             WHERE user_id = $1 AND status = 'accepted' AND {}
             ORDER BY day DESC
             LIMIT $2",
            PROGRESS_FILTER
        ))
        .bind(submission.user_id)
        .bind(MAX_STREAK_DAYS)
        .fetch_all(&self.pool)
        .await?;

        Ok(ProgressSnapshot {
            total_solved,
            total_accepted,
            solved_by_difficulty,
            attempts_on_problem,
            solving_days,
        })
    }
}
