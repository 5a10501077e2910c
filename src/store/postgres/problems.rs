use anyhow::Result;
use async_trait::async_trait;

use super::{Database, LanguageRow, ProblemRow, TestCaseRow};
use crate::core::{HarnessTemplate, Language, Problem, TestCase, ValidationRecord};
use crate::store::ProblemStore;

#[async_trait]
impl ProblemStore for Database {
    async fn get_problem(&self, id: i64) -> Result<Option<Problem>> {
        let row: Option<ProblemRow> =
            sqlx::query_as("SELECT id, title, difficulty FROM problems WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Problem::try_from).transpose()
    }

    async fn get_language(&self, id: i64) -> Result<Option<Language>> {
        let row: Option<LanguageRow> = sqlx::query_as(
            "SELECT id, slug, runtime_version, is_active FROM languages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Language::from))
    }

    async fn list_test_cases(&self, problem_id: i64, samples_only: bool) -> Result<Vec<TestCase>> {
        let rows: Vec<TestCaseRow> = sqlx::query_as(
            "SELECT id, problem_id, order_index, input, expected_output, is_sample
             FROM test_cases
             WHERE problem_id = $1 AND (NOT $2 OR is_sample)
             ORDER BY order_index, id",
        )
        .bind(problem_id)
        .bind(samples_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TestCase::from).collect())
    }

    async fn harness_template(
        &self,
        problem_id: i64,
        language_id: i64,
    ) -> Result<Option<HarnessTemplate>> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT stub_code, harness_code FROM problem_languages
             WHERE problem_id = $1 AND language_id = $2",
        )
        .bind(problem_id)
        .bind(language_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(stub_code, harness_code)| HarnessTemplate {
            stub_code,
            harness_code,
        }))
    }

    async fn record_validation(&self, record: &ValidationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO problem_languages
               (problem_id, language_id, validation_status, validation_error,
                validation_pass_count, validation_total_count, is_validated, validated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (problem_id, language_id) DO UPDATE SET
               validation_status = EXCLUDED.validation_status,
               validation_error = EXCLUDED.validation_error,
               validation_pass_count = EXCLUDED.validation_pass_count,
               validation_total_count = EXCLUDED.validation_total_count,
               is_validated = EXCLUDED.is_validated,
               validated_at = EXCLUDED.validated_at",
        )
        .bind(record.problem_id)
        .bind(record.language_id)
        .bind(record.last_status.as_str())
        .bind(&record.last_error)
        .bind(record.last_pass_count)
        .bind(record.last_total_count)
        .bind(record.is_validated)
        .bind(record.validated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
