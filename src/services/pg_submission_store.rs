use crate::error::{Error, Result};
use crate::models::question::MultipleChoiceQuestion;
use crate::models::question_result::QuestionResult;
use crate::models::submission::Submission;
use crate::models::test_case::TestCase;
use crate::models::violation::{Violation, ViolationType};
use crate::services::submission_store::SubmissionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn create_or_resume(
        &self,
        assessment_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Submission> {
        let existing = sqlx::query_as::<_, Submission>(
            r#"
            SELECT id, assessment_id, user_id, started_at, completed_at, terminated, violation_count
            FROM submissions
            WHERE assessment_id = $1 AND user_id = $2
            ORDER BY (completed_at IS NULL) DESC, started_at DESC
            LIMIT 1
            "#,
        )
        .bind(assessment_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(submission) = existing {
            return Ok(submission);
        }

        let submission = sqlx::query_as::<_, Submission>(
            r#"
            INSERT INTO submissions (id, assessment_id, user_id, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, assessment_id, user_id, started_at, completed_at, terminated, violation_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(assessment_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(submission)
    }

    async fn find_submission(&self, submission_id: Uuid) -> Result<Submission> {
        let submission = sqlx::query_as::<_, Submission>(
            r#"SELECT id, assessment_id, user_id, started_at, completed_at, terminated, violation_count
               FROM submissions WHERE id = $1"#,
        )
        .bind(submission_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(submission)
    }

    async fn violations_for(&self, submission_id: Uuid) -> Result<Vec<Violation>> {
        let rows = sqlx::query(
            r#"SELECT violation_type, occurred_at, duration_ms FROM violations
               WHERE submission_id = $1 ORDER BY seq ASC"#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Violation> {
                let raw: String = row.try_get("violation_type")?;
                let violation_type = raw.parse::<ViolationType>().map_err(Error::Internal)?;
                Ok(Violation {
                    violation_type,
                    timestamp: row.try_get("occurred_at")?,
                    duration_ms: row.try_get("duration_ms")?,
                })
            })
            .collect()
    }

    async fn append_violation(
        &self,
        submission_id: Uuid,
        index: usize,
        violation: &Violation,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO violations (submission_id, seq, violation_type, occurred_at, duration_ms)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(submission_id)
        .bind(index as i32)
        .bind(violation.violation_type.as_str())
        .bind(violation.timestamp)
        .bind(violation.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_violation(
        &self,
        submission_id: Uuid,
        index: usize,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE violations SET duration_ms = $3
               WHERE submission_id = $1 AND seq = $2 AND duration_ms IS NULL"#,
        )
        .bind(submission_id)
        .bind(index as i32)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_violation_state(
        &self,
        submission_id: Uuid,
        violation_count: i32,
        terminated: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE submissions
               SET violation_count = $2, terminated = terminated OR $3
               WHERE id = $1"#,
        )
        .bind(submission_id)
        .bind(violation_count)
        .bind(terminated)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Submission {} not found", submission_id)));
        }
        Ok(())
    }

    async fn mark_result_terminated(&self, submission_id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE question_results SET terminated = TRUE WHERE submission_id = $1"#)
            .bind(submission_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finalize_submission(
        &self,
        submission_id: Uuid,
        terminated: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE submissions
               SET completed_at = $2, terminated = terminated OR $3
               WHERE id = $1 AND completed_at IS NULL"#,
        )
        .bind(submission_id)
        .bind(completed_at)
        .bind(terminated)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn test_cases_for(&self, question_id: i32) -> Result<Vec<TestCase>> {
        let cases = sqlx::query_as::<_, TestCase>(
            r#"SELECT input, expected_output, marks, hidden, order_index
               FROM test_cases WHERE question_id = $1
               ORDER BY order_index ASC, id ASC"#,
        )
        .bind(question_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(cases)
    }

    async fn mcq_question(&self, question_id: i32) -> Result<MultipleChoiceQuestion> {
        let row = sqlx::query(
            r#"SELECT id, question, options, correct_answer, points FROM mcq_questions WHERE id = $1"#,
        )
        .bind(question_id)
        .fetch_one(&self.pool)
        .await?;
        let options: JsonValue = row.try_get("options")?;
        Ok(MultipleChoiceQuestion {
            id: row.try_get("id")?,
            question: row.try_get("question")?,
            options: serde_json::from_value(options)?,
            correct_answer: row.try_get("correct_answer")?,
            points: row.try_get("points")?,
        })
    }

    async fn save_question_result(&self, result: &QuestionResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO question_results (
                submission_id, question_id, marks_earned, marks_possible, all_passed, details, terminated, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (submission_id, question_id) DO UPDATE
            SET marks_earned = EXCLUDED.marks_earned,
                marks_possible = EXCLUDED.marks_possible,
                all_passed = EXCLUDED.all_passed,
                details = EXCLUDED.details,
                recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(result.submission_id)
        .bind(result.question_id)
        .bind(result.marks_earned)
        .bind(result.marks_possible)
        .bind(result.all_passed)
        .bind(&result.details)
        .bind(result.terminated)
        .bind(result.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn question_result(
        &self,
        submission_id: Uuid,
        question_id: i32,
    ) -> Result<Option<QuestionResult>> {
        let result = sqlx::query_as::<_, QuestionResult>(
            r#"SELECT submission_id, question_id, marks_earned, marks_possible, all_passed, details, terminated, recorded_at
               FROM question_results WHERE submission_id = $1 AND question_id = $2"#,
        )
        .bind(submission_id)
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }
}
