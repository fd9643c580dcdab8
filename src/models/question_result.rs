use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

/// Marks recorded for one question of one submission. Keyed by (submission, question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct QuestionResult {
    pub submission_id: Uuid,
    pub question_id: i32,
    pub marks_earned: i32,
    pub marks_possible: i32,
    pub all_passed: bool,
    pub details: JsonValue,
    pub terminated: bool,
    pub recorded_at: DateTime<Utc>,
}
