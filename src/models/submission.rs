use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Submission {
    pub id: Uuid,
    pub assessment_id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub terminated: bool,
    pub violation_count: i32,
}

impl Submission {
    pub fn new(assessment_id: Uuid, user_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            assessment_id,
            user_id,
            started_at,
            completed_at: None,
            terminated: false,
            violation_count: 0,
        }
    }

    /// A submission is final once `completed_at` is set, whichever path set it.
    pub fn is_final(&self) -> bool {
        self.completed_at.is_some()
    }
}
