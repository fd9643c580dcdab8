use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipleChoiceQuestion {
    #[serde(default)]
    pub id: i32,
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: i32,
    #[serde(default = "default_points")]
    pub points: i32,
}

fn default_points() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McqOutcome {
    pub question_id: i32,
    pub candidate_answer: Option<String>,
    pub correct_answer: Option<String>,
    pub points_earned: i32,
    pub max_points: i32,
    pub is_correct: bool,
}
