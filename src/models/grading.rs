use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution status reported by the remote judge, keyed by its numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeStatus {
    InQueue,
    Processing,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    CompilationError,
    RuntimeError,
    InternalError,
    ExecFormatError,
    Unknown(i32),
}

impl JudgeStatus {
    pub fn from_id(id: i32) -> Self {
        match id {
            1 => Self::InQueue,
            2 => Self::Processing,
            3 => Self::Accepted,
            4 => Self::WrongAnswer,
            5 => Self::TimeLimitExceeded,
            6 => Self::CompilationError,
            7 => Self::RuntimeError,
            8 => Self::InternalError,
            9 => Self::ExecFormatError,
            other => Self::Unknown(other),
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            Self::InQueue => 1,
            Self::Processing => 2,
            Self::Accepted => 3,
            Self::WrongAnswer => 4,
            Self::TimeLimitExceeded => 5,
            Self::CompilationError => 6,
            Self::RuntimeError => 7,
            Self::InternalError => 8,
            Self::ExecFormatError => 9,
            Self::Unknown(id) => *id,
        }
    }

    /// Terminal iff the id is 3 or above. Unknown ids past the table count as terminal too.
    pub fn is_terminal(&self) -> bool {
        self.id() >= 3
    }

    /// Ids 6 and up are judge-side errors.
    pub fn is_error(&self) -> bool {
        self.id() >= 6
    }
}

/// One remote execution attempt for a single test case. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub token: String,
    pub code: String,
    pub language: String,
    pub status: JudgeStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseOutcome {
    pub index: usize,
    pub order_index: i32,
    pub passed: bool,
    pub status: JudgeStatus,
    /// Stdout on success, otherwise the judge diagnostic, normalised for display.
    pub output: String,
    pub marks_earned: i32,
    pub marks_possible: i32,
    pub hidden: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingResult {
    pub outcomes: Vec<TestCaseOutcome>,
    pub total_marks_earned: i32,
    pub total_marks_possible: i32,
    pub all_passed: bool,
}

impl GradingResult {
    pub fn from_outcomes(outcomes: Vec<TestCaseOutcome>) -> Self {
        let total_marks_earned = outcomes.iter().map(|o| o.marks_earned).sum();
        let total_marks_possible = outcomes.iter().map(|o| o.marks_possible).sum();
        let all_passed = outcomes.iter().all(|o| o.passed);
        Self {
            outcomes,
            total_marks_earned,
            total_marks_possible,
            all_passed,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
