use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    FullscreenExit,
    VisibilityExit,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullscreenExit => "fullscreen_exit",
            Self::VisibilityExit => "visibility_exit",
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fullscreen_exit" | "fullscreen" => Ok(Self::FullscreenExit),
            "visibility_exit" | "visibility" => Ok(Self::VisibilityExit),
            other => Err(format!("unknown violation type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds spent out of compliance; unset while the violation is outstanding.
    pub duration_ms: Option<i64>,
}

impl Violation {
    pub fn is_outstanding(&self) -> bool {
        self.duration_ms.is_none()
    }
}
