use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_marks")]
    pub marks: i32,
    #[serde(default)]
    pub hidden: bool,
    pub order_index: i32,
}

fn default_marks() -> i32 {
    1
}

impl TestCase {
    /// Negative weights from the store are treated as zero.
    pub fn weight(&self) -> i32 {
        self.marks.max(0)
    }
}
