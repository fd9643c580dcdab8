use crate::models::violation::{Violation, ViolationType};
use chrono::{DateTime, Utc};

/// Append-only record of compliance violations for one submission.
///
/// At most one violation is outstanding (duration unset) at any time: recording
/// a new violation while one is still open closes the previous one first.
#[derive(Debug, Clone, Default)]
pub struct ViolationLedger {
    violations: Vec<Violation>,
}

impl ViolationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted rows, e.g. when a session is resumed.
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn record(&mut self, violation_type: ViolationType, timestamp: DateTime<Utc>) -> usize {
        self.close_outstanding(timestamp);
        self.violations.push(Violation {
            violation_type,
            timestamp,
            duration_ms: None,
        });
        self.violations.len() - 1
    }

    /// Fill in the duration of the open violation. Returns its index and the duration in ms.
    pub fn close_outstanding(&mut self, timestamp: DateTime<Utc>) -> Option<(usize, i64)> {
        let index = self.outstanding()?;
        let violation = &mut self.violations[index];
        let elapsed = (timestamp - violation.timestamp).num_milliseconds().max(0);
        violation.duration_ms = Some(elapsed);
        Some((index, elapsed))
    }

    pub fn outstanding(&self) -> Option<usize> {
        self.violations
            .last()
            .filter(|v| v.is_outstanding())
            .map(|_| self.violations.len() - 1)
    }

    pub fn count_for(&self, violation_type: ViolationType) -> usize {
        self.violations
            .iter()
            .filter(|v| v.violation_type == violation_type)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.violations.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}
