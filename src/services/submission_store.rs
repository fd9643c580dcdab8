use crate::error::{Error, Result};
use crate::models::question::MultipleChoiceQuestion;
use crate::models::question_result::QuestionResult;
use crate::models::submission::Submission;
use crate::models::test_case::TestCase;
use crate::models::violation::Violation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Persistence collaborator for submissions, violations, test cases and marks.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Return the caller's open submission for the assessment, or the most recent one, or a new one.
    async fn create_or_resume(
        &self,
        assessment_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Submission>;

    async fn find_submission(&self, submission_id: Uuid) -> Result<Submission>;

    async fn violations_for(&self, submission_id: Uuid) -> Result<Vec<Violation>>;

    async fn append_violation(
        &self,
        submission_id: Uuid,
        index: usize,
        violation: &Violation,
    ) -> Result<()>;

    async fn close_violation(&self, submission_id: Uuid, index: usize, duration_ms: i64)
        -> Result<()>;

    async fn update_violation_state(
        &self,
        submission_id: Uuid,
        violation_count: i32,
        terminated: bool,
    ) -> Result<()>;

    /// Flag every recorded result of the submission as terminated.
    async fn mark_result_terminated(&self, submission_id: Uuid) -> Result<()>;

    /// Set `completed_at` if still unset. Returns `false` when it was already set.
    async fn finalize_submission(
        &self,
        submission_id: Uuid,
        terminated: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Test cases for a coding question, ordered by order index.
    async fn test_cases_for(&self, question_id: i32) -> Result<Vec<TestCase>>;

    async fn mcq_question(&self, question_id: i32) -> Result<MultipleChoiceQuestion>;

    async fn save_question_result(&self, result: &QuestionResult) -> Result<()>;

    async fn question_result(
        &self,
        submission_id: Uuid,
        question_id: i32,
    ) -> Result<Option<QuestionResult>>;
}

#[derive(Default)]
struct MemoryTables {
    submissions: HashMap<Uuid, Submission>,
    violations: HashMap<Uuid, Vec<Violation>>,
    test_cases: HashMap<i32, Vec<TestCase>>,
    mcq: HashMap<i32, MultipleChoiceQuestion>,
    results: HashMap<(Uuid, i32), QuestionResult>,
}

/// In-process store used by tests and the `memory` backend.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<MemoryTables>,
    fail_writes: AtomicBool,
    finalize_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_test_cases(&self, question_id: i32, cases: Vec<TestCase>) {
        self.tables().test_cases.insert(question_id, cases);
    }

    pub fn insert_mcq(&self, question: MultipleChoiceQuestion) {
        self.tables().mcq.insert(question.id, question);
    }

    /// Make every write fail, simulating an unavailable backend.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `finalize_submission` calls that actually set `completed_at`.
    pub fn finalize_writes(&self) -> usize {
        self.finalize_writes.load(Ordering::SeqCst)
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for InMemoryStore {
    async fn create_or_resume(
        &self,
        assessment_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Submission> {
        self.check_writable()?;
        let mut tables = self.tables();
        let existing = tables
            .submissions
            .values()
            .filter(|s| s.assessment_id == assessment_id && s.user_id == user_id)
            .max_by_key(|s| (s.completed_at.is_none(), s.started_at))
            .cloned();
        if let Some(submission) = existing {
            return Ok(submission);
        }
        let submission = Submission::new(assessment_id, user_id, now);
        tables.submissions.insert(submission.id, submission.clone());
        Ok(submission)
    }

    async fn find_submission(&self, submission_id: Uuid) -> Result<Submission> {
        self.tables()
            .submissions
            .get(&submission_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Submission {} not found", submission_id)))
    }

    async fn violations_for(&self, submission_id: Uuid) -> Result<Vec<Violation>> {
        Ok(self
            .tables()
            .violations
            .get(&submission_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_violation(
        &self,
        submission_id: Uuid,
        index: usize,
        violation: &Violation,
    ) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables();
        if !tables.submissions.contains_key(&submission_id) {
            return Err(Error::NotFound(format!("Submission {} not found", submission_id)));
        }
        let rows = tables.violations.entry(submission_id).or_default();
        if index != rows.len() {
            return Err(Error::Internal(format!(
                "violation index {} out of sequence (have {})",
                index,
                rows.len()
            )));
        }
        rows.push(violation.clone());
        Ok(())
    }

    async fn close_violation(
        &self,
        submission_id: Uuid,
        index: usize,
        duration_ms: i64,
    ) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables();
        let row = tables
            .violations
            .get_mut(&submission_id)
            .and_then(|rows| rows.get_mut(index))
            .ok_or_else(|| Error::NotFound(format!("Violation {} not found", index)))?;
        if row.duration_ms.is_none() {
            row.duration_ms = Some(duration_ms);
        }
        Ok(())
    }

    async fn update_violation_state(
        &self,
        submission_id: Uuid,
        violation_count: i32,
        terminated: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables();
        let submission = tables
            .submissions
            .get_mut(&submission_id)
            .ok_or_else(|| Error::NotFound(format!("Submission {} not found", submission_id)))?;
        submission.violation_count = violation_count;
        submission.terminated |= terminated;
        Ok(())
    }

    async fn mark_result_terminated(&self, submission_id: Uuid) -> Result<()> {
        self.check_writable()?;
        for ((sid, _), result) in self.tables().results.iter_mut() {
            if *sid == submission_id {
                result.terminated = true;
            }
        }
        Ok(())
    }

    async fn finalize_submission(
        &self,
        submission_id: Uuid,
        terminated: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let mut tables = self.tables();
        let submission = tables
            .submissions
            .get_mut(&submission_id)
            .ok_or_else(|| Error::NotFound(format!("Submission {} not found", submission_id)))?;
        if submission.completed_at.is_some() {
            return Ok(false);
        }
        submission.completed_at = Some(completed_at);
        submission.terminated |= terminated;
        self.finalize_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn test_cases_for(&self, question_id: i32) -> Result<Vec<TestCase>> {
        let mut cases = self
            .tables()
            .test_cases
            .get(&question_id)
            .cloned()
            .unwrap_or_default();
        cases.sort_by_key(|c| c.order_index);
        Ok(cases)
    }

    async fn mcq_question(&self, question_id: i32) -> Result<MultipleChoiceQuestion> {
        self.tables()
            .mcq
            .get(&question_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Question {} not found", question_id)))
    }

    async fn save_question_result(&self, result: &QuestionResult) -> Result<()> {
        self.check_writable()?;
        self.tables()
            .results
            .insert((result.submission_id, result.question_id), result.clone());
        Ok(())
    }

    async fn question_result(
        &self,
        submission_id: Uuid,
        question_id: i32,
    ) -> Result<Option<QuestionResult>> {
        Ok(self
            .tables()
            .results
            .get(&(submission_id, question_id))
            .cloned())
    }
}
