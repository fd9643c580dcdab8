use crate::error::{Error, Result};
use crate::models::grading::{GradingJob, GradingResult, JudgeStatus, TestCaseOutcome};
use crate::models::question::{McqOutcome, MultipleChoiceQuestion};
use crate::models::test_case::TestCase;
use crate::services::judge_client::{poll_until_terminal, ExecutionClient, JudgeError, PollPolicy};
use crate::utils::text::{normalize_for_display, outputs_match};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct GradingService {
    client: Arc<dyn ExecutionClient>,
    poll: PollPolicy,
}

impl GradingService {
    pub fn new(client: Arc<dyn ExecutionClient>, poll: PollPolicy) -> Self {
        Self { client, poll }
    }

    /// Lazily run every test case in order-index order, one at a time.
    ///
    /// Each call returns a fresh stream, so a run can be restarted from the first case.
    pub fn outcomes<'a>(
        &'a self,
        code: &'a str,
        language: &'a str,
        cases: &[TestCase],
    ) -> Result<impl Stream<Item = TestCaseOutcome> + 'a> {
        if code.trim().is_empty() {
            return Err(Error::NoCodeProvided);
        }
        let mut ordered = cases.to_vec();
        ordered.sort_by_key(|c| c.order_index);

        Ok(stream::iter(ordered.into_iter().enumerate()).then(move |(index, case)| async move {
            self.run_case(index, &case, code, language).await
        }))
    }

    pub async fn grade(&self, code: &str, language: &str, cases: &[TestCase]) -> Result<GradingResult> {
        self.grade_with(code, language, cases, |_| {}).await
    }

    /// Like [`grade`](Self::grade), calling `on_outcome` as each case finishes.
    pub async fn grade_with<F>(
        &self,
        code: &str,
        language: &str,
        cases: &[TestCase],
        mut on_outcome: F,
    ) -> Result<GradingResult>
    where
        F: FnMut(&TestCaseOutcome),
    {
        let mut outcomes = Vec::with_capacity(cases.len());
        let mut stream = std::pin::pin!(self.outcomes(code, language, cases)?);
        while let Some(outcome) = stream.next().await {
            on_outcome(&outcome);
            outcomes.push(outcome);
        }
        let result = GradingResult::from_outcomes(outcomes);
        tracing::info!(
            language,
            cases = result.outcomes.len(),
            earned = result.total_marks_earned,
            possible = result.total_marks_possible,
            all_passed = result.all_passed,
            "grading finished"
        );
        Ok(result)
    }

    async fn run_case(&self, index: usize, case: &TestCase, code: &str, language: &str) -> TestCaseOutcome {
        let started = Instant::now();
        match self.execute(code, language, &case.input).await {
            Ok(job) => classify(index, case, &job),
            Err(err) => {
                tracing::warn!(index, error = %err, "test case execution failed");
                failed(index, case, status_for(&err), err.to_string(), started.elapsed())
            }
        }
    }

    async fn execute(&self, code: &str, language: &str, stdin: &str) -> std::result::Result<GradingJob, JudgeError> {
        let started = Instant::now();
        let token = self.client.submit(code, language, stdin).await?;
        let response = poll_until_terminal(self.client.as_ref(), &token, self.poll).await?;
        Ok(GradingJob {
            status: response.judge_status(),
            token,
            code: code.to_string(),
            language: language.to_string(),
            stdout: response.stdout,
            stderr: response.stderr,
            compile_output: response.compile_output,
            message: response.message,
            elapsed: started.elapsed(),
        })
    }

    /// Grade a multiple-choice answer. `selected` is the chosen option index.
    pub fn grade_mcq(question: &MultipleChoiceQuestion, selected: Option<i32>) -> McqOutcome {
        let option = |idx: i32| {
            usize::try_from(idx)
                .ok()
                .and_then(|i| question.options.get(i))
                .cloned()
        };
        let candidate_answer = selected.and_then(option);
        let is_correct = selected == Some(question.correct_answer) && candidate_answer.is_some();

        McqOutcome {
            question_id: question.id,
            candidate_answer,
            correct_answer: option(question.correct_answer),
            points_earned: if is_correct { question.points.max(0) } else { 0 },
            max_points: question.points.max(0),
            is_correct,
        }
    }
}

fn status_for(err: &JudgeError) -> JudgeStatus {
    match err {
        JudgeError::PollTimeout { .. } => JudgeStatus::TimeLimitExceeded,
        _ => JudgeStatus::InternalError,
    }
}

fn classify(index: usize, case: &TestCase, job: &GradingJob) -> TestCaseOutcome {
    match job.status {
        JudgeStatus::Accepted => {
            let stdout = job.stdout.as_deref().unwrap_or_default();
            let passed = outputs_match(stdout, &case.expected_output);
            TestCaseOutcome {
                index,
                order_index: case.order_index,
                passed,
                status: job.status,
                output: normalize_for_display(stdout),
                marks_earned: if passed { case.weight() } else { 0 },
                marks_possible: case.weight(),
                hidden: case.hidden,
                elapsed: job.elapsed,
            }
        }
        JudgeStatus::WrongAnswer => failed(
            index,
            case,
            job.status,
            job.stdout.clone().unwrap_or_default(),
            job.elapsed,
        ),
        JudgeStatus::TimeLimitExceeded => failed(
            index,
            case,
            job.status,
            non_empty(&job.message).unwrap_or("Time limit exceeded").to_string(),
            job.elapsed,
        ),
        status if status.is_error() => {
            let diagnostic = non_empty(&job.compile_output)
                .or_else(|| non_empty(&job.stderr))
                .map(str::to_string)
                .unwrap_or_else(|| format!("Execution failed with status {:?}", job.status));
            failed(index, case, job.status, diagnostic, job.elapsed)
        }
        status => failed(
            index,
            case,
            status,
            format!("Judge returned non-final status {:?}", status),
            job.elapsed,
        ),
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.trim().is_empty())
}

fn failed(
    index: usize,
    case: &TestCase,
    status: JudgeStatus,
    diagnostic: String,
    elapsed: Duration,
) -> TestCaseOutcome {
    TestCaseOutcome {
        index,
        order_index: case.order_index,
        passed: false,
        status,
        output: normalize_for_display(&diagnostic),
        marks_earned: 0,
        marks_possible: case.weight(),
        hidden: case.hidden,
        elapsed,
    }
}
