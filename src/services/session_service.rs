use crate::error::{Error, Result};
use crate::models::grading::GradingResult;
use crate::models::question::McqOutcome;
use crate::models::question_result::QuestionResult;
use crate::models::submission::Submission;
use crate::services::grading_service::GradingService;
use crate::services::integrity_monitor::{
    IntegrityMonitor, MonitorDeps, MonitorHandle, MonitorPolicy, MonitorRuntime, MonitorSnapshot,
    Notice, TerminationReason,
};
use crate::services::recording_service::RecordingSink;
use crate::services::signal_source::{ChannelSignalSource, SignalEvent, SignalKind};
use crate::services::submission_store::SubmissionStore;
use crate::services::violation_ledger::ViolationLedger;
use crate::utils::clock::{Clock, TimerHandle, Timers};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn SubmissionStore>,
    pub grading: GradingService,
    pub recorder: Arc<dyn RecordingSink>,
    pub clock: Arc<dyn Clock>,
    pub policy: MonitorPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub submission: Submission,
    pub monitor: Option<MonitorSnapshot>,
}

struct SessionInner {
    submission: Submission,
    monitor: Option<MonitorHandle>,
    last_monitor: Option<MonitorSnapshot>,
}

/// Owns the lifecycle of one submission: the only component that finalizes it.
pub struct SessionController {
    submission_id: Uuid,
    deps: SessionDeps,
    signals: ChannelSignalSource,
    inner: tokio::sync::Mutex<SessionInner>,
    grading_in_flight: Mutex<HashSet<i32>>,
}

impl SessionController {
    /// Attach a controller to an existing submission. Final submissions get no monitor.
    pub async fn resume(deps: SessionDeps, submission: Submission) -> Arc<Self> {
        let controller = Arc::new(Self {
            submission_id: submission.id,
            deps,
            signals: ChannelSignalSource::new(),
            inner: tokio::sync::Mutex::new(SessionInner {
                submission,
                monitor: None,
                last_monitor: None,
            }),
            grading_in_flight: Mutex::new(HashSet::new()),
        });
        controller.start_monitor().await;
        controller
    }

    async fn start_monitor(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.submission.is_final() || inner.monitor.is_some() {
            return;
        }

        let history = match self.deps.store.violations_for(self.submission_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(submission_id = %self.submission_id, error = %e, "could not load violation history");
                Vec::new()
            }
        };
        let monitor =
            IntegrityMonitor::with_ledger(self.deps.policy, ViolationLedger::from_violations(history));
        let (handle, termination) = MonitorRuntime::spawn(
            self.submission_id,
            monitor,
            &self.signals,
            MonitorDeps {
                store: self.deps.store.clone(),
                recorder: self.deps.recorder.clone(),
                clock: self.deps.clock.clone(),
            },
        );
        inner.monitor = Some(handle);

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let Ok(reason) = termination.await else {
                return;
            };
            if let Some(controller) = weak.upgrade() {
                if let Err(e) = controller.terminate_session(reason).await {
                    tracing::warn!(error = %e, "monitor-initiated termination failed");
                }
            }
        });

        tracing::info!(
            submission_id = %self.submission_id,
            user_id = %inner.submission.user_id,
            "assessment session started"
        );
    }

    pub fn submission_id(&self) -> Uuid {
        self.submission_id
    }

    /// Relay an environmental signal from the candidate's browser.
    pub fn signal(&self, kind: SignalKind, compliant: bool) {
        let delivered = self.signals.publish(SignalEvent {
            kind,
            compliant,
            at: self.deps.clock.now(),
        });
        if delivered == 0 {
            tracing::debug!(submission_id = %self.submission_id, ?kind, "signal ignored; no active monitor");
        }
    }

    pub async fn subscribe_notices(&self) -> Option<broadcast::Receiver<Notice>> {
        let inner = self.inner.lock().await;
        inner.monitor.as_ref().map(|m| m.subscribe_notices())
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            submission: inner.submission.clone(),
            monitor: inner
                .monitor
                .as_ref()
                .map(|m| m.snapshot())
                .or_else(|| inner.last_monitor.clone()),
        }
    }

    pub async fn is_final(&self) -> bool {
        self.inner.lock().await.submission.is_final()
    }

    /// End the session as terminated. Returns `false` if it was already terminated.
    pub async fn terminate_session(&self, reason: TerminationReason) -> Result<bool> {
        let now = self.deps.clock.now();
        let monitor = {
            let mut inner = self.inner.lock().await;
            if inner.submission.terminated {
                return Ok(false);
            }
            if inner.submission.is_final() {
                return Err(Error::SessionCompleted);
            }
            inner.submission.terminated = true;
            inner.submission.completed_at = Some(now);
            Self::detach_monitor(&mut inner)
        };
        self.stop_monitor(monitor).await;

        tracing::warn!(submission_id = %self.submission_id, %reason, "assessment session terminated");
        if let Err(e) = self
            .deps
            .store
            .finalize_submission(self.submission_id, true, now)
            .await
        {
            tracing::error!(submission_id = %self.submission_id, error = %e, "failed to persist termination");
        }
        Ok(true)
    }

    /// Normal completion. A second call is a no-op.
    pub async fn complete_session(&self) -> Result<()> {
        let now = self.deps.clock.now();
        let monitor = {
            let mut inner = self.inner.lock().await;
            if inner.submission.terminated {
                return Err(Error::SessionAlreadyTerminated);
            }
            if inner.submission.is_final() {
                return Ok(());
            }
            inner.submission.completed_at = Some(now);
            Self::detach_monitor(&mut inner)
        };
        self.stop_monitor(monitor).await;
        self.deps
            .store
            .finalize_submission(self.submission_id, false, now)
            .await?;
        tracing::info!(submission_id = %self.submission_id, "assessment session completed");
        Ok(())
    }

    /// Take the monitor out so it can be shut down without holding the session lock.
    fn detach_monitor(inner: &mut SessionInner) -> Option<MonitorHandle> {
        let monitor = inner.monitor.take()?;
        inner.last_monitor = Some(monitor.snapshot());
        Some(monitor)
    }

    async fn stop_monitor(&self, monitor: Option<MonitorHandle>) {
        let Some(monitor) = monitor else {
            return;
        };
        let snapshot = monitor.shutdown().await;
        let mut inner = self.inner.lock().await;
        inner.submission.violation_count = snapshot.total_violations as i32;
        inner.last_monitor = Some(snapshot);
    }

    fn ensure_open(submission: &Submission) -> Result<()> {
        if submission.terminated {
            return Err(Error::SessionAlreadyTerminated);
        }
        if submission.is_final() {
            return Err(Error::SessionCompleted);
        }
        Ok(())
    }

    /// Persist marks for a graded coding question.
    pub async fn record_grading(&self, question_id: i32, result: &GradingResult) -> Result<()> {
        let details = serde_json::to_value(result)?;
        self.save_result(
            question_id,
            result.total_marks_earned,
            result.total_marks_possible,
            result.all_passed,
            details,
        )
        .await
    }

    async fn save_result(
        &self,
        question_id: i32,
        marks_earned: i32,
        marks_possible: i32,
        all_passed: bool,
        details: serde_json::Value,
    ) -> Result<()> {
        // Held across the write so termination cannot interleave with it.
        let inner = self.inner.lock().await;
        Self::ensure_open(&inner.submission)?;
        let record = QuestionResult {
            submission_id: self.submission_id,
            question_id,
            marks_earned,
            marks_possible,
            all_passed,
            details,
            terminated: false,
            recorded_at: self.deps.clock.now(),
        };
        self.deps.store.save_question_result(&record).await
    }

    /// Run the grading pipeline for a coding question and record the marks.
    pub async fn grade_code(&self, question_id: i32, code: &str, language: &str) -> Result<GradingResult> {
        Self::ensure_open(&self.inner.lock().await.submission)?;
        let _guard = GradingGuard::acquire(&self.grading_in_flight, question_id)?;

        let cases = self.deps.store.test_cases_for(question_id).await?;
        let submission_id = self.submission_id;
        let result = self
            .deps
            .grading
            .grade_with(code, language, &cases, |outcome| {
                tracing::debug!(
                    %submission_id,
                    question_id,
                    index = outcome.index,
                    passed = outcome.passed,
                    "test case finished"
                );
            })
            .await?;

        self.record_grading(question_id, &result).await?;
        Ok(result)
    }

    /// Grade and record a multiple-choice answer.
    pub async fn record_mcq(&self, question_id: i32, selected: Option<i32>) -> Result<McqOutcome> {
        Self::ensure_open(&self.inner.lock().await.submission)?;
        let question = self.deps.store.mcq_question(question_id).await?;
        let outcome = GradingService::grade_mcq(&question, selected);
        self.save_result(
            question_id,
            outcome.points_earned,
            outcome.max_points,
            outcome.is_correct,
            serde_json::to_value(&outcome)?,
        )
        .await?;
        Ok(outcome)
    }
}

/// One in-flight grading run per question.
struct GradingGuard<'a> {
    in_flight: &'a Mutex<HashSet<i32>>,
    question_id: i32,
}

impl<'a> GradingGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<i32>>, question_id: i32) -> Result<Self> {
        let inserted = in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(question_id);
        if !inserted {
            return Err(Error::GradingInProgress(question_id));
        }
        Ok(Self {
            in_flight,
            question_id,
        })
    }
}

impl Drop for GradingGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.question_id);
    }
}

/// Live sessions keyed by submission id.
pub struct SessionRegistry {
    deps: SessionDeps,
    sessions: RwLock<HashMap<Uuid, Arc<SessionController>>>,
    reaper: Mutex<TimerHandle>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            sessions: RwLock::new(HashMap::new()),
            reaper: Mutex::new(TimerHandle::default()),
        })
    }

    pub async fn start(&self, assessment_id: Uuid, user_id: Uuid) -> Result<Arc<SessionController>> {
        let now = self.deps.clock.now();
        let submission = self
            .deps
            .store
            .create_or_resume(assessment_id, user_id, now)
            .await?;

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&submission.id) {
            return Ok(existing.clone());
        }
        let controller = SessionController::resume(self.deps.clone(), submission).await;
        sessions.insert(controller.submission_id(), controller.clone());
        Ok(controller)
    }

    pub async fn get(&self, submission_id: Uuid) -> Result<Arc<SessionController>> {
        if let Some(controller) = self.sessions.read().await.get(&submission_id) {
            return Ok(controller.clone());
        }
        // Not live in this process: attach to the stored submission.
        let submission = self.deps.store.find_submission(submission_id).await?;
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&submission_id) {
            return Ok(existing.clone());
        }
        let controller = SessionController::resume(self.deps.clone(), submission).await;
        sessions.insert(submission_id, controller.clone());
        Ok(controller)
    }

    /// Drop finished sessions from memory. Returns how many were removed.
    pub async fn reap_finished(&self) -> usize {
        let mut finished = Vec::new();
        for (id, controller) in self.sessions.read().await.iter() {
            if controller.is_final().await {
                finished.push(*id);
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &finished {
            sessions.remove(id);
        }
        finished.len()
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Periodically reap finished sessions until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(self);
        let handle = Timers::every(every, move || {
            let weak = weak.clone();
            async move {
                if let Some(registry) = weak.upgrade() {
                    let reaped = registry.reap_finished().await;
                    if reaped > 0 {
                        tracing::debug!(reaped, "removed finished sessions");
                    }
                }
            }
        });
        *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_case::TestCase;
    use crate::services::integrity_monitor::MonitorState;
    use crate::services::judge_client::{JudgeError, JudgeResponse, MockExecutionClient, PollPolicy, StatusBody};
    use crate::services::recording_service::NoopRecordingSink;
    use crate::services::submission_store::InMemoryStore;
    use crate::utils::clock::ManualClock;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: ManualClock,
    }

    fn deps_with(client: MockExecutionClient) -> (SessionDeps, Fixture) {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::default();
        let deps = SessionDeps {
            store: store.clone(),
            grading: GradingService::new(
                Arc::new(client),
                PollPolicy {
                    interval: Duration::from_millis(5),
                    max_attempts: 5,
                },
            ),
            recorder: Arc::new(NoopRecordingSink),
            clock: Arc::new(clock.clone()),
            policy: MonitorPolicy::default(),
        };
        (deps, Fixture { store, clock })
    }

    fn echo_judge() -> MockExecutionClient {
        let mut mock = MockExecutionClient::new();
        mock.expect_submit()
            .returning(|_, _, stdin| Ok(stdin.to_string()));
        mock.expect_fetch().returning(|token| {
            Ok(JudgeResponse {
                status: StatusBody {
                    id: 3,
                    description: "Accepted".into(),
                },
                stdout: Some(token.to_string()),
                ..Default::default()
            })
        });
        mock
    }

    async fn open(deps: SessionDeps) -> Arc<SessionController> {
        SessionRegistry::new(deps)
            .start(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap()
    }

    fn requested(reason: &str) -> TerminationReason {
        TerminationReason::Requested {
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (deps, fx) = deps_with(MockExecutionClient::new());
        let session = open(deps).await;

        assert!(session.terminate_session(requested("proctor")).await.unwrap());
        assert!(!session.terminate_session(requested("again")).await.unwrap());
        assert_eq!(fx.store.finalize_writes(), 1);

        let snapshot = session.snapshot().await;
        assert!(snapshot.submission.terminated);
        assert!(snapshot.submission.completed_at.is_some());
        assert_eq!(snapshot.monitor.unwrap().state, MonitorState::Terminated);
    }

    #[tokio::test]
    async fn termination_stands_when_store_is_down() {
        let (deps, fx) = deps_with(MockExecutionClient::new());
        let session = open(deps).await;
        fx.store.set_fail_writes(true);

        assert!(session.terminate_session(requested("proctor")).await.unwrap());
        assert_eq!(fx.store.finalize_writes(), 0);

        let snapshot = session.snapshot().await;
        assert!(snapshot.submission.terminated);
        assert!(snapshot.submission.completed_at.is_some());
        assert_eq!(snapshot.monitor.unwrap().state, MonitorState::Terminated);

        let err = session
            .record_grading(1, &GradingResult::from_outcomes(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyTerminated));
        assert!(!session.terminate_session(requested("again")).await.unwrap());
    }

    #[tokio::test]
    async fn grading_after_termination_is_rejected() {
        let (deps, fx) = deps_with(MockExecutionClient::new());
        let session = open(deps).await;
        session.terminate_session(requested("proctor")).await.unwrap();

        let result = GradingResult::from_outcomes(Vec::new());
        let err = session.record_grading(1, &result).await.unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyTerminated));
        assert!(fx
            .store
            .question_result(session.submission_id(), 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn grade_code_records_marks() {
        let (deps, fx) = deps_with(echo_judge());
        fx.store.insert_test_cases(
            42,
            vec![
                TestCase {
                    input: "1".into(),
                    expected_output: "1".into(),
                    marks: 1,
                    hidden: false,
                    order_index: 0,
                },
                TestCase {
                    input: "2".into(),
                    expected_output: "3".into(),
                    marks: 2,
                    hidden: true,
                    order_index: 1,
                },
            ],
        );
        let session = open(deps).await;

        let result = session.grade_code(42, "print(input())", "python").await.unwrap();
        assert_eq!(result.total_marks_earned, 1);
        let stored = fx
            .store
            .question_result(session.submission_id(), 42)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.marks_earned, 1);
        assert_eq!(stored.marks_possible, 3);
        assert!(!stored.all_passed);
    }

    #[tokio::test]
    async fn empty_code_never_reaches_the_judge() {
        let mut mock = MockExecutionClient::new();
        mock.expect_submit().times(0);
        mock.expect_fetch().times(0);
        let (deps, _fx) = deps_with(mock);
        let session = open(deps).await;

        let err = session.grade_code(1, "", "python").await.unwrap_err();
        assert!(matches!(err, Error::NoCodeProvided));
    }

    #[tokio::test]
    async fn same_question_cannot_be_graded_twice_at_once() {
        let in_flight = Mutex::new(HashSet::new());
        let first = GradingGuard::acquire(&in_flight, 5).unwrap();
        assert!(matches!(
            GradingGuard::acquire(&in_flight, 5),
            Err(Error::GradingInProgress(5))
        ));
        assert!(GradingGuard::acquire(&in_flight, 6).is_ok());
        drop(first);
        assert!(GradingGuard::acquire(&in_flight, 5).is_ok());
    }

    #[tokio::test]
    async fn completion_blocks_further_answers() {
        let (deps, fx) = deps_with(MockExecutionClient::new());
        let session = open(deps).await;
        session.complete_session().await.unwrap();
        session.complete_session().await.unwrap();
        assert_eq!(fx.store.finalize_writes(), 1);

        let err = session
            .record_grading(1, &GradingResult::from_outcomes(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionCompleted));
        assert!(matches!(
            session.terminate_session(requested("late")).await,
            Err(Error::SessionCompleted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_threshold_terminates_session() {
        let (deps, fx) = deps_with(MockExecutionClient::new());
        let session = open(deps).await;
        tokio::task::yield_now().await;

        session.signal(SignalKind::Fullscreen, false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        fx.clock.advance(Duration::from_secs(10));
        session.signal(SignalKind::Fullscreen, true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        session.signal(SignalKind::Fullscreen, false);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = session.snapshot().await;
        assert!(snapshot.submission.terminated);
        let monitor = snapshot.monitor.unwrap();
        assert_eq!(monitor.state, MonitorState::Terminated);
        assert_eq!(monitor.fullscreen_violations, 2);
        assert_eq!(fx.store.finalize_writes(), 1);

        let err = session.grade_code(1, "x", "python").await.unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyTerminated));
    }

    #[tokio::test]
    async fn registry_resumes_the_same_session() {
        let (deps, _fx) = deps_with(MockExecutionClient::new());
        let registry = SessionRegistry::new(deps);
        let (a, u) = (Uuid::new_v4(), Uuid::new_v4());
        let first = registry.start(a, u).await.unwrap();
        let second = registry.start(a, u).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.complete_session().await.unwrap();
        assert_eq!(registry.reap_finished().await, 1);
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn terminated_submission_resumes_without_monitor() {
        let (deps, fx) = deps_with(MockExecutionClient::new());
        let registry = SessionRegistry::new(deps);
        let (a, u) = (Uuid::new_v4(), Uuid::new_v4());
        let session = registry.start(a, u).await.unwrap();
        session.terminate_session(requested("proctor")).await.unwrap();
        registry.reap_finished().await;

        let again = registry.start(a, u).await.unwrap();
        assert_eq!(again.submission_id(), session.submission_id());
        assert!(again.subscribe_notices().await.is_none());
        let err = again.record_mcq(1, Some(0)).await.unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyTerminated));
        assert_eq!(fx.store.finalize_writes(), 1);
    }

    #[tokio::test]
    async fn judge_outage_still_yields_result() {
        let mut mock = MockExecutionClient::new();
        mock.expect_submit()
            .returning(|_, _, _| Err(JudgeError::SubmissionError("judge down".into())));
        let (deps, fx) = deps_with(mock);
        fx.store.insert_test_cases(
            3,
            vec![TestCase {
                input: String::new(),
                expected_output: "1".into(),
                marks: 5,
                hidden: false,
                order_index: 0,
            }],
        );
        let session = open(deps).await;
        let result = session.grade_code(3, "x", "python").await.unwrap();
        assert_eq!(result.total_marks_earned, 0);
        assert_eq!(result.total_marks_possible, 5);
    }
}
