//! Integrity monitoring for an active assessment session.
//!
//! [`IntegrityMonitor`] is a pure state machine: it consumes compliance events and returns
//! the side effects they imply. [`MonitorRuntime`] owns one monitor per session, feeds it
//! from a [`SignalSource`] and carries out the effects (timers, persistence, recording,
//! termination).

use crate::models::violation::{Violation, ViolationType};
use crate::services::recording_service::RecordingSink;
use crate::services::signal_source::{SignalEvent, SignalKind, SignalSource, SignalSubscription};
use crate::services::submission_store::SubmissionStore;
use crate::services::violation_ledger::ViolationLedger;
use crate::utils::clock::{Clock, TimerHandle, Timers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const MAX_WARNINGS: u32 = 2;
pub const MAX_SECONDS_OUT_OF_VIEW: u64 = 30;

const RECENT_NOTICES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPolicy {
    /// A source's violation count reaching this value terminates the session.
    pub max_warnings: u32,
    pub grace_period: Duration,
    /// Extra time to wait for companion events before reacting to a signal batch.
    pub coalesce_window: Duration,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            max_warnings: MAX_WARNINGS,
            grace_period: Duration::from_secs(MAX_SECONDS_OUT_OF_VIEW),
            coalesce_window: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Compliant,
    Warned,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Lost(ViolationType),
    Restored(ViolationType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    MaxWarnings { violation_type: ViolationType },
    GracePeriodElapsed,
    Requested { reason: String },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxWarnings { violation_type } => {
                write!(f, "violation limit reached ({})", violation_type)
            }
            Self::GracePeriodElapsed => f.write_str("grace period elapsed"),
            Self::Requested { reason } => f.write_str(reason),
        }
    }
}

/// Candidate-facing messages produced by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    FullscreenRequested,
    Warning {
        violation_type: ViolationType,
        count: u32,
        max_warnings: u32,
        seconds_to_return: u64,
    },
    Returned {
        elapsed_ms: i64,
    },
    Terminated {
        reason: TerminationReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEffect {
    RequestFullscreen,
    AppendViolation { index: usize, violation: Violation },
    CloseViolation { index: usize, duration_ms: i64 },
    StartGraceTimer { epoch: u64, after: Duration },
    CancelGraceTimer,
    PersistViolationState { violation_count: i32, terminated: bool },
    MarkResultTerminated,
    NotifyRecorder { violation_type: ViolationType, at: DateTime<Utc> },
    Notice(Notice),
    Terminate(TerminationReason),
}

#[derive(Debug, Clone)]
pub struct IntegrityMonitor {
    policy: MonitorPolicy,
    state: MonitorState,
    ledger: ViolationLedger,
    fullscreen: bool,
    visible: bool,
    grace_epoch: u64,
}

impl IntegrityMonitor {
    pub fn new(policy: MonitorPolicy) -> Self {
        Self::with_ledger(policy, ViolationLedger::new())
    }

    /// Resume with violations already on record; their counts still apply to the threshold.
    pub fn with_ledger(policy: MonitorPolicy, ledger: ViolationLedger) -> Self {
        Self {
            policy,
            state: MonitorState::Compliant,
            ledger,
            fullscreen: true,
            visible: true,
            grace_epoch: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn ledger(&self) -> &ViolationLedger {
        &self.ledger
    }

    pub fn policy(&self) -> MonitorPolicy {
        self.policy
    }

    pub fn is_compliant(&self) -> bool {
        self.fullscreen && self.visible
    }

    /// Enter assessment mode in `COMPLIANT` and ask the browser for fullscreen.
    ///
    /// A violation left open by a previous run of the session is closed at `now`.
    pub fn enter_assessment(&mut self, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        if self.state == MonitorState::Terminated {
            return Vec::new();
        }
        self.state = MonitorState::Compliant;
        self.fullscreen = true;
        self.visible = true;
        let mut effects = Vec::with_capacity(3);
        if let Some((index, duration_ms)) = self.ledger.close_outstanding(now) {
            effects.push(MonitorEffect::CloseViolation { index, duration_ms });
        }
        effects.push(MonitorEffect::RequestFullscreen);
        effects.push(MonitorEffect::Notice(Notice::FullscreenRequested));
        effects
    }

    pub fn handle(&mut self, event: MonitorEvent, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        if self.state == MonitorState::Terminated {
            return Vec::new();
        }
        match event {
            MonitorEvent::Lost(violation_type) => {
                self.set_flag(violation_type, false);
                match self.state {
                    MonitorState::Compliant => self.enter_warned(violation_type, now),
                    // Same episode: the other source joined an ongoing departure.
                    _ => Vec::new(),
                }
            }
            MonitorEvent::Restored(violation_type) => {
                self.set_flag(violation_type, true);
                if self.state == MonitorState::Warned && self.is_compliant() {
                    self.return_to_compliance(now)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// The grace timer for `epoch` fired. Stale epochs and non-`WARNED` states are ignored.
    pub fn grace_expired(&mut self, epoch: u64, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        if self.state != MonitorState::Warned || epoch != self.grace_epoch {
            return Vec::new();
        }
        self.terminate(TerminationReason::GracePeriodElapsed, now)
    }

    /// Stop monitoring without signalling termination, e.g. on normal completion or when the
    /// session controller has already terminated the session.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        let mut effects = Vec::new();
        if self.state == MonitorState::Warned {
            effects.push(MonitorEffect::CancelGraceTimer);
        }
        if let Some((index, duration_ms)) = self.ledger.close_outstanding(now) {
            effects.push(MonitorEffect::CloseViolation { index, duration_ms });
        }
        self.state = MonitorState::Terminated;
        effects
    }

    fn set_flag(&mut self, violation_type: ViolationType, value: bool) {
        match violation_type {
            ViolationType::FullscreenExit => self.fullscreen = value,
            ViolationType::VisibilityExit => self.visible = value,
        }
    }

    fn violation_count(&self) -> i32 {
        self.ledger.total_count() as i32
    }

    fn enter_warned(&mut self, violation_type: ViolationType, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        let mut effects = Vec::new();
        if let Some((index, duration_ms)) = self.ledger.close_outstanding(now) {
            effects.push(MonitorEffect::CloseViolation { index, duration_ms });
        }
        let index = self.ledger.record(violation_type, now);
        let count = self.ledger.count_for(violation_type) as u32;
        effects.push(MonitorEffect::AppendViolation {
            index,
            violation: self.ledger.violations()[index].clone(),
        });
        effects.push(MonitorEffect::NotifyRecorder {
            violation_type,
            at: now,
        });

        if count >= self.policy.max_warnings {
            effects.extend(self.terminate(TerminationReason::MaxWarnings { violation_type }, now));
            return effects;
        }

        self.state = MonitorState::Warned;
        self.grace_epoch += 1;
        effects.push(MonitorEffect::PersistViolationState {
            violation_count: self.violation_count(),
            terminated: false,
        });
        effects.push(MonitorEffect::StartGraceTimer {
            epoch: self.grace_epoch,
            after: self.policy.grace_period,
        });
        effects.push(MonitorEffect::Notice(Notice::Warning {
            violation_type,
            count,
            max_warnings: self.policy.max_warnings,
            seconds_to_return: self.policy.grace_period.as_secs(),
        }));
        effects
    }

    fn return_to_compliance(&mut self, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        self.state = MonitorState::Compliant;
        let mut effects = vec![MonitorEffect::CancelGraceTimer];
        let elapsed_ms = match self.ledger.close_outstanding(now) {
            Some((index, duration_ms)) => {
                effects.push(MonitorEffect::CloseViolation { index, duration_ms });
                duration_ms
            }
            None => 0,
        };
        effects.push(MonitorEffect::Notice(Notice::Returned { elapsed_ms }));
        effects
    }

    fn terminate(&mut self, reason: TerminationReason, now: DateTime<Utc>) -> Vec<MonitorEffect> {
        let mut effects = self.stop(now);
        effects.push(MonitorEffect::PersistViolationState {
            violation_count: self.violation_count(),
            terminated: true,
        });
        effects.push(MonitorEffect::MarkResultTerminated);
        effects.push(MonitorEffect::Notice(Notice::Terminated {
            reason: reason.clone(),
        }));
        effects.push(MonitorEffect::Terminate(reason));
        effects
    }
}

/// Collapse a batch of signals that arrived together into net compliance changes.
///
/// For each source only its last reported value counts, and only if it differs from the
/// current flag. Changes keep the order in which each source first appeared in the batch,
/// so a fullscreen loss followed by a visibility loss still attributes the violation to
/// fullscreen. A loss and restore of the same source within one batch cancel out.
pub fn coalesce(batch: &[SignalEvent], fullscreen: bool, visible: bool) -> Vec<MonitorEvent> {
    let mut order: Vec<SignalKind> = Vec::with_capacity(2);
    for event in batch {
        if !order.contains(&event.kind) {
            order.push(event.kind);
        }
    }

    order
        .into_iter()
        .filter_map(|kind| {
            let last = batch.iter().rev().find(|e| e.kind == kind)?;
            let current = match kind {
                SignalKind::Fullscreen => fullscreen,
                SignalKind::Visibility => visible,
            };
            if last.compliant == current {
                return None;
            }
            let violation_type = kind.violation_type();
            Some(if last.compliant {
                MonitorEvent::Restored(violation_type)
            } else {
                MonitorEvent::Lost(violation_type)
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub state: MonitorState,
    pub fullscreen: bool,
    pub visible: bool,
    pub fullscreen_violations: usize,
    pub visibility_violations: usize,
    pub total_violations: usize,
    pub violations: Vec<Violation>,
    pub notices: Vec<Notice>,
}

impl MonitorSnapshot {
    fn of(monitor: &IntegrityMonitor, notices: Vec<Notice>) -> Self {
        let ledger = monitor.ledger();
        Self {
            state: monitor.state(),
            fullscreen: monitor.fullscreen,
            visible: monitor.visible,
            fullscreen_violations: ledger.count_for(ViolationType::FullscreenExit),
            visibility_violations: ledger.count_for(ViolationType::VisibilityExit),
            total_violations: ledger.total_count(),
            violations: ledger.violations().to_vec(),
            notices,
        }
    }
}

enum PersistOp {
    Append { index: usize, violation: Violation },
    Close { index: usize, duration_ms: i64 },
    State { violation_count: i32, terminated: bool },
    MarkResultTerminated,
    Recorder { violation_type: ViolationType, at: DateTime<Utc> },
}

enum Command {
    Stop(oneshot::Sender<MonitorSnapshot>),
}

pub struct MonitorDeps {
    pub store: Arc<dyn SubmissionStore>,
    pub recorder: Arc<dyn RecordingSink>,
    pub clock: Arc<dyn Clock>,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<MonitorSnapshot>,
    notices: broadcast::Sender<Notice>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn snapshot(&self) -> MonitorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> MonitorState {
        self.snapshot.borrow().state
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Stop the monitor: cancel timers, unsubscribe from signals, release recording,
    /// and flush pending writes. Returns the final snapshot.
    pub async fn shutdown(mut self) -> MonitorSnapshot {
        let (tx, rx) = oneshot::channel();
        let fallback = self.snapshot();
        if self.commands.send(Command::Stop(tx)).is_err() {
            return fallback;
        }
        let snapshot = rx.await.unwrap_or(fallback);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "integrity monitor task ended abnormally");
            }
        }
        snapshot
    }
}

pub struct MonitorRuntime {
    submission_id: Uuid,
    monitor: IntegrityMonitor,
    deps: MonitorDeps,
    subscription: Option<SignalSubscription>,
    grace_timer: TimerHandle,
    grace_tx: mpsc::UnboundedSender<u64>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
    termination: Option<oneshot::Sender<TerminationReason>>,
    snapshot_tx: watch::Sender<MonitorSnapshot>,
    notices_tx: broadcast::Sender<Notice>,
    recent_notices: Vec<Notice>,
}

impl MonitorRuntime {
    /// Start monitoring `submission_id`. The returned receiver resolves at most once, when
    /// the monitor decides the session must end.
    pub fn spawn(
        submission_id: Uuid,
        monitor: IntegrityMonitor,
        source: &dyn SignalSource,
        deps: MonitorDeps,
    ) -> (MonitorHandle, oneshot::Receiver<TerminationReason>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (termination_tx, termination_rx) = oneshot::channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MonitorSnapshot::of(&monitor, Vec::new()));
        let (notices_tx, _) = broadcast::channel(32);

        let writer = tokio::spawn(persist_worker(
            submission_id,
            deps.store.clone(),
            deps.recorder.clone(),
            persist_rx,
        ));

        let mut runtime = MonitorRuntime {
            submission_id,
            monitor,
            deps,
            subscription: Some(source.subscribe()),
            grace_timer: TimerHandle::default(),
            grace_tx,
            persist_tx: Some(persist_tx),
            termination: Some(termination_tx),
            snapshot_tx,
            notices_tx: notices_tx.clone(),
            recent_notices: Vec::new(),
        };

        let task = tokio::spawn(async move {
            let effects = runtime.monitor.enter_assessment(runtime.deps.clock.now());
            runtime.apply(effects);
            runtime.run(command_rx, grace_rx).await;
            runtime.teardown(writer).await;
        });

        let handle = MonitorHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            notices: notices_tx,
            task: Some(task),
        };
        (handle, termination_rx)
    }

    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut grace: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Stop(reply)) => {
                            self.stop();
                            let _ = reply.send(self.snapshot_tx.borrow().clone());
                        }
                        None => self.stop(),
                    }
                    return;
                }
                Some(epoch) = grace.recv() => {
                    let now = self.deps.clock.now();
                    let effects = self.monitor.grace_expired(epoch, now);
                    self.apply(effects);
                }
                signal = next_signal(&mut self.subscription) => {
                    let Some(first) = signal else {
                        tracing::warn!(submission_id = %self.submission_id, "signal source closed");
                        self.subscription = None;
                        continue;
                    };
                    let batch = self.collect_batch(first).await;
                    self.process_batch(&batch);
                }
            }
        }
    }

    /// Gather events that arrive in the same tick as `first` (or within the coalesce window).
    async fn collect_batch(&mut self, first: SignalEvent) -> Vec<SignalEvent> {
        let window = self.monitor.policy().coalesce_window;
        if window.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(window).await;
        }
        let mut batch = vec![first];
        if let Some(subscription) = self.subscription.as_mut() {
            while let Some(event) = subscription.try_recv() {
                batch.push(event);
            }
        }
        batch
    }

    fn process_batch(&mut self, batch: &[SignalEvent]) {
        let events = coalesce(batch, self.monitor.fullscreen, self.monitor.visible);
        if events.len() < batch.len() {
            tracing::debug!(
                submission_id = %self.submission_id,
                received = batch.len(),
                effective = events.len(),
                "coalesced compliance signals"
            );
        }
        for event in events {
            let at = batch
                .iter()
                .rev()
                .find(|e| e.kind.violation_type() == event_type(event))
                .map(|e| e.at)
                .unwrap_or_else(|| self.deps.clock.now());
            let effects = self.monitor.handle(event, at);
            self.apply(effects);
        }
    }

    fn stop(&mut self) {
        let now = self.deps.clock.now();
        let effects = self.monitor.stop(now);
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<MonitorEffect>) {
        for effect in effects {
            match effect {
                MonitorEffect::RequestFullscreen => {
                    tracing::debug!(submission_id = %self.submission_id, "requesting fullscreen");
                }
                MonitorEffect::AppendViolation { index, violation } => {
                    tracing::info!(
                        submission_id = %self.submission_id,
                        violation_type = %violation.violation_type,
                        index,
                        "integrity violation recorded"
                    );
                    self.persist(PersistOp::Append { index, violation });
                }
                MonitorEffect::CloseViolation { index, duration_ms } => {
                    self.persist(PersistOp::Close { index, duration_ms });
                }
                MonitorEffect::StartGraceTimer { epoch, after } => {
                    let tx = self.grace_tx.clone();
                    self.grace_timer = Timers::schedule(after, async move {
                        let _ = tx.send(epoch);
                    });
                }
                MonitorEffect::CancelGraceTimer => self.grace_timer.cancel(),
                MonitorEffect::PersistViolationState {
                    violation_count,
                    terminated,
                } => self.persist(PersistOp::State {
                    violation_count,
                    terminated,
                }),
                MonitorEffect::MarkResultTerminated => self.persist(PersistOp::MarkResultTerminated),
                MonitorEffect::NotifyRecorder { violation_type, at } => {
                    self.persist(PersistOp::Recorder { violation_type, at })
                }
                MonitorEffect::Notice(notice) => {
                    let _ = self.notices_tx.send(notice.clone());
                    self.recent_notices.push(notice);
                    if self.recent_notices.len() > RECENT_NOTICES {
                        self.recent_notices.remove(0);
                    }
                }
                MonitorEffect::Terminate(reason) => {
                    tracing::warn!(
                        submission_id = %self.submission_id,
                        reason = %reason,
                        "integrity monitor terminating session"
                    );
                    if let Some(tx) = self.termination.take() {
                        let _ = tx.send(reason);
                    }
                }
            }
        }
        self.snapshot_tx
            .send_replace(MonitorSnapshot::of(&self.monitor, self.recent_notices.clone()));
    }

    fn persist(&self, op: PersistOp) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(op).is_err() {
                tracing::warn!(submission_id = %self.submission_id, "persistence worker gone; dropping write");
            }
        }
    }

    async fn teardown(mut self, writer: JoinHandle<()>) {
        self.grace_timer.cancel();
        self.subscription = None;
        self.persist_tx = None;
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "violation writer ended abnormally");
        }
        if let Err(e) = self.deps.recorder.release(self.submission_id).await {
            tracing::warn!(submission_id = %self.submission_id, error = %e, "failed to release recording");
        }
        tracing::debug!(submission_id = %self.submission_id, "integrity monitor stopped");
    }
}

async fn next_signal(subscription: &mut Option<SignalSubscription>) -> Option<SignalEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

fn event_type(event: MonitorEvent) -> ViolationType {
    match event {
        MonitorEvent::Lost(t) | MonitorEvent::Restored(t) => t,
    }
}

/// Applies writes in order. Failures are logged and skipped; they never reach the monitor.
async fn persist_worker(
    submission_id: Uuid,
    store: Arc<dyn SubmissionStore>,
    recorder: Arc<dyn RecordingSink>,
    mut ops: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = ops.recv().await {
        let (what, result) = match op {
            PersistOp::Append { index, violation } => (
                "append violation",
                store.append_violation(submission_id, index, &violation).await,
            ),
            PersistOp::Close { index, duration_ms } => (
                "close violation",
                store.close_violation(submission_id, index, duration_ms).await,
            ),
            PersistOp::State {
                violation_count,
                terminated,
            } => (
                "update violation count",
                store
                    .update_violation_state(submission_id, violation_count, terminated)
                    .await,
            ),
            PersistOp::MarkResultTerminated => (
                "mark result terminated",
                store.mark_result_terminated(submission_id).await,
            ),
            PersistOp::Recorder { violation_type, at } => (
                "notify recorder",
                recorder.notify_violation(submission_id, violation_type, at).await,
            ),
        };
        if let Err(e) = result {
            tracing::warn!(submission_id = %submission_id, error = %e, "failed to {}", what);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::recording_service::NoopRecordingSink;
    use crate::services::signal_source::ChannelSignalSource;
    use crate::services::submission_store::InMemoryStore;
    use crate::utils::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    const FS: ViolationType = ViolationType::FullscreenExit;
    const VIS: ViolationType = ViolationType::VisibilityExit;

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    fn started() -> (IntegrityMonitor, DateTime<Utc>) {
        let mut monitor = IntegrityMonitor::new(MonitorPolicy::default());
        let t0 = Utc::now();
        monitor.enter_assessment(t0);
        (monitor, t0)
    }

    fn has_terminate(effects: &[MonitorEffect]) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, MonitorEffect::Terminate(_)))
    }

    #[test]
    fn entering_assessment_requests_fullscreen() {
        let mut monitor = IntegrityMonitor::new(MonitorPolicy::default());
        let effects = monitor.enter_assessment(Utc::now());
        assert_eq!(monitor.state(), MonitorState::Compliant);
        assert!(effects.contains(&MonitorEffect::RequestFullscreen));
    }

    #[test]
    fn first_loss_warns_and_starts_grace_timer() {
        let (mut monitor, t0) = started();
        let effects = monitor.handle(MonitorEvent::Lost(FS), t0);

        assert_eq!(monitor.state(), MonitorState::Warned);
        assert!(effects.contains(&MonitorEffect::StartGraceTimer {
            epoch: 1,
            after: Duration::from_secs(30)
        }));
        assert!(effects.contains(&MonitorEffect::PersistViolationState {
            violation_count: 1,
            terminated: false
        }));
        assert!(!has_terminate(&effects));
        assert_eq!(monitor.ledger().count_for(FS), 1);
    }

    #[test]
    fn restore_before_grace_returns_to_compliant() {
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(VIS), t0);
        let effects = monitor.handle(MonitorEvent::Restored(VIS), t0 + secs(12));

        assert_eq!(monitor.state(), MonitorState::Compliant);
        assert_eq!(effects[0], MonitorEffect::CancelGraceTimer);
        assert!(effects.contains(&MonitorEffect::CloseViolation {
            index: 0,
            duration_ms: 12_000
        }));
        assert!(effects.contains(&MonitorEffect::Notice(Notice::Returned {
            elapsed_ms: 12_000
        })));

        // The cancelled timer firing late must not terminate.
        assert!(monitor.grace_expired(1, t0 + secs(30)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Compliant);
    }

    #[test]
    fn grace_expiry_terminates_and_closes_violation() {
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(FS), t0);
        let effects = monitor.grace_expired(1, t0 + secs(30));

        assert_eq!(monitor.state(), MonitorState::Terminated);
        assert!(effects.contains(&MonitorEffect::CloseViolation {
            index: 0,
            duration_ms: 30_000
        }));
        assert!(effects.contains(&MonitorEffect::MarkResultTerminated));
        assert!(effects.contains(&MonitorEffect::Terminate(
            TerminationReason::GracePeriodElapsed
        )));
    }

    #[test]
    fn stale_grace_epoch_is_ignored() {
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(VIS), t0);
        monitor.handle(MonitorEvent::Restored(VIS), t0 + secs(1));
        monitor.handle(MonitorEvent::Lost(FS), t0 + secs(2));
        // epoch 1 belonged to the first episode
        assert!(monitor.grace_expired(1, t0 + secs(31)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Warned);
        assert!(has_terminate(&monitor.grace_expired(2, t0 + secs(32))));
    }

    #[test]
    fn second_loss_of_same_source_terminates_synchronously() {
        // fullscreen lost, back after 10s, lost again -> limit reached on the loss itself
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(FS), t0);
        monitor.handle(MonitorEvent::Restored(FS), t0 + secs(10));
        assert_eq!(monitor.state(), MonitorState::Compliant);

        let effects = monitor.handle(MonitorEvent::Lost(FS), t0 + secs(20));
        assert_eq!(monitor.state(), MonitorState::Terminated);
        assert!(effects.contains(&MonitorEffect::Terminate(TerminationReason::MaxWarnings {
            violation_type: FS
        })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, MonitorEffect::StartGraceTimer { .. })));
        assert!(effects.contains(&MonitorEffect::PersistViolationState {
            violation_count: 2,
            terminated: true
        }));
        // duration = time to termination, which is immediate
        assert_eq!(monitor.ledger().violations()[1].duration_ms, Some(0));
    }

    #[test]
    fn counters_are_independent_per_source() {
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(FS), t0);
        monitor.handle(MonitorEvent::Restored(FS), t0 + secs(1));
        monitor.handle(MonitorEvent::Lost(VIS), t0 + secs(2));
        assert_eq!(monitor.state(), MonitorState::Warned);
        monitor.handle(MonitorEvent::Restored(VIS), t0 + secs(3));
        assert_eq!(monitor.state(), MonitorState::Compliant);
        assert_eq!(monitor.ledger().total_count(), 2);
    }

    #[test]
    fn simultaneous_loss_counts_once() {
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(FS), t0);
        let effects = monitor.handle(MonitorEvent::Lost(VIS), t0);
        assert!(effects.is_empty());
        assert_eq!(monitor.ledger().total_count(), 1);

        // both must be restored to leave WARNED
        assert!(monitor.handle(MonitorEvent::Restored(FS), t0 + secs(2)).is_empty());
        assert_eq!(monitor.state(), MonitorState::Warned);
        monitor.handle(MonitorEvent::Restored(VIS), t0 + secs(3));
        assert_eq!(monitor.state(), MonitorState::Compliant);
        assert_eq!(monitor.ledger().violations()[0].duration_ms, Some(3_000));
    }

    #[test]
    fn terminated_is_absorbing() {
        let (mut monitor, t0) = started();
        monitor.handle(MonitorEvent::Lost(FS), t0);
        monitor.grace_expired(1, t0 + secs(30));

        assert!(monitor.handle(MonitorEvent::Lost(VIS), t0 + secs(31)).is_empty());
        assert!(monitor.handle(MonitorEvent::Restored(FS), t0 + secs(32)).is_empty());
        assert!(monitor.enter_assessment(t0 + secs(33)).is_empty());
        assert_eq!(monitor.ledger().total_count(), 1);
        assert_eq!(monitor.state(), MonitorState::Terminated);
    }

    #[test]
    fn resumed_ledger_counts_toward_threshold() {
        let t0 = Utc::now();
        let mut ledger = ViolationLedger::new();
        ledger.record(VIS, t0);
        ledger.close_outstanding(t0 + secs(4));
        let mut monitor = IntegrityMonitor::with_ledger(MonitorPolicy::default(), ledger);
        monitor.enter_assessment(t0 + secs(30));

        let effects = monitor.handle(MonitorEvent::Lost(VIS), t0 + secs(60));
        assert!(has_terminate(&effects));
    }

    #[test]
    fn violation_left_open_by_restart_is_closed_on_entry() {
        let t0 = Utc::now();
        let history = vec![Violation {
            violation_type: FS,
            timestamp: t0,
            duration_ms: None,
        }];
        let mut monitor = IntegrityMonitor::with_ledger(
            MonitorPolicy::default(),
            ViolationLedger::from_violations(history),
        );

        let effects = monitor.enter_assessment(t0 + secs(90));
        assert_eq!(monitor.state(), MonitorState::Compliant);
        assert!(effects.contains(&MonitorEffect::CloseViolation {
            index: 0,
            duration_ms: 90_000
        }));
        assert_eq!(monitor.ledger().outstanding(), None);

        // A later loss opens a fresh violation and leaves row 0 as persisted.
        let effects = monitor.handle(MonitorEvent::Lost(VIS), t0 + secs(3600));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, MonitorEffect::CloseViolation { index: 0, .. })));
        assert_eq!(monitor.ledger().violations()[0].duration_ms, Some(90_000));
        assert_eq!(monitor.state(), MonitorState::Warned);
    }

    #[test]
    fn warning_over_open_violation_persists_its_close() {
        let t0 = Utc::now();
        let history = vec![Violation {
            violation_type: FS,
            timestamp: t0,
            duration_ms: None,
        }];
        // Never entered: the open row is still outstanding when the loss arrives.
        let mut monitor = IntegrityMonitor::with_ledger(
            MonitorPolicy::default(),
            ViolationLedger::from_violations(history),
        );

        let effects = monitor.handle(MonitorEvent::Lost(VIS), t0 + secs(3600));
        assert_eq!(
            effects[0],
            MonitorEffect::CloseViolation {
                index: 0,
                duration_ms: 3_600_000
            }
        );
        assert!(matches!(
            effects[1],
            MonitorEffect::AppendViolation { index: 1, .. }
        ));
    }

    fn signal(kind: SignalKind, compliant: bool) -> SignalEvent {
        SignalEvent {
            kind,
            compliant,
            at: Utc::now(),
        }
    }

    #[test]
    fn coalesce_keeps_first_arrival_order() {
        let batch = [
            signal(SignalKind::Visibility, false),
            signal(SignalKind::Fullscreen, false),
        ];
        assert_eq!(
            coalesce(&batch, true, true),
            vec![MonitorEvent::Lost(VIS), MonitorEvent::Lost(FS)]
        );
    }

    #[test]
    fn coalesce_drops_same_tick_blips_and_duplicates() {
        let batch = [
            signal(SignalKind::Fullscreen, false),
            signal(SignalKind::Fullscreen, true),
            signal(SignalKind::Visibility, true),
        ];
        assert!(coalesce(&batch, true, true).is_empty());
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        source: ChannelSignalSource,
        clock: ManualClock,
        submission_id: Uuid,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let submission = store
            .create_or_resume(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        Harness {
            store,
            source: ChannelSignalSource::new(),
            clock: ManualClock::default(),
            submission_id: submission.id,
        }
    }

    impl Harness {
        fn spawn(&self) -> (MonitorHandle, oneshot::Receiver<TerminationReason>) {
            MonitorRuntime::spawn(
                self.submission_id,
                IntegrityMonitor::new(MonitorPolicy::default()),
                &self.source,
                MonitorDeps {
                    store: self.store.clone(),
                    recorder: Arc::new(NoopRecordingSink),
                    clock: Arc::new(self.clock.clone()),
                },
            )
        }

        fn send(&self, kind: SignalKind, compliant: bool) {
            self.source.publish(SignalEvent {
                kind,
                compliant,
                at: self.clock.now(),
            });
        }

        fn advance(&self, secs: u64) -> impl std::future::Future<Output = ()> {
            self.clock.advance(Duration::from_secs(secs));
            tokio::time::sleep(Duration::from_secs(secs))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_terminates_when_grace_period_elapses() {
        let h = harness().await;
        let (handle, mut terminated) = h.spawn();
        tokio::task::yield_now().await;

        h.send(SignalKind::Fullscreen, false);
        h.advance(29).await;
        assert_eq!(handle.state(), MonitorState::Warned);
        assert!(terminated.try_recv().is_err());

        h.advance(2).await;
        assert_eq!(terminated.await.unwrap(), TerminationReason::GracePeriodElapsed);
        assert_eq!(handle.state(), MonitorState::Terminated);

        let snapshot = handle.shutdown().await;
        assert_eq!(snapshot.total_violations, 1);
        let submission = h.store.find_submission(h.submission_id).await.unwrap();
        assert!(submission.terminated);
        assert_eq!(submission.violation_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_restore_cancels_grace_timer() {
        let h = harness().await;
        let (handle, mut terminated) = h.spawn();
        tokio::task::yield_now().await;

        h.send(SignalKind::Visibility, false);
        h.advance(10).await;
        h.send(SignalKind::Visibility, true);
        h.advance(1).await;
        assert_eq!(handle.state(), MonitorState::Compliant);

        h.advance(120).await;
        assert!(terminated.try_recv().is_err());
        assert_eq!(handle.state(), MonitorState::Compliant);

        let snapshot = handle.shutdown().await;
        assert!(snapshot
            .notices
            .iter()
            .any(|n| matches!(n, Notice::Returned { elapsed_ms } if *elapsed_ms == 10_000)));
        let rows = h.store.violations_for(h.submission_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].duration_ms, Some(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_coalesces_alt_tab_pair() {
        let h = harness().await;
        let (handle, _terminated) = h.spawn();
        tokio::task::yield_now().await;

        h.send(SignalKind::Fullscreen, false);
        h.send(SignalKind::Visibility, false);
        h.advance(1).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, MonitorState::Warned);
        assert_eq!(snapshot.total_violations, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_failures_do_not_block_termination() {
        let h = harness().await;
        h.store.set_fail_writes(true);
        let (handle, terminated) = h.spawn();
        tokio::task::yield_now().await;

        h.send(SignalKind::Fullscreen, false);
        h.advance(1).await;
        h.send(SignalKind::Fullscreen, true);
        h.advance(1).await;
        h.send(SignalKind::Fullscreen, false);
        h.advance(1).await;

        assert!(matches!(
            terminated.await.unwrap(),
            TerminationReason::MaxWarnings { .. }
        ));
        assert_eq!(handle.shutdown().await.state, MonitorState::Terminated);
        assert!(h.store.violations_for(h.submission_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_unsubscribes_from_source() {
        let h = harness().await;
        let (handle, _terminated) = h.spawn();
        assert_eq!(h.source.listener_count(), 1);
        handle.shutdown().await;
        assert_eq!(h.source.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_of_quiet_monitor_reports_terminated() {
        let h = harness().await;
        let (handle, _terminated) = h.spawn();
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), MonitorState::Compliant);

        let snapshot = handle.shutdown().await;
        assert_eq!(snapshot.state, MonitorState::Terminated);
        assert_eq!(snapshot.total_violations, 0);
    }
}
