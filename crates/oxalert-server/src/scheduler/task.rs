//! Per-rule evaluation task.

use super::metrics::SchedulerMetrics;
use super::AlertSender;
use chrono::{DateTime, Utc};
use oxalert_common::types::{AlertRule, EvalContext, PostableAlert, RuleKey};
use oxalert_notify::error::NotifyError;
use oxalert_state::alerts::to_postable_alerts;
use oxalert_state::engine::resolve;
use oxalert_state::manager::StateManager;
use oxalert_state::state::reason;
use oxalert_state::{EvalResult, Evaluator};
use oxalert_storage::{InstanceStore, RuleStore};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created = 0,
    Idle = 1,
    Evaluating = 2,
    Stopped = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Idle,
            2 => Self::Evaluating,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The rule vanished from the rule store. Its state is discarded.
    RuleDeleted,
    /// The scheduler is shutting down. State is kept for the final flush.
    Shutdown,
}

/// Result of handing an evaluation signal to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Sent,
    /// The task is evaluating or already has a signal waiting.
    Busy,
    Stopped,
}

/// Collaborators shared by every evaluation task.
pub struct TaskDeps {
    pub rule_store: Arc<dyn RuleStore>,
    pub instance_store: Arc<dyn InstanceStore>,
    pub evaluator: Arc<dyn Evaluator>,
    pub state_manager: Arc<StateManager>,
    pub sender: Arc<dyn AlertSender>,
    pub metrics: SchedulerMetrics,
    pub max_attempts: u32,
}

struct Shared {
    state: AtomicU8,
    stop_reason: OnceLock<StopReason>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from` to `to` only if nothing changed the state meanwhile.
    fn transition(&self, from: TaskState, to: TaskState) -> Result<(), TaskState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }

    /// Claims the task for one evaluation. Only one caller can win until
    /// the task reports `Idle` again.
    fn claim(&self) -> Result<TaskState, TaskState> {
        let mut current = self.state();
        loop {
            match current {
                TaskState::Created | TaskState::Idle => {
                    match self.transition(current, TaskState::Evaluating) {
                        Ok(()) => return Ok(current),
                        Err(actual) => current = actual,
                    }
                }
                other => return Err(other),
            }
        }
    }
}

/// Scheduler-side handle of a running evaluation task.
pub struct TaskHandle {
    key: RuleKey,
    tx: mpsc::Sender<EvalContext>,
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    /// Spawns the task for `rule`. Its cancellation token is a child of
    /// `parent`, so cancelling the parent stops every task.
    pub fn spawn(rule: AlertRule, deps: Arc<TaskDeps>, parent: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(TaskState::Created as u8),
            stop_reason: OnceLock::new(),
            cancel: parent.child_token(),
        });
        let key = rule.key();
        let task = EvalTask {
            key: key.clone(),
            rule,
            deps,
            rx,
            shared: Arc::clone(&shared),
        };
        let join = tokio::spawn(task.run());
        Self {
            key,
            tx,
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Hands one evaluation signal to the task without waiting. A signal
    /// that cannot be taken right away is dropped, never queued.
    ///
    /// The task is marked `Evaluating` before the signal is sent, so a
    /// second signal is refused from that moment on, even before the task
    /// has picked the first one up.
    pub fn try_eval(&self, ctx: EvalContext) -> Signal {
        if self.shared.cancel.is_cancelled() {
            return Signal::Stopped;
        }
        let before = match self.shared.claim() {
            Ok(before) => before,
            Err(TaskState::Stopped) => return Signal::Stopped,
            Err(_) => return Signal::Busy,
        };
        match self.tx.try_send(ctx) {
            Ok(()) => Signal::Sent,
            Err(TrySendError::Full(_)) => Signal::Busy,
            Err(TrySendError::Closed(_)) => {
                let _ = self.shared.transition(TaskState::Evaluating, before);
                Signal::Stopped
            }
        }
    }

    /// Asks the task to stop. The first reason given wins.
    pub fn stop(&self, reason: StopReason) {
        let _ = self.shared.stop_reason.set(reason);
        self.shared.cancel.cancel();
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.stop_reason.get().copied()
    }

    /// Waits for the task to finish. Returns immediately when it was
    /// already joined.
    pub async fn join(&self) {
        let handle = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(rule = %self.key, error = %e, "Evaluation task panicked");
            }
        }
    }
}

struct EvalTask {
    key: RuleKey,
    /// Last version of the rule this task has seen.
    rule: AlertRule,
    deps: Arc<TaskDeps>,
    rx: mpsc::Receiver<EvalContext>,
    shared: Arc<Shared>,
}

impl EvalTask {
    async fn run(mut self) {
        // a signal may already have claimed the task
        let _ = self.shared.transition(TaskState::Created, TaskState::Idle);
        tracing::debug!(rule_uid = %self.key.uid, org_id = self.key.org_id, "Evaluation task started");

        loop {
            let ctx = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break,
                ctx = self.rx.recv() => match ctx {
                    Some(ctx) => ctx,
                    None => break,
                },
            };
            self.evaluate(ctx).await;
            self.shared.set_state(TaskState::Idle);
        }

        self.shared.set_state(TaskState::Stopped);
        let reason = self
            .shared
            .stop_reason
            .get()
            .copied()
            .unwrap_or(StopReason::Shutdown);
        if reason == StopReason::RuleDeleted {
            self.clean_up().await;
        }
        tracing::debug!(rule_uid = %self.key.uid, org_id = self.key.org_id, ?reason, "Evaluation task stopped");
    }

    async fn evaluate(&mut self, ctx: EvalContext) {
        if ctx.rule_version > self.rule.version {
            match self.deps.rule_store.get_alert_rule_by_key(&self.key).await {
                Ok(rule) => self.rule = rule,
                Err(e) => {
                    tracing::error!(
                        rule_uid = %self.key.uid,
                        org_id = self.key.org_id,
                        error = %e,
                        "Failed to refresh alert rule, skipping evaluation"
                    );
                    return;
                }
            }
        }

        let org = self.key.org_id.to_string();
        let timer = self.deps.metrics.evaluation_duration.start_timer();
        self.deps.metrics.evaluations.with_label_values(&[org.as_str()]).inc();

        let Some(results) = self.evaluate_with_retries(ctx.scheduled_at).await else {
            self.deps
                .metrics
                .evaluation_failures
                .with_label_values(&[org.as_str()])
                .inc();
            return;
        };

        let outcome =
            self.deps
                .state_manager
                .process_eval_results(&self.rule, results, ctx.scheduled_at);
        timer.observe_duration();

        if let Err(e) = self.deps.instance_store.save_instances(&outcome.current).await {
            tracing::error!(rule_uid = %self.key.uid, org_id = self.key.org_id, error = %e, "Failed to save alert instances");
        }
        if !outcome.removed.is_empty() {
            let hashes: Vec<u64> = outcome.removed.iter().map(|i| i.labels_hash).collect();
            if let Err(e) = self.deps.instance_store.delete_instances(&self.key, &hashes).await {
                tracing::error!(rule_uid = %self.key.uid, org_id = self.key.org_id, error = %e, "Failed to delete stale alert instances");
            }
        }

        let changed = outcome.transitions.iter().filter(|t| t.changed).count();
        let alerts: Vec<PostableAlert> = outcome
            .to_notify
            .iter()
            .flat_map(|inst| to_postable_alerts(&self.rule, inst))
            .collect();
        tracing::debug!(
            rule_uid = %self.key.uid,
            org_id = self.key.org_id,
            instances = outcome.current.len(),
            changed,
            alerts = alerts.len(),
            "Rule evaluated"
        );
        self.dispatch(alerts);
    }

    /// Runs the evaluator up to `max_attempts` times back to back.
    async fn evaluate_with_retries(&self, at: DateTime<Utc>) -> Option<Vec<EvalResult>> {
        let attempts = self.deps.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.deps.evaluator.evaluate(&self.rule.condition, at).await {
                Ok(results) => return Some(results),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        rule_uid = %self.key.uid,
                        org_id = self.key.org_id,
                        attempt,
                        error = %e,
                        "Rule evaluation failed, retrying"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        rule_uid = %self.key.uid,
                        org_id = self.key.org_id,
                        attempts,
                        error = %e,
                        "Rule evaluation failed, giving up for this cycle"
                    );
                }
            }
        }
        None
    }

    fn dispatch(&self, alerts: Vec<PostableAlert>) {
        if alerts.is_empty() {
            return;
        }
        let count = alerts.len();
        match self.deps.sender.send(self.key.org_id, alerts) {
            Ok(()) => {}
            Err(NotifyError::NoDestination(_)) => tracing::error!(
                rule_uid = %self.key.uid,
                org_id = self.key.org_id,
                alerts = count,
                "No local or external alertmanager for organization, alerts dropped"
            ),
            Err(e) => tracing::error!(
                rule_uid = %self.key.uid,
                org_id = self.key.org_id,
                alerts = count,
                error = %e,
                "Failed to send alerts"
            ),
        }
    }

    /// Forgets a deleted rule and resolves whatever it had firing.
    async fn clean_up(&self) {
        let removed = self.deps.state_manager.delete_rule(&self.key);
        if let Err(e) = self.deps.instance_store.delete_rule_instances(&self.key).await {
            tracing::error!(rule_uid = %self.key.uid, org_id = self.key.org_id, error = %e, "Failed to delete alert instances of deleted rule");
        }

        let now = Utc::now();
        let alerts: Vec<PostableAlert> = removed
            .iter()
            .filter(|inst| inst.is_firing())
            .flat_map(|inst| {
                let resolved = resolve(inst, reason::RULE_DELETED, now);
                to_postable_alerts(&self.rule, &resolved.instance)
            })
            .collect();
        tracing::info!(
            rule_uid = %self.key.uid,
            org_id = self.key.org_id,
            instances = removed.len(),
            resolved = alerts.len(),
            "Alert rule deleted"
        );
        self.dispatch(alerts);
    }
}
