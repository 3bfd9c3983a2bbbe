#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use oxalert_common::labels::Labels;
use oxalert_common::types::{AlertRule, Condition, ExecErrState, NoDataState, OrgId, PostableAlert};
use oxalert_notify::error::NotifyError;
use oxalert_server::scheduler::metrics::SchedulerMetrics;
use oxalert_server::scheduler::task::TaskDeps;
use oxalert_server::scheduler::{AlertSender, Scheduler, SchedulerSettings};
use oxalert_state::error::EvalError;
use oxalert_state::manager::StateManager;
use oxalert_state::{EvalResult, EvalState, Evaluator};
use oxalert_storage::memory::{MemoryInstanceStore, MemoryRuleStore};
use oxalert_storage::InstanceStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE: Duration = Duration::from_secs(10);

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Logical time of tick `n` at the default base interval.
pub fn tick_time(n: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::seconds(10 * n)
}

/// A rule whose condition ref ID is its uid, so the fake evaluator can
/// answer per rule.
pub fn rule(org_id: OrgId, uid: &str, interval_seconds: i64) -> AlertRule {
    AlertRule {
        org_id,
        uid: uid.to_string(),
        title: format!("{uid} alert"),
        folder_title: "Infra".to_string(),
        version: 1,
        interval_seconds,
        condition: Condition {
            condition: uid.to_string(),
            data: serde_json::Value::Null,
        },
        no_data_state: NoDataState::NoData,
        exec_err_state: ExecErrState::Error,
        for_duration: Duration::ZERO,
        labels: Labels::new(),
        annotations: Labels::new(),
        notification_settings: Vec::new(),
        is_paused: false,
    }
}

pub fn host(name: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert("instance".to_string(), name.to_string());
    labels
}

/// Evaluator answering from a per-condition script.
#[derive(Default)]
pub struct FakeEvaluator {
    states: Mutex<HashMap<String, EvalState>>,
    failures: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl FakeEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// State reported for the single `web-01` series of `condition`.
    pub fn set_state(&self, condition: &str, state: EvalState) {
        self.states
            .lock()
            .unwrap()
            .insert(condition.to_string(), state);
    }

    /// Makes the next `n` calls for `condition` fail.
    pub fn fail_next(&self, condition: &str, n: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(condition.to_string(), n);
    }

    pub fn set_delay(&self, condition: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(condition.to_string(), delay);
    }

    /// Evaluation times seen for `condition`, including failed attempts.
    pub fn calls(&self, condition: &str) -> Vec<DateTime<Utc>> {
        self.calls
            .lock()
            .unwrap()
            .get(condition)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(
        &self,
        condition: &Condition,
        at: DateTime<Utc>,
    ) -> oxalert_state::error::Result<Vec<EvalResult>> {
        let key = condition.condition.clone();
        self.calls
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(at);

        let delay = self.delays.lock().unwrap().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(EvalError::Unavailable("scripted failure".to_string()));
                }
            }
        }

        let state = self
            .states
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(EvalState::Normal);
        Ok(vec![EvalResult::new(host("web-01"), state)])
    }
}

/// Sender that records every batch.
#[derive(Default)]
pub struct RecordingSender {
    batches: Mutex<Vec<(OrgId, Vec<PostableAlert>)>>,
    no_destination: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(OrgId, Vec<PostableAlert>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<PostableAlert> {
        self.batches()
            .into_iter()
            .flat_map(|(_, alerts)| alerts)
            .collect()
    }

    pub fn set_no_destination(&self, value: bool) {
        self.no_destination.store(value, Ordering::SeqCst);
    }
}

impl AlertSender for RecordingSender {
    fn send(&self, org_id: OrgId, alerts: Vec<PostableAlert>) -> oxalert_notify::error::Result<()> {
        if self.no_destination.load(Ordering::SeqCst) {
            return Err(NotifyError::NoDestination(org_id));
        }
        self.batches.lock().unwrap().push((org_id, alerts));
        Ok(())
    }
}

pub struct TestContext {
    pub rule_store: Arc<MemoryRuleStore>,
    pub instance_store: Arc<MemoryInstanceStore>,
    pub evaluator: Arc<FakeEvaluator>,
    pub sender: Arc<RecordingSender>,
    pub state_manager: Arc<StateManager>,
    pub metrics: SchedulerMetrics,
    pub scheduler: Arc<Scheduler>,
}

pub fn build_test_context(rules: Vec<AlertRule>) -> TestContext {
    build_test_context_with(rules, SchedulerSettings::default())
}

pub fn build_test_context_with(rules: Vec<AlertRule>, settings: SchedulerSettings) -> TestContext {
    let rule_store = Arc::new(MemoryRuleStore::with_rules(rules));
    let instance_store = Arc::new(MemoryInstanceStore::new());
    let evaluator = Arc::new(FakeEvaluator::new());
    let sender = Arc::new(RecordingSender::new());
    let state_manager = Arc::new(StateManager::new(100, Duration::from_secs(60)));
    let metrics = SchedulerMetrics::unregistered().unwrap();
    let scheduler = Arc::new(build_scheduler(
        settings,
        rule_store.clone(),
        instance_store.clone(),
        evaluator.clone(),
        state_manager.clone(),
        sender.clone(),
        metrics.clone(),
    ));
    TestContext {
        rule_store,
        instance_store,
        evaluator,
        sender,
        state_manager,
        metrics,
        scheduler,
    }
}

pub fn build_scheduler(
    settings: SchedulerSettings,
    rule_store: Arc<MemoryRuleStore>,
    instance_store: Arc<dyn InstanceStore>,
    evaluator: Arc<FakeEvaluator>,
    state_manager: Arc<StateManager>,
    sender: Arc<RecordingSender>,
    metrics: SchedulerMetrics,
) -> Scheduler {
    Scheduler::new(
        settings,
        rule_store,
        instance_store,
        evaluator,
        state_manager,
        sender,
        metrics,
    )
}

/// Runs `tick` and lets every signal it dispatched be evaluated.
pub async fn tick(ctx: &TestContext, n: i64) -> oxalert_server::scheduler::TickResult {
    let result = ctx.scheduler.process_tick(n, tick_time(n)).await;
    settle().await;
    result
}

/// Advances the paused clock one base interval so staggered signals fire
/// and their evaluations finish.
pub async fn settle() {
    tokio::time::sleep(BASE).await;
}

/// Collaborators of `ctx` for driving a single task by hand.
pub fn task_deps(ctx: &TestContext) -> Arc<TaskDeps> {
    Arc::new(TaskDeps {
        rule_store: ctx.rule_store.clone(),
        instance_store: ctx.instance_store.clone(),
        evaluator: ctx.evaluator.clone(),
        state_manager: ctx.state_manager.clone(),
        sender: ctx.sender.clone(),
        metrics: ctx.metrics.clone(),
        max_attempts: 1,
    })
}
