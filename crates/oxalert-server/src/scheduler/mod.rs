//! Tick-driven rule scheduler.
//!
//! Every base interval the scheduler lists the rules of the enabled
//! tenants, keeps one [`task::TaskHandle`] per rule, and signals the rules
//! that are due. Signals for one tick are spread over the tick window and
//! never wait for a task: a busy task simply misses the tick.

pub mod metrics;
pub mod registry;
pub mod task;

use crate::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use metrics::SchedulerMetrics;
use oxalert_common::chrono_duration;
use oxalert_common::types::{AlertRule, EvalContext, OrgId, PostableAlert, RuleKey};
use oxalert_notify::manager::MultiOrgAlertmanager;
use oxalert_state::manager::StateManager;
use oxalert_state::Evaluator;
use oxalert_storage::{InstanceStore, RuleStore};
use registry::RuleRegistry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task::{Signal, StopReason, TaskDeps, TaskHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Where evaluation tasks hand their notification payloads.
pub trait AlertSender: Send + Sync {
    fn send(&self, org_id: OrgId, alerts: Vec<PostableAlert>) -> oxalert_notify::error::Result<()>;
}

impl AlertSender for MultiOrgAlertmanager {
    fn send(&self, org_id: OrgId, alerts: Vec<PostableAlert>) -> oxalert_notify::error::Result<()> {
        MultiOrgAlertmanager::send(self, org_id, alerts)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_attempts: u32,
    pub disabled_orgs: HashSet<OrgId>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            base_interval: config.base_interval(),
            min_interval: Duration::from_secs(config.min_interval_secs),
            max_attempts: config.max_attempts,
            disabled_orgs: config.disabled_orgs(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickResult {
    /// Rules signalled for evaluation, in dispatch order.
    pub due: Vec<RuleKey>,
    /// Rules whose task was stopped because they left the rule store.
    pub stopped: Vec<RuleKey>,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    deps: Arc<TaskDeps>,
    registry: RuleRegistry,
    root: CancellationToken,
    paused: AtomicBool,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        rule_store: Arc<dyn RuleStore>,
        instance_store: Arc<dyn InstanceStore>,
        evaluator: Arc<dyn Evaluator>,
        state_manager: Arc<StateManager>,
        sender: Arc<dyn AlertSender>,
        metrics: SchedulerMetrics,
    ) -> Self {
        let deps = Arc::new(TaskDeps {
            rule_store,
            instance_store,
            evaluator,
            state_manager,
            sender,
            metrics,
            max_attempts: settings.max_attempts,
        });
        Self {
            settings,
            deps,
            registry: RuleRegistry::new(),
            root: CancellationToken::new(),
            paused: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::info!("Rule scheduler paused");
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        tracing::info!("Rule scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Loads persisted instances into the state cache. Storage errors are
    /// logged and leave the cache as it was.
    pub async fn warm_up(&self) -> usize {
        let store = &self.deps.instance_store;
        let orgs = match store.fetch_org_ids().await {
            Ok(orgs) => orgs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch organizations for state warm-up");
                return 0;
            }
        };
        let mut loaded = 0;
        for org_id in orgs {
            match store.list_instances(org_id).await {
                Ok(instances) => loaded += self.deps.state_manager.warm(instances),
                Err(e) => {
                    tracing::error!(org_id, error = %e, "Failed to load alert instances")
                }
            }
        }
        loaded
    }

    /// Ticks every base interval until `shutdown` fires, then stops every
    /// task and flushes the state cache.
    pub async fn run(&self, shutdown: CancellationToken) {
        let base = self.settings.base_interval;
        let started = Instant::now();
        let started_at = Utc::now();
        let mut tick = interval(base);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            base_interval_secs = base.as_secs(),
            "Rule scheduler started"
        );

        loop {
            let at = tokio::select! {
                _ = shutdown.cancelled() => break,
                at = tick.tick() => at,
            };
            if self.is_paused() {
                tracing::debug!("Rule scheduler paused, skipping tick");
                continue;
            }
            let tick_number = ((at - started).as_nanos() / base.as_nanos().max(1)) as i64;
            let tick_time = started_at + chrono_duration(base) * tick_number as i32;
            let timer = self.deps.metrics.tick_duration.start_timer();
            self.process_tick(tick_number, tick_time).await;
            timer.observe_duration();
        }

        self.shutdown().await;
    }

    /// Brings the registry in line with the rule store and signals the
    /// rules due at `tick_number`. Never fails.
    pub async fn process_tick(&self, tick_number: i64, tick_time: DateTime<Utc>) -> TickResult {
        let rules = match self
            .deps
            .rule_store
            .list_alert_rules(&self.settings.disabled_orgs)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list alert rules, skipping tick");
                return TickResult::default();
            }
        };
        self.deps.metrics.schedulable_rules.set(rules.len() as i64);

        let mut seen: HashSet<RuleKey> = HashSet::with_capacity(rules.len());
        let mut ready: Vec<(Arc<TaskHandle>, EvalContext)> = Vec::new();
        for rule in rules {
            let key = rule.key();
            seen.insert(key.clone());
            let due = self.is_due(&rule, tick_number);
            let version = rule.version;
            let handle = self.registry.get_or_create(&key, || {
                TaskHandle::spawn(rule, Arc::clone(&self.deps), &self.root)
            });
            if due {
                ready.push((
                    handle,
                    EvalContext {
                        scheduled_at: tick_time,
                        rule_version: version,
                    },
                ));
            }
        }

        let mut stopped = Vec::new();
        for key in self.registry.keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(handle) = self.registry.remove(&key) {
                handle.stop(StopReason::RuleDeleted);
                stopped.push(key);
            }
        }
        self.deps.metrics.registered_rules.set(self.registry.len() as i64);

        let due: Vec<RuleKey> = ready.iter().map(|(h, _)| h.key().clone()).collect();
        self.dispatch(ready);

        tracing::debug!(
            tick = tick_number,
            registered = self.registry.len(),
            due = due.len(),
            stopped = stopped.len(),
            "Scheduler tick processed"
        );
        TickResult { due, stopped }
    }

    /// Whether `rule` should be evaluated at `tick_number`. Paused rules,
    /// zero intervals and intervals that are not a multiple of the base
    /// interval never are.
    fn is_due(&self, rule: &AlertRule, tick_number: i64) -> bool {
        if rule.is_paused {
            return false;
        }
        let base = self.settings.base_interval.as_secs().max(1);
        let interval = rule.interval().max(self.settings.min_interval).as_secs();
        if interval == 0 {
            tracing::warn!(
                rule_uid = %rule.uid,
                org_id = rule.org_id,
                "Rule interval is zero, skipping"
            );
            return false;
        }
        if interval % base != 0 {
            tracing::warn!(
                rule_uid = %rule.uid,
                org_id = rule.org_id,
                interval_seconds = interval,
                base_interval_secs = base,
                "Rule interval is not a multiple of the base interval, skipping"
            );
            return false;
        }
        let frequency = (interval / base) as i64;
        tick_number % frequency == 0
    }

    /// Spreads the signals of one tick evenly across the tick window.
    fn dispatch(&self, ready: Vec<(Arc<TaskHandle>, EvalContext)>) {
        if ready.is_empty() {
            return;
        }
        let step = self.settings.base_interval / ready.len() as u32;
        for (i, (handle, ctx)) in ready.into_iter().enumerate() {
            let delay = step * i as u32;
            let dropped = self.deps.metrics.dropped_signals.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match handle.try_eval(ctx) {
                    Signal::Sent => {}
                    Signal::Busy => {
                        dropped.inc();
                        tracing::debug!(rule = %handle.key(), "Evaluation still running, tick dropped");
                    }
                    Signal::Stopped => {
                        tracing::debug!(rule = %handle.key(), "Evaluation task stopped before dispatch");
                    }
                }
            });
        }
    }

    /// Stops every task, waits for them, and writes the state cache to the
    /// instance store.
    pub async fn shutdown(&self) {
        let handles = self.registry.drain();
        for handle in &handles {
            handle.stop(StopReason::Shutdown);
        }
        self.root.cancel();
        for handle in &handles {
            handle.join().await;
        }
        self.deps.metrics.registered_rules.set(0);

        let snapshot = self.deps.state_manager.snapshot();
        for (org_id, instances) in snapshot {
            let count = instances.len();
            match self.deps.instance_store.full_sync(org_id, &instances).await {
                Ok(()) => tracing::debug!(org_id, instances = count, "Alert state flushed"),
                Err(e) => tracing::error!(org_id, error = %e, "Failed to flush alert state"),
            }
        }
        tracing::info!(tasks = handles.len(), "Rule scheduler stopped");
    }
}
