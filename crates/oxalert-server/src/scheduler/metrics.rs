use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Scheduler metrics, registered in the registry handed in by the owner.
#[derive(Clone)]
pub struct SchedulerMetrics {
    pub evaluations: IntCounterVec,
    pub evaluation_failures: IntCounterVec,
    pub evaluation_duration: Histogram,
    pub tick_duration: Histogram,
    pub registered_rules: IntGauge,
    pub schedulable_rules: IntGauge,
    pub dropped_signals: IntCounter,
}

impl SchedulerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.evaluations.clone()))?;
        registry.register(Box::new(metrics.evaluation_failures.clone()))?;
        registry.register(Box::new(metrics.evaluation_duration.clone()))?;
        registry.register(Box::new(metrics.tick_duration.clone()))?;
        registry.register(Box::new(metrics.registered_rules.clone()))?;
        registry.register(Box::new(metrics.schedulable_rules.clone()))?;
        registry.register(Box::new(metrics.dropped_signals.clone()))?;
        Ok(metrics)
    }

    pub fn unregistered() -> prometheus::Result<Self> {
        Ok(Self {
            evaluations: IntCounterVec::new(
                Opts::new("oxalert_rule_evaluations_total", "Rule evaluation cycles"),
                &["org"],
            )?,
            evaluation_failures: IntCounterVec::new(
                Opts::new(
                    "oxalert_rule_evaluation_failures_total",
                    "Rule evaluation cycles that exhausted their attempts",
                ),
                &["org"],
            )?,
            evaluation_duration: Histogram::with_opts(HistogramOpts::new(
                "oxalert_rule_evaluation_duration_seconds",
                "Time spent in one rule evaluation cycle",
            ))?,
            tick_duration: Histogram::with_opts(HistogramOpts::new(
                "oxalert_schedule_tick_duration_seconds",
                "Time spent processing one scheduler tick",
            ))?,
            registered_rules: IntGauge::new(
                "oxalert_schedule_registered_rules",
                "Rules with a registered evaluation task",
            )?,
            schedulable_rules: IntGauge::new(
                "oxalert_schedule_schedulable_rules",
                "Rules returned by the rule store on the last tick",
            )?,
            dropped_signals: IntCounter::new(
                "oxalert_schedule_dropped_signals_total",
                "Evaluation signals dropped because the task was busy",
            )?,
        })
    }
}
