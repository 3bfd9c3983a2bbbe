use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Notification-side metrics, registered in the registry handed in by the owner.
#[derive(Clone)]
pub struct NotifyMetrics {
    pub aggregation_groups: IntGaugeVec,
    pub configs_applied: IntCounterVec,
    pub notifications_sent: IntCounterVec,
    pub notifications_failed: IntCounterVec,
    pub notifications_deduplicated: IntCounterVec,
    pub external_batches: IntCounterVec,
}

impl NotifyMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.aggregation_groups.clone()))?;
        registry.register(Box::new(metrics.configs_applied.clone()))?;
        registry.register(Box::new(metrics.notifications_sent.clone()))?;
        registry.register(Box::new(metrics.notifications_failed.clone()))?;
        registry.register(Box::new(metrics.notifications_deduplicated.clone()))?;
        registry.register(Box::new(metrics.external_batches.clone()))?;
        Ok(metrics)
    }

    /// Metrics that are collected but not exported anywhere.
    pub fn unregistered() -> prometheus::Result<Self> {
        Ok(Self {
            aggregation_groups: IntGaugeVec::new(
                Opts::new("oxalert_alertmanager_aggregation_groups", "Active aggregation groups"),
                &["org"],
            )?,
            configs_applied: IntCounterVec::new(
                Opts::new("oxalert_alertmanager_config_applied_total", "Configurations applied"),
                &["org"],
            )?,
            notifications_sent: IntCounterVec::new(
                Opts::new("oxalert_notifications_sent_total", "Notifications delivered"),
                &["org", "receiver"],
            )?,
            notifications_failed: IntCounterVec::new(
                Opts::new("oxalert_notifications_failed_total", "Notifications that failed delivery"),
                &["org", "receiver"],
            )?,
            notifications_deduplicated: IntCounterVec::new(
                Opts::new(
                    "oxalert_notifications_deduplicated_total",
                    "Notifications skipped because a cluster peer delivered them",
                ),
                &["org", "receiver"],
            )?,
            external_batches: IntCounterVec::new(
                Opts::new("oxalert_external_alert_batches_total", "Batches posted to external Alertmanagers"),
                &["result"],
            )?,
        })
    }
}
