//! Per-tenant notification backend.
//!
//! Incoming alerts are matched against the routing tree and collected into
//! aggregation groups, one per matched route and set of group-by label
//! values. A group is flushed for the first time `group_wait` after it was
//! created and then every `group_interval`. A flush notifies when the
//! group's content changed, or when `repeat_interval` has passed since the
//! last notification while alerts are still firing. Resolved alerts are
//! dropped from the group once they have been delivered.

use crate::cluster::Cluster;
use crate::config::AlertmanagerConfig;
use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use crate::plugin::ChannelRegistry;
use crate::routing::ResolvedRoute;
use crate::{GroupStatus, Notification, NotificationChannel};
use chrono::{DateTime, Utc};
use oxalert_common::chrono_duration;
use oxalert_common::labels::{labels_fingerprint, Labels};
use oxalert_common::types::{OrgId, PostableAlert};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::Xxh3;

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// How often due aggregation groups are checked.
    pub flush_interval: Duration,
    /// Decides the wait before each delivery and which deliveries another
    /// instance already made.
    pub cluster: Arc<Cluster>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            cluster: Arc::new(Cluster::standalone()),
        }
    }
}

struct AggregationGroup {
    route: ResolvedRoute,
    labels: Labels,
    /// alert label fingerprint -> latest payload
    alerts: BTreeMap<u64, PostableAlert>,
    next_flush: DateTime<Utc>,
    last_notified: Option<DateTime<Utc>>,
    /// Firing alerts included in the last notification.
    notified_firing: BTreeSet<u64>,
    /// Content changed since the last flush.
    dirty: bool,
}

impl AggregationGroup {
    fn new(route: ResolvedRoute, labels: Labels, now: DateTime<Utc>) -> Self {
        let next_flush = now + chrono_duration(route.group_wait);
        Self {
            route,
            labels,
            alerts: BTreeMap::new(),
            next_flush,
            last_notified: None,
            notified_firing: BTreeSet::new(),
            dirty: false,
        }
    }

    /// Same timing and notification state, no alerts.
    fn carry_over(&self) -> Self {
        Self {
            route: self.route.clone(),
            labels: self.labels.clone(),
            alerts: BTreeMap::new(),
            next_flush: self.next_flush,
            last_notified: self.last_notified,
            notified_firing: self.notified_firing.clone(),
            dirty: self.dirty,
        }
    }

    /// Stores `alert`, marking the group dirty unless only the firing
    /// heartbeat moved.
    fn insert(&mut self, fp: u64, alert: &PostableAlert, now: DateTime<Utc>) {
        let changed = match self.alerts.get(&fp) {
            None => true,
            Some(old) => old.is_resolved_at(now) != alert.is_resolved_at(now),
        };
        self.alerts.insert(fp, alert.clone());
        if changed {
            self.dirty = true;
        }
    }
}

fn group_key(route: &ResolvedRoute, group_labels: &Labels) -> String {
    format!("{}:{:016x}", route.id, labels_fingerprint(group_labels))
}

fn notification_digest(firing: &BTreeSet<u64>, resolved: &BTreeSet<u64>) -> u64 {
    let mut hasher = Xxh3::new();
    for fp in firing {
        hasher.update(&fp.to_le_bytes());
    }
    hasher.update(b"|");
    for fp in resolved {
        hasher.update(&fp.to_le_bytes());
    }
    hasher.digest()
}

struct Applied {
    config: AlertmanagerConfig,
    hash: u64,
    channels: HashMap<String, Vec<Arc<dyn NotificationChannel>>>,
}

/// The notification backend of one tenant.
pub struct Alertmanager {
    org_id: OrgId,
    registry: Arc<ChannelRegistry>,
    options: BackendOptions,
    metrics: NotifyMetrics,
    applied: RwLock<Option<Arc<Applied>>>,
    groups: Mutex<BTreeMap<String, AggregationGroup>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Alertmanager {
    pub fn new(
        org_id: OrgId,
        registry: Arc<ChannelRegistry>,
        options: BackendOptions,
        metrics: NotifyMetrics,
    ) -> Self {
        Self {
            org_id,
            registry,
            options,
            metrics,
            applied: RwLock::new(None),
            groups: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn org_id(&self) -> OrgId {
        self.org_id
    }

    fn applied(&self) -> Option<Arc<Applied>> {
        self.applied
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_groups(&self) -> MutexGuard<'_, BTreeMap<String, AggregationGroup>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A backend is ready once a configuration has been applied.
    pub fn is_ready(&self) -> bool {
        self.applied().is_some()
    }

    /// Hash of the running configuration.
    pub fn config_hash(&self) -> Option<u64> {
        self.applied().map(|a| a.hash)
    }

    pub fn group_count(&self) -> usize {
        self.lock_groups().len()
    }

    /// Validates `config`, builds its channels and swaps it in. Alerts held
    /// by the previous configuration are re-routed; groups whose route and
    /// labels are unchanged keep their timing and notification state.
    pub fn apply_config(&self, config: AlertmanagerConfig, hash: u64) -> Result<()> {
        config.validate()?;

        let mut channels: HashMap<String, Vec<Arc<dyn NotificationChannel>>> = HashMap::new();
        for receiver in &config.receivers {
            let built = channels.entry(receiver.name.clone()).or_default();
            for integration in &receiver.integrations {
                built.push(self.registry.create_channel(
                    &integration.kind,
                    &receiver.name,
                    &integration.settings,
                )?);
            }
        }

        let now = Utc::now();
        {
            let mut groups = self.lock_groups();
            let old = std::mem::take(&mut *groups);
            let mut rebuilt: BTreeMap<String, AggregationGroup> = BTreeMap::new();
            for (old_key, old_group) in &old {
                for (fp, alert) in &old_group.alerts {
                    for route in config.route.match_labels(&alert.labels) {
                        let labels = route.group_labels(&alert.labels);
                        let key = group_key(&route, &labels);
                        let group = rebuilt.entry(key.clone()).or_insert_with(|| {
                            if &key == old_key && route == old_group.route {
                                old_group.carry_over()
                            } else {
                                let mut fresh = AggregationGroup::new(route.clone(), labels, now);
                                fresh.dirty = true;
                                fresh
                            }
                        });
                        group.alerts.insert(*fp, alert.clone());
                    }
                }
            }
            *groups = rebuilt;
            self.metrics
                .aggregation_groups
                .with_label_values(&[&self.org_id.to_string()])
                .set(groups.len() as i64);
        }

        *self
            .applied
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(Applied {
            config,
            hash,
            channels,
        }));
        self.metrics
            .configs_applied
            .with_label_values(&[&self.org_id.to_string()])
            .inc();
        tracing::info!(org_id = self.org_id, hash = %format!("{hash:016x}"), "Alertmanager configuration applied");
        Ok(())
    }

    /// Routes `alerts` into their aggregation groups.
    pub fn put_alerts(&self, alerts: &[PostableAlert], now: DateTime<Utc>) -> Result<()> {
        let applied = self.applied().ok_or(NotifyError::NotReady(self.org_id))?;
        let mut groups = self.lock_groups();
        for alert in alerts {
            let fp = labels_fingerprint(&alert.labels);
            for route in applied.config.route.match_labels(&alert.labels) {
                let labels = route.group_labels(&alert.labels);
                let key = group_key(&route, &labels);
                groups
                    .entry(key)
                    .or_insert_with(|| AggregationGroup::new(route, labels, now))
                    .insert(fp, alert, now);
            }
        }
        self.metrics
            .aggregation_groups
            .with_label_values(&[&self.org_id.to_string()])
            .set(groups.len() as i64);
        Ok(())
    }

    /// Flushes every group that is due at `now` and returns the
    /// notifications to deliver.
    pub fn collect_due(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let Some(applied) = self.applied() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut groups = self.lock_groups();

        for (key, group) in groups.iter_mut() {
            if now < group.next_flush {
                continue;
            }
            let muted = group.route.mute_time_intervals.iter().any(|name| {
                applied
                    .config
                    .mute_time_interval(name)
                    .is_some_and(|m| m.is_active(now))
            });
            if muted {
                tracing::debug!(org_id = self.org_id, group = %key, "Notification suppressed (mute time active)");
                group.next_flush = now + chrono_duration(group.route.group_interval);
                continue;
            }

            let mut firing = Vec::new();
            let mut resolved = Vec::new();
            let mut firing_set = BTreeSet::new();
            let mut resolved_set = BTreeSet::new();
            for (fp, alert) in &group.alerts {
                if alert.is_resolved_at(now) {
                    if group.notified_firing.contains(fp) {
                        resolved.push(alert.clone());
                        resolved_set.insert(*fp);
                    }
                } else {
                    firing.push(alert.clone());
                    firing_set.insert(*fp);
                }
            }

            let repeat_due = group
                .last_notified
                .map_or(true, |at| now - at >= chrono_duration(group.route.repeat_interval));
            let changed = group.dirty || firing_set != group.notified_firing;
            let has_content = !firing.is_empty() || !resolved.is_empty();
            if has_content && (changed || (repeat_due && !firing.is_empty())) {
                let status = if firing.is_empty() {
                    GroupStatus::Resolved
                } else {
                    GroupStatus::Firing
                };
                firing.extend(resolved);
                out.push(Notification {
                    org_id: self.org_id,
                    receiver: group.route.receiver.clone(),
                    group_key: key.clone(),
                    group_labels: group.labels.clone(),
                    status,
                    alerts: firing,
                    digest: notification_digest(&firing_set, &resolved_set),
                    repeat_interval: group.route.repeat_interval,
                });
                group.last_notified = Some(now);
            }

            group.notified_firing = firing_set;
            group.alerts.retain(|_, a| !a.is_resolved_at(now));
            group.dirty = false;
            group.next_flush = now + chrono_duration(group.route.group_interval);
        }

        groups.retain(|_, g| !g.alerts.is_empty());
        self.metrics
            .aggregation_groups
            .with_label_values(&[&self.org_id.to_string()])
            .set(groups.len() as i64);
        out
    }

    /// Hands notifications to their receivers' channels, after the
    /// cluster delay and skipping what a peer already delivered.
    pub async fn deliver(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let Some(applied) = self.applied() else {
            return;
        };
        let cluster = &self.options.cluster;
        let delay = cluster.delivery_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let org = self.org_id.to_string();
        for n in &notifications {
            if cluster.delivered_by_peer(n, Utc::now()) {
                self.metrics
                    .notifications_deduplicated
                    .with_label_values(&[&org, &n.receiver])
                    .inc();
                tracing::debug!(org_id = self.org_id, receiver = %n.receiver, group = %n.group_key, "Notification already delivered by a cluster peer");
                continue;
            }
            let Some(channels) = applied.channels.get(&n.receiver) else {
                tracing::warn!(org_id = self.org_id, receiver = %n.receiver, "No channels for receiver");
                continue;
            };
            let mut delivered = false;
            for channel in channels {
                match channel.send(n).await {
                    Ok(()) => {
                        delivered = true;
                        self.metrics
                            .notifications_sent
                            .with_label_values(&[&org, &n.receiver])
                            .inc()
                    }
                    Err(e) => {
                        self.metrics
                            .notifications_failed
                            .with_label_values(&[&org, &n.receiver])
                            .inc();
                        tracing::error!(
                            org_id = self.org_id,
                            receiver = %n.receiver,
                            channel = channel.channel_type(),
                            error = %e,
                            "Failed to send notification"
                        );
                    }
                }
            }
            if delivered {
                cluster.record_delivery(n, Utc::now()).await;
            }
        }
    }

    /// Spawns the flush loop.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.options.flush_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let due = this.collect_due(Utc::now());
                        this.deliver(due).await;
                    }
                }
            }
            tracing::debug!(org_id = this.org_id, "Alertmanager flush loop stopped");
        });
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Stops the flush loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(org_id = self.org_id, error = %e, "Alertmanager flush loop panicked");
            }
        }
    }
}
