use crate::autogen::apply_autogenerated_routes;
use crate::backend::{Alertmanager, BackendOptions};
use crate::cluster::{Cluster, ClusterPeer, ClusterSettings};
use crate::config::AlertmanagerConfig;
use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use crate::plugin::ChannelRegistry;
use crate::sender::{parse_alertmanager_urls, targets_hash, AlertsClient, ExternalSender};
use chrono::Utc;
use oxalert_common::types::{OrgId, PostableAlert};
use oxalert_storage::{AlertmanagerConfigStore, RuleStore, SendAlertsTo};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    /// How often tenants and their configurations are re-read.
    pub poll_interval: Duration,
    pub flush_interval: Duration,
    pub cluster: ClusterSettings,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(1),
            cluster: ClusterSettings {
                peer_timeout: Duration::from_secs(15),
                join_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TenantAdmin {
    send_alerts_to: SendAlertsTo,
    dropped: Vec<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns one notification backend per tenant and the tenants' external
/// senders, keeping both in step with storage.
///
/// The maps are only locked to look up or swap entries. Starting and
/// stopping backends and senders happens after the lock is released.
pub struct MultiOrgAlertmanager {
    settings: NotifierSettings,
    config_store: Arc<dyn AlertmanagerConfigStore>,
    rule_store: Arc<dyn RuleStore>,
    registry: Arc<ChannelRegistry>,
    client: Arc<dyn AlertsClient>,
    metrics: NotifyMetrics,
    cluster: Arc<Cluster>,
    alertmanagers: Mutex<HashMap<OrgId, Arc<Alertmanager>>>,
    senders: Mutex<HashMap<OrgId, Arc<ExternalSender>>>,
    admin: Mutex<HashMap<OrgId, TenantAdmin>>,
}

impl MultiOrgAlertmanager {
    pub fn new(
        settings: NotifierSettings,
        config_store: Arc<dyn AlertmanagerConfigStore>,
        rule_store: Arc<dyn RuleStore>,
        registry: Arc<ChannelRegistry>,
        client: Arc<dyn AlertsClient>,
        metrics: NotifyMetrics,
    ) -> Self {
        Self {
            config_store,
            rule_store,
            registry,
            client,
            cluster: Arc::new(Cluster::new(settings.cluster.clone())),
            settings,
            metrics,
            alertmanagers: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            admin: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the configured cluster peers. Failure leaves this instance
    /// running on its own; joining twice is a no-op.
    pub async fn join_cluster(&self) -> Option<ClusterPeer> {
        self.cluster.join().await
    }

    pub fn cluster_peer(&self) -> Option<ClusterPeer> {
        self.cluster.peer()
    }

    /// Shared by every backend, so membership changes reach backends that
    /// already run.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            flush_interval: self.settings.flush_interval,
            cluster: Arc::clone(&self.cluster),
        }
    }

    /// Stored (or default) config of a tenant with the routes generated
    /// from its rules spliced in, and its hash.
    async fn load_config(&self, org_id: OrgId) -> Result<(AlertmanagerConfig, u64)> {
        let mut config = match self.config_store.get_latest_config(org_id).await? {
            Some(stored) => AlertmanagerConfig::parse(&stored.configuration)?,
            None => AlertmanagerConfig::default(),
        };
        let settings = self.rule_store.list_notification_settings(org_id).await?;
        apply_autogenerated_routes(&mut config, settings, true)?;
        let hash = config.hash()?;
        Ok((config, hash))
    }

    /// Brings the set of backends and senders in line with storage.
    pub async fn load_and_sync(&self) {
        let orgs = match self.config_store.fetch_org_ids().await {
            Ok(orgs) => orgs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch organizations for alertmanager sync");
                return;
            }
        };
        let active: HashSet<OrgId> = orgs.iter().copied().collect();

        let (current, stale) = {
            let mut ams = lock(&self.alertmanagers);
            let mut current = Vec::with_capacity(orgs.len());
            for org_id in &orgs {
                let mut created = false;
                let am = ams
                    .entry(*org_id)
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(Alertmanager::new(
                            *org_id,
                            Arc::clone(&self.registry),
                            self.backend_options(),
                            self.metrics.clone(),
                        ))
                    })
                    .clone();
                current.push((am, created));
            }
            let stale_ids: Vec<OrgId> = ams.keys().filter(|o| !active.contains(o)).copied().collect();
            let stale: Vec<Arc<Alertmanager>> =
                stale_ids.iter().filter_map(|o| ams.remove(o)).collect();
            (current, stale)
        };

        for (am, created) in current {
            let org_id = am.org_id();
            match self.load_config(org_id).await {
                Ok((config, hash)) => {
                    if am.config_hash() != Some(hash) {
                        if let Err(e) = am.apply_config(config, hash) {
                            tracing::error!(org_id, error = %e, "Failed to apply alertmanager configuration");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(org_id, error = %e, "Failed to load alertmanager configuration")
                }
            }
            if created {
                am.start();
                tracing::info!(org_id, "Alertmanager started");
            }
        }

        for am in stale {
            am.stop().await;
            tracing::info!(org_id = am.org_id(), "Alertmanager stopped for removed organization");
        }

        self.sync_senders(&orgs).await;
    }

    /// Starts senders whose target list changed and stops the ones no
    /// longer wanted.
    async fn sync_senders(&self, orgs: &[OrgId]) {
        let mut wanted: HashMap<OrgId, Vec<url::Url>> = HashMap::new();
        let mut admins: HashMap<OrgId, TenantAdmin> = HashMap::new();
        for &org_id in orgs {
            let admin = match self.config_store.get_admin_config(org_id).await {
                Ok(admin) => admin,
                Err(e) => {
                    tracing::error!(org_id, error = %e, "Failed to load admin configuration");
                    continue;
                }
            };
            let (urls, dropped) = parse_alertmanager_urls(&admin.alertmanagers);
            if admin.send_alerts_to.external() && !urls.is_empty() {
                wanted.insert(org_id, urls);
            }
            admins.insert(
                org_id,
                TenantAdmin {
                    send_alerts_to: admin.send_alerts_to,
                    dropped,
                },
            );
        }

        let mut to_start = Vec::new();
        let mut to_stop = Vec::new();
        {
            let mut senders = lock(&self.senders);
            let gone: Vec<OrgId> = senders
                .keys()
                .filter(|o| !wanted.contains_key(o))
                .copied()
                .collect();
            for org_id in gone {
                if let Some(s) = senders.remove(&org_id) {
                    to_stop.push(s);
                }
            }
            for (org_id, urls) in wanted {
                if senders.get(&org_id).map(|s| s.hash()) == Some(targets_hash(&urls)) {
                    continue;
                }
                let sender = Arc::new(ExternalSender::new(
                    org_id,
                    urls,
                    Arc::clone(&self.client),
                    self.metrics.clone(),
                ));
                if let Some(old) = senders.insert(org_id, Arc::clone(&sender)) {
                    to_stop.push(old);
                }
                to_start.push(sender);
            }
        }
        *lock(&self.admin) = admins;

        for sender in to_stop {
            sender.stop().await;
        }
        for sender in to_start {
            sender.start();
            tracing::info!(urls = sender.urls().len(), "External alertmanager sender started");
        }
    }

    /// The tenant's backend, if it exists and has a configuration.
    pub fn alertmanager_for(&self, org_id: OrgId) -> Result<Arc<Alertmanager>> {
        let am = lock(&self.alertmanagers)
            .get(&org_id)
            .cloned()
            .ok_or(NotifyError::NotFound(org_id))?;
        if !am.is_ready() {
            return Err(NotifyError::NotReady(org_id));
        }
        Ok(am)
    }

    /// Alert endpoints of the tenant's running external sender.
    pub fn alertmanagers_for(&self, org_id: OrgId) -> Vec<String> {
        lock(&self.senders)
            .get(&org_id)
            .map(|s| s.urls().iter().map(|u| u.to_string()).collect())
            .unwrap_or_default()
    }

    /// Configured external URLs that could not be parsed.
    pub fn dropped_alertmanagers_for(&self, org_id: OrgId) -> Vec<String> {
        lock(&self.admin)
            .get(&org_id)
            .map(|a| a.dropped.clone())
            .unwrap_or_default()
    }

    pub fn org_ids(&self) -> Vec<OrgId> {
        let mut ids: Vec<OrgId> = lock(&self.alertmanagers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Hands a batch of a tenant's alerts to its local backend and/or its
    /// external sender, as its admin settings choose.
    pub fn send(&self, org_id: OrgId, alerts: Vec<PostableAlert>) -> Result<()> {
        let send_to = lock(&self.admin)
            .get(&org_id)
            .map(|a| a.send_alerts_to)
            .unwrap_or_default();
        let mut delivered = false;
        let mut last_err = None;

        if send_to.internal() {
            match self.alertmanager_for(org_id) {
                Ok(am) => match am.put_alerts(&alerts, Utc::now()) {
                    Ok(()) => delivered = true,
                    Err(e) => last_err = Some(e),
                },
                Err(NotifyError::NotFound(_)) => {}
                Err(e) => last_err = Some(e),
            }
        }
        if send_to.external() {
            let sender = lock(&self.senders).get(&org_id).cloned();
            if let Some(sender) = sender {
                match sender.send(alerts) {
                    Ok(()) => delivered = true,
                    Err(e) => last_err = Some(e),
                }
            }
        }

        if delivered {
            Ok(())
        } else {
            Err(last_err.unwrap_or(NotifyError::NoDestination(org_id)))
        }
    }

    /// Polls storage until `shutdown` fires, then stops everything.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.join_cluster().await;
        let mut tick = tokio::time::interval(self.settings.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Multi-org alertmanager started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.load_and_sync().await,
            }
        }
        self.stop_all().await;
        tracing::info!("Multi-org alertmanager stopped");
    }

    /// Stops every backend and sender.
    pub async fn stop_all(&self) {
        let ams: Vec<Arc<Alertmanager>> = lock(&self.alertmanagers).drain().map(|(_, am)| am).collect();
        let senders: Vec<Arc<ExternalSender>> = lock(&self.senders).drain().map(|(_, s)| s).collect();
        for am in ams {
            am.stop().await;
        }
        for sender in senders {
            sender.stop().await;
        }
        self.cluster.stop().await;
    }
}
