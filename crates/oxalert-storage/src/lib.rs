//! Storage collaborators of the alerting engine.
//!
//! The scheduler and the notification manager only see the traits defined
//! here. [`memory`] holds in-process implementations used by the binary's
//! seeded rule store and by tests; [`sqlite::SqliteInstanceStore`] keeps
//! alert instances across restarts.

pub mod error;
pub mod memory;
pub mod sqlite;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxalert_common::settings::NotificationSettings;
use oxalert_common::types::{AlertRule, OrgId, RuleKey};
use oxalert_state::state::AlertInstance;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use error::{Result, StorageError};

/// Read access to versioned alert rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_alert_rule_by_key(&self, key: &RuleKey) -> Result<AlertRule>;

    /// Every rule of every tenant not listed in `disabled_orgs`.
    async fn list_alert_rules(&self, disabled_orgs: &HashSet<OrgId>) -> Result<Vec<AlertRule>>;

    /// Number of rules, for one tenant or all of them.
    async fn count(&self, org_id: Option<OrgId>) -> Result<usize>;

    /// Notification settings of all rules of a tenant, duplicates included.
    async fn list_notification_settings(&self, org_id: OrgId) -> Result<Vec<NotificationSettings>>;
}

/// Persistence for alert instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Inserts or replaces the given instances.
    async fn save_instances(&self, instances: &[AlertInstance]) -> Result<()>;

    /// Removes specific label sets of a rule.
    async fn delete_instances(&self, key: &RuleKey, labels_hashes: &[u64]) -> Result<()>;

    /// Removes every instance of a rule.
    async fn delete_rule_instances(&self, key: &RuleKey) -> Result<()>;

    /// Replaces everything stored for `org_id` with `instances`.
    async fn full_sync(&self, org_id: OrgId, instances: &[AlertInstance]) -> Result<()>;

    async fn fetch_org_ids(&self) -> Result<Vec<OrgId>>;

    async fn list_instances(&self, org_id: OrgId) -> Result<Vec<AlertInstance>>;
}

/// Where a tenant's alerts are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendAlertsTo {
    /// Only the tenant's own notification backend.
    Internal,
    /// Only the configured external Alertmanagers.
    External,
    #[default]
    All,
}

impl SendAlertsTo {
    pub fn internal(self) -> bool {
        matches!(self, Self::Internal | Self::All)
    }

    pub fn external(self) -> bool {
        matches!(self, Self::External | Self::All)
    }
}

/// Per-tenant delivery settings managed by administrators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub alertmanagers: Vec<String>,
    #[serde(default)]
    pub send_alerts_to: SendAlertsTo,
}

/// A stored notification backend configuration, kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub org_id: OrgId,
    pub configuration: String,
    pub created_at: DateTime<Utc>,
}

/// Source of per-tenant notification backend configuration.
#[async_trait]
pub trait AlertmanagerConfigStore: Send + Sync {
    /// Tenants that should run a notification backend.
    async fn fetch_org_ids(&self) -> Result<Vec<OrgId>>;

    /// Latest stored configuration, `None` when the tenant never saved one.
    async fn get_latest_config(&self, org_id: OrgId) -> Result<Option<StoredConfig>>;

    /// Admin delivery settings; tenants without any get the default.
    async fn get_admin_config(&self, org_id: OrgId) -> Result<AdminConfig>;
}
