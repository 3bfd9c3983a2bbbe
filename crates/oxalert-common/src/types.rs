use crate::labels::Labels;
use crate::settings::NotificationSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tenant identifier.
pub type OrgId = i64;

/// Identifies a rule within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub org_id: OrgId,
    pub uid: String,
}

impl RuleKey {
    pub fn new(org_id: OrgId, uid: impl Into<String>) -> Self {
        Self {
            org_id,
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for RuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org_id, self.uid)
    }
}

/// State to use when a query returns no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoDataState {
    Alerting,
    #[default]
    NoData,
    #[serde(rename = "OK")]
    Ok,
    KeepLastState,
}

/// State to use when the query fails to execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecErrState {
    Alerting,
    #[default]
    Error,
    #[serde(rename = "OK")]
    Ok,
    KeepLastState,
}

impl std::str::FromStr for NoDataState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Alerting" => Ok(Self::Alerting),
            "NoData" => Ok(Self::NoData),
            "OK" => Ok(Self::Ok),
            "KeepLastState" => Ok(Self::KeepLastState),
            _ => Err(format!("unknown no data state: {s}")),
        }
    }
}

impl std::str::FromStr for ExecErrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Alerting" => Ok(Self::Alerting),
            "Error" => Ok(Self::Error),
            "OK" => Ok(Self::Ok),
            "KeepLastState" => Ok(Self::KeepLastState),
            _ => Err(format!("unknown execution error state: {s}")),
        }
    }
}

/// Query model handed to the evaluator untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Ref ID of the query whose result decides firing.
    pub condition: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Versioned alert rule definition as held by the rule store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub org_id: OrgId,
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub folder_title: String,
    #[serde(default = "default_version")]
    pub version: i64,
    pub interval_seconds: i64,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub no_data_state: NoDataState,
    #[serde(default)]
    pub exec_err_state: ExecErrState,
    #[serde(default, rename = "for", with = "humantime_serde")]
    pub for_duration: Duration,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default)]
    pub notification_settings: Vec<NotificationSettings>,
    #[serde(default)]
    pub is_paused: bool,
}

fn default_version() -> i64 {
    1
}

impl AlertRule {
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.org_id, self.uid.clone())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(0) as u64)
    }
}

/// Handed from the scheduler to a rule's evaluation task once per due tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalContext {
    /// Logical tick time the evaluation is for.
    pub scheduled_at: DateTime<Utc>,
    /// Rule version seen by the scheduler when it dispatched.
    pub rule_version: i64,
}

/// Notification payload sent to local and external backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostableAlert {
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generator_url: String,
}

impl PostableAlert {
    /// An alert is resolved once its end time has passed.
    pub fn is_resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }

    pub fn name(&self) -> &str {
        self.labels
            .get(crate::labels::ALERTNAME_LABEL)
            .map(String::as_str)
            .unwrap_or("")
    }
}
