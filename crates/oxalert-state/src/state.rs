use crate::history::History;
use chrono::{DateTime, Utc};
use oxalert_common::labels::Labels;
use oxalert_common::types::RuleKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Externally visible state of an alert instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertState {
    Normal,
    Pending,
    Alerting,
    NoData,
    Error,
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Pending => write!(f, "Pending"),
            Self::Alerting => write!(f, "Alerting"),
            Self::NoData => write!(f, "NoData"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(Self::Normal),
            "Pending" => Ok(Self::Pending),
            "Alerting" => Ok(Self::Alerting),
            "NoData" => Ok(Self::NoData),
            "Error" => Ok(Self::Error),
            _ => Err(format!("unknown alert state: {s}")),
        }
    }
}

/// Why an instance is in its current state, when it is not self-evident.
pub mod reason {
    pub const NO_DATA: &str = "NoData";
    pub const ERROR: &str = "Error";
    pub const MISSING_SERIES: &str = "MissingSeries";
    pub const RULE_DELETED: &str = "RuleDeleted";
}

/// Tracked state of one label set of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub rule_key: RuleKey,
    /// Rule labels merged with the result labels.
    pub labels: Labels,
    pub labels_hash: u64,
    pub state: AlertState,
    #[serde(default)]
    pub reason: String,
    pub state_since: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub last_evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub history: History,
}

impl AlertInstance {
    /// A fresh `Normal` instance first observed at `now`.
    pub fn new(rule_key: RuleKey, labels: Labels, now: DateTime<Utc>) -> Self {
        let labels_hash = oxalert_common::labels::labels_fingerprint(&labels);
        Self {
            rule_key,
            labels,
            labels_hash,
            state: AlertState::Normal,
            reason: String::new(),
            state_since: now,
            starts_at: now,
            ends_at: now,
            last_evaluated_at: now,
            last_sent_at: None,
            error: None,
            values: BTreeMap::new(),
            history: History::new(),
        }
    }

    pub fn is_firing(&self) -> bool {
        self.state == AlertState::Alerting
    }
}
