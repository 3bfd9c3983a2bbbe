use crate::error::{NotifyError, Result};
use crate::mute::MuteTimeInterval;
use crate::routing::Route;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64;

/// Name of the receiver every tenant gets when it has no stored config.
pub const DEFAULT_RECEIVER: &str = "default";

/// One delivery integration of a receiver, e.g. a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    /// Plugin name in the channel registry.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    pub name: String,
    #[serde(default)]
    pub integrations: Vec<Integration>,
}

/// Per-tenant notification backend configuration, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertmanagerConfig {
    pub route: Route,
    #[serde(default)]
    pub receivers: Vec<Receiver>,
    #[serde(default)]
    pub mute_time_intervals: Vec<MuteTimeInterval>,
}

impl Default for AlertmanagerConfig {
    /// A single receiver that writes notifications to the log.
    fn default() -> Self {
        Self {
            route: Route {
                receiver: Some(DEFAULT_RECEIVER.to_string()),
                ..Default::default()
            },
            receivers: vec![Receiver {
                name: DEFAULT_RECEIVER.to_string(),
                integrations: vec![Integration {
                    kind: "log".to_string(),
                    settings: Value::Object(Default::default()),
                }],
            }],
            mute_time_intervals: Vec::new(),
        }
    }
}

impl AlertmanagerConfig {
    /// Parses and validates a stored configuration.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the root has a receiver and that every name the tree
    /// references is defined.
    pub fn validate(&self) -> Result<()> {
        if self.route.receiver.is_none() {
            return Err(NotifyError::InvalidConfig(
                "root route must name a receiver".to_string(),
            ));
        }
        let receivers: HashSet<&str> = self.receivers.iter().map(|r| r.name.as_str()).collect();
        if receivers.len() != self.receivers.len() {
            return Err(NotifyError::InvalidConfig(
                "duplicate receiver names".to_string(),
            ));
        }
        for name in self.route.receivers() {
            if !receivers.contains(name) {
                return Err(NotifyError::InvalidConfig(format!(
                    "route references undefined receiver '{name}'"
                )));
            }
        }
        Ok(())
    }

    pub fn receiver_names(&self) -> Vec<String> {
        self.receivers.iter().map(|r| r.name.clone()).collect()
    }

    pub fn mute_time_interval(&self, name: &str) -> Option<&MuteTimeInterval> {
        self.mute_time_intervals.iter().find(|m| m.name == name)
    }

    /// xxh3 over the serialized config; any change yields a new hash.
    pub fn hash(&self) -> Result<u64> {
        Ok(xxh3_64(&serde_json::to_vec(self)?))
    }
}
