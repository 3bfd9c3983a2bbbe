use oxalert_common::types::{AlertRule, OrgId};
use oxalert_notify::cluster::ClusterSettings;
use oxalert_notify::manager::NotifierSettings;
use oxalert_storage::AdminConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Extra `tracing` directive level applied to the `oxalert` crates.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port of the Prometheus `/metrics` endpoint.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Rules seed loaded into the rule store at startup.
    #[serde(default)]
    pub rules_seed: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    /// Rule intervals below this are raised to it.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Evaluation attempts per cycle before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub disabled_orgs: Vec<OrgId>,
    #[serde(default = "default_resend_delay_secs")]
    pub resend_delay_secs: u64,
    #[serde(default = "default_max_state_history")]
    pub max_state_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Base URL of the query evaluation service.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_evaluator_timeout_secs")]
    pub timeout_secs: u64,
}

// ---- Rules seed file types (used by `init-rules` and at startup) ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesSeedFile {
    #[serde(default)]
    pub rules: Vec<AlertRule>,
    #[serde(default)]
    pub alertmanager_configs: Vec<SeedAlertmanagerConfig>,
    #[serde(default)]
    pub admin_configs: Vec<SeedAdminConfig>,
}

/// Notification backend configuration of one tenant, as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAlertmanagerConfig {
    pub org_id: OrgId,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAdminConfig {
    pub org_id: OrgId,
    #[serde(flatten)]
    pub admin: AdminConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    9464
}

fn default_base_interval_secs() -> u64 {
    10
}

fn default_min_interval_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_resend_delay_secs() -> u64 {
    60
}

fn default_max_state_history() -> usize {
    100
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_peer_timeout_secs() -> u64 {
    15
}

fn default_join_timeout_secs() -> u64 {
    5
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_evaluator_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            max_attempts: default_max_attempts(),
            disabled_orgs: Vec::new(),
            resend_delay_secs: default_resend_delay_secs(),
            max_state_history: default_max_state_history(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            flush_interval_ms: default_flush_interval_ms(),
            peers: Vec::new(),
            advertise_address: None,
            peer_timeout_secs: default_peer_timeout_secs(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_evaluator_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http_port: default_http_port(),
            rules_seed: None,
            scheduler: SchedulerConfig::default(),
            notifier: NotifierConfig::default(),
            storage: StorageConfig::default(),
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scheduler;
        if s.base_interval_secs == 0 {
            anyhow::bail!("scheduler.base_interval_secs must be greater than zero");
        }
        if s.min_interval_secs == 0 {
            anyhow::bail!("scheduler.min_interval_secs must be greater than zero");
        }
        if s.max_attempts == 0 {
            anyhow::bail!("scheduler.max_attempts must be at least 1");
        }
        if s.min_interval_secs % s.base_interval_secs != 0 {
            tracing::warn!(
                min_interval_secs = s.min_interval_secs,
                base_interval_secs = s.base_interval_secs,
                "scheduler.min_interval_secs is not a multiple of the base interval"
            );
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn disabled_orgs(&self) -> HashSet<OrgId> {
        self.disabled_orgs.iter().copied().collect()
    }
}

impl NotifierConfig {
    pub fn to_settings(&self) -> NotifierSettings {
        NotifierSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            cluster: ClusterSettings {
                peers: self.peers.clone(),
                advertise_address: self.advertise_address.clone(),
                peer_timeout: Duration::from_secs(self.peer_timeout_secs),
                join_timeout: Duration::from_secs(self.join_timeout_secs),
            },
        }
    }
}
