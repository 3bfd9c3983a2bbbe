use crate::error::{Result, StorageError};
use crate::{AdminConfig, AlertmanagerConfigStore, InstanceStore, RuleStore, StoredConfig};
use async_trait::async_trait;
use chrono::Utc;
use oxalert_common::settings::NotificationSettings;
use oxalert_common::types::{AlertRule, OrgId, RuleKey};
use oxalert_state::state::AlertInstance;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rule store backed by a map, filled from a seed file or by tests.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<BTreeMap<RuleKey, AlertRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let store = Self::new();
        for rule in rules {
            store.insert(rule);
        }
        store
    }

    /// Stores `rule` as given, replacing any rule with the same key.
    pub fn insert(&self, rule: AlertRule) {
        write(&self.rules).insert(rule.key(), rule);
    }

    /// Applies `f` to a stored rule and bumps its version.
    pub fn update(&self, key: &RuleKey, f: impl FnOnce(&mut AlertRule)) -> Result<i64> {
        let mut rules = write(&self.rules);
        let rule = rules.get_mut(key).ok_or_else(|| StorageError::NotFound {
            entity: "alert_rule",
            id: key.to_string(),
        })?;
        f(rule);
        rule.version += 1;
        Ok(rule.version)
    }

    pub fn delete(&self, key: &RuleKey) -> Option<AlertRule> {
        write(&self.rules).remove(key)
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get_alert_rule_by_key(&self, key: &RuleKey) -> Result<AlertRule> {
        read(&self.rules)
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                entity: "alert_rule",
                id: key.to_string(),
            })
    }

    async fn list_alert_rules(&self, disabled_orgs: &HashSet<OrgId>) -> Result<Vec<AlertRule>> {
        Ok(read(&self.rules)
            .values()
            .filter(|r| !disabled_orgs.contains(&r.org_id))
            .cloned()
            .collect())
    }

    async fn count(&self, org_id: Option<OrgId>) -> Result<usize> {
        let rules = read(&self.rules);
        Ok(match org_id {
            Some(org) => rules.keys().filter(|k| k.org_id == org).count(),
            None => rules.len(),
        })
    }

    async fn list_notification_settings(&self, org_id: OrgId) -> Result<Vec<NotificationSettings>> {
        Ok(read(&self.rules)
            .values()
            .filter(|r| r.org_id == org_id)
            .flat_map(|r| r.notification_settings.iter().cloned())
            .collect())
    }
}

/// Instance store kept in process memory.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<RuleKey, HashMap<u64, AlertInstance>>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances across all rules.
    pub fn len(&self) -> usize {
        read(&self.instances).values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &RuleKey) -> Vec<AlertInstance> {
        read(&self.instances)
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn save_instances(&self, instances: &[AlertInstance]) -> Result<()> {
        let mut map = write(&self.instances);
        for inst in instances {
            map.entry(inst.rule_key.clone())
                .or_default()
                .insert(inst.labels_hash, inst.clone());
        }
        Ok(())
    }

    async fn delete_instances(&self, key: &RuleKey, labels_hashes: &[u64]) -> Result<()> {
        let mut map = write(&self.instances);
        if let Some(states) = map.get_mut(key) {
            for hash in labels_hashes {
                states.remove(hash);
            }
            if states.is_empty() {
                map.remove(key);
            }
        }
        Ok(())
    }

    async fn delete_rule_instances(&self, key: &RuleKey) -> Result<()> {
        write(&self.instances).remove(key);
        Ok(())
    }

    async fn full_sync(&self, org_id: OrgId, instances: &[AlertInstance]) -> Result<()> {
        let mut map = write(&self.instances);
        map.retain(|key, _| key.org_id != org_id);
        for inst in instances.iter().filter(|i| i.rule_key.org_id == org_id) {
            map.entry(inst.rule_key.clone())
                .or_default()
                .insert(inst.labels_hash, inst.clone());
        }
        Ok(())
    }

    async fn fetch_org_ids(&self) -> Result<Vec<OrgId>> {
        let orgs: BTreeSet<OrgId> = read(&self.instances).keys().map(|k| k.org_id).collect();
        Ok(orgs.into_iter().collect())
    }

    async fn list_instances(&self, org_id: OrgId) -> Result<Vec<AlertInstance>> {
        Ok(read(&self.instances)
            .iter()
            .filter(|(key, _)| key.org_id == org_id)
            .flat_map(|(_, states)| states.values().cloned())
            .collect())
    }
}

/// Notification backend configuration held in memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    orgs: RwLock<BTreeSet<OrgId>>,
    configs: RwLock<HashMap<OrgId, StoredConfig>>,
    admin: RwLock<HashMap<OrgId, AdminConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orgs(orgs: impl IntoIterator<Item = OrgId>) -> Self {
        let store = Self::new();
        write(&store.orgs).extend(orgs);
        store
    }

    pub fn add_org(&self, org_id: OrgId) {
        write(&self.orgs).insert(org_id);
    }

    pub fn remove_org(&self, org_id: OrgId) {
        write(&self.orgs).remove(&org_id);
        write(&self.configs).remove(&org_id);
        write(&self.admin).remove(&org_id);
    }

    /// Stores a new configuration version for a tenant.
    pub fn save_config(&self, org_id: OrgId, configuration: impl Into<String>) {
        self.add_org(org_id);
        write(&self.configs).insert(
            org_id,
            StoredConfig {
                org_id,
                configuration: configuration.into(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn set_admin_config(&self, org_id: OrgId, admin: AdminConfig) {
        write(&self.admin).insert(org_id, admin);
    }
}

#[async_trait]
impl AlertmanagerConfigStore for MemoryConfigStore {
    async fn fetch_org_ids(&self) -> Result<Vec<OrgId>> {
        Ok(read(&self.orgs).iter().copied().collect())
    }

    async fn get_latest_config(&self, org_id: OrgId) -> Result<Option<StoredConfig>> {
        Ok(read(&self.configs).get(&org_id).cloned())
    }

    async fn get_admin_config(&self, org_id: OrgId) -> Result<AdminConfig> {
        Ok(read(&self.admin).get(&org_id).cloned().unwrap_or_default())
    }
}
