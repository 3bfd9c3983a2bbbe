use crate::config::{RulesSeedFile, SchedulerConfig};
use oxalert_common::types::RuleKey;
use oxalert_storage::memory::{MemoryConfigStore, MemoryRuleStore};
use std::collections::{BTreeSet, HashSet};

/// Reads and parses a rules seed file.
pub fn read_seed_file(seed_path: &str) -> anyhow::Result<RulesSeedFile> {
    let seed_content = std::fs::read_to_string(seed_path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", seed_path, e))?;
    let seed: RulesSeedFile = serde_json::from_str(&seed_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", seed_path, e))?;
    Ok(seed)
}

/// Counts produced by [`check_seed`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub accepted: usize,
    pub skipped: usize,
    /// Rules that load but will never be scheduled at this base interval.
    pub unschedulable: usize,
}

/// Drops rules that cannot be stored and reports rules the scheduler will
/// skip. The seed is left with the accepted rules only.
pub fn check_seed(seed: &mut RulesSeedFile, scheduler: &SchedulerConfig) -> SeedReport {
    let mut report = SeedReport::default();
    let mut seen: HashSet<RuleKey> = HashSet::new();

    seed.rules.retain(|rule| {
        if rule.uid.trim().is_empty() {
            tracing::warn!(title = %rule.title, "Alert rule without uid, skipping");
            report.skipped += 1;
            return false;
        }
        if rule.interval_seconds <= 0 {
            tracing::warn!(rule_uid = %rule.uid, org_id = rule.org_id, "Alert rule interval must be positive, skipping");
            report.skipped += 1;
            return false;
        }
        if !seen.insert(rule.key()) {
            tracing::warn!(rule_uid = %rule.uid, org_id = rule.org_id, "Duplicate alert rule, skipping");
            report.skipped += 1;
            return false;
        }

        let base = scheduler.base_interval_secs.max(1);
        let interval = (rule.interval_seconds as u64).max(scheduler.min_interval_secs);
        if interval % base != 0 {
            tracing::warn!(
                rule_uid = %rule.uid,
                org_id = rule.org_id,
                interval_seconds = interval,
                base_interval_secs = base,
                "Alert rule interval is not a multiple of the base interval and will not be scheduled"
            );
            report.unschedulable += 1;
        }
        report.accepted += 1;
        true
    });

    report
}

/// Loads a checked seed into the in-memory stores. Every tenant that owns
/// a rule or a configuration becomes an active tenant.
pub fn apply_seed(seed: RulesSeedFile, rules: &MemoryRuleStore, configs: &MemoryConfigStore) {
    let mut orgs: BTreeSet<_> = seed.rules.iter().map(|r| r.org_id).collect();

    for rule in seed.rules {
        tracing::debug!(rule_uid = %rule.uid, org_id = rule.org_id, "Loaded alert rule");
        rules.insert(rule);
    }
    for am in seed.alertmanager_configs {
        orgs.insert(am.org_id);
        configs.save_config(am.org_id, am.config.to_string());
    }
    for admin in seed.admin_configs {
        orgs.insert(admin.org_id);
        configs.set_admin_config(admin.org_id, admin.admin);
    }
    for org_id in &orgs {
        configs.add_org(*org_id);
    }
    tracing::info!(orgs = orgs.len(), "Rules seed applied");
}
