use crate::engine::{next_state, resolve_missing, Transition};
use crate::history::DEFAULT_MAX_HISTORY;
use crate::state::AlertInstance;
use crate::EvalResult;
use chrono::{DateTime, Utc};
use oxalert_common::chrono_duration;
use oxalert_common::labels::labels_fingerprint;
use oxalert_common::types::{AlertRule, OrgId, RuleKey};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// label hash -> instance
type RuleStates = HashMap<u64, AlertInstance>;

/// What one evaluation cycle produced for a rule.
#[derive(Debug, Default)]
pub struct EvalOutcome {
    pub transitions: Vec<Transition>,
    /// Instances to hand to the notification backends this cycle.
    pub to_notify: Vec<AlertInstance>,
    /// Every instance the rule still has after the cycle.
    pub current: Vec<AlertInstance>,
    /// Instances dropped because their series disappeared.
    pub removed: Vec<AlertInstance>,
}

/// Cache of alert instances for every rule.
///
/// The cache lock is held only to copy a rule's instances out and to write
/// them back; the transition work runs on the private copy.
pub struct StateManager {
    cache: Mutex<HashMap<RuleKey, RuleStates>>,
    max_history: usize,
    resend_delay: Duration,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY, Duration::from_secs(60))
    }
}

impl StateManager {
    pub fn new(max_history: usize, resend_delay: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            max_history,
            resend_delay,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RuleKey, RuleStates>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds the cache with persisted instances. Existing entries win.
    pub fn warm(&self, instances: Vec<AlertInstance>) -> usize {
        let mut cache = self.lock();
        let mut loaded = 0;
        for mut inst in instances {
            inst.labels_hash = labels_fingerprint(&inst.labels);
            inst.history.trim(self.max_history);
            let states = cache.entry(inst.rule_key.clone()).or_default();
            if let std::collections::hash_map::Entry::Vacant(e) = states.entry(inst.labels_hash) {
                e.insert(inst);
                loaded += 1;
            }
        }
        tracing::info!(loaded, "Alert state cache warmed");
        loaded
    }

    /// Applies one evaluation cycle of `rule` at logical time `now`.
    pub fn process_eval_results(
        &self,
        rule: &AlertRule,
        results: Vec<EvalResult>,
        now: DateTime<Utc>,
    ) -> EvalOutcome {
        let key = rule.key();
        let mut states = self.lock().get(&key).cloned().unwrap_or_default();

        let results = if results.is_empty() {
            vec![EvalResult::no_data()]
        } else {
            results
        };

        let mut outcome = EvalOutcome::default();
        let mut seen = HashSet::with_capacity(results.len());

        for result in &results {
            let labels = crate::engine::instance_labels(rule, &result.labels);
            let hash = labels_fingerprint(&labels);
            if !seen.insert(hash) {
                tracing::warn!(
                    rule_uid = %rule.uid,
                    org_id = rule.org_id,
                    "Duplicate label set in evaluation results, ignoring"
                );
                continue;
            }
            let transition = next_state(states.get(&hash), rule, result, now, self.max_history);
            states.insert(hash, transition.instance.clone());
            outcome.transitions.push(transition);
        }

        let stale_after = chrono_duration(rule.interval()) * 2;
        let stale: Vec<u64> = states
            .iter()
            .filter(|(hash, inst)| !seen.contains(*hash) && now - inst.last_evaluated_at > stale_after)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            if let Some(inst) = states.remove(&hash) {
                if inst.is_firing() {
                    outcome.transitions.push(resolve_missing(&inst, now));
                }
                outcome.removed.push(inst);
            }
        }

        // A firing alert is re-sent before its last heartbeat can lapse at the backend.
        let resend = chrono_duration(self.resend_delay.min(rule.interval()));
        for transition in &outcome.transitions {
            let inst = &transition.instance;
            let due_resend = inst.last_sent_at.map_or(true, |sent| now - sent >= resend);
            let notify = transition.is_resolved() || (inst.is_firing() && (transition.changed || due_resend));
            if !notify {
                continue;
            }
            let mut sent = inst.clone();
            sent.last_sent_at = Some(now);
            if let Some(cached) = states.get_mut(&inst.labels_hash) {
                cached.last_sent_at = Some(now);
            }
            outcome.to_notify.push(sent);
        }

        outcome.current = states.values().cloned().collect();
        outcome.current.sort_by_key(|i| i.labels_hash);

        self.lock().insert(key, states);
        outcome
    }

    /// All instances of one rule.
    pub fn get_states(&self, key: &RuleKey) -> Vec<AlertInstance> {
        self.lock()
            .get(key)
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every instance of a deleted rule and returns them.
    pub fn delete_rule(&self, key: &RuleKey) -> Vec<AlertInstance> {
        self.lock()
            .remove(key)
            .map(|states| states.into_values().collect())
            .unwrap_or_default()
    }

    /// Copy of the whole cache grouped by tenant, for the shutdown flush.
    pub fn snapshot(&self) -> HashMap<OrgId, Vec<AlertInstance>> {
        let cache = self.lock();
        let mut by_org: HashMap<OrgId, Vec<AlertInstance>> = HashMap::new();
        for (key, states) in cache.iter() {
            by_org
                .entry(key.org_id)
                .or_default()
                .extend(states.values().cloned());
        }
        by_org
    }

    pub fn rule_count(&self) -> usize {
        self.lock().len()
    }
}
