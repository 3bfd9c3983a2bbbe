use crate::history::HistoryEntry;
use crate::state::{reason, AlertInstance, AlertState};
use crate::{EvalResult, EvalState};
use chrono::{DateTime, Utc};
use oxalert_common::chrono_duration;
use oxalert_common::labels::{labels_fingerprint, Labels};
use oxalert_common::types::{AlertRule, ExecErrState, NoDataState};

/// Result of folding one evaluation result into an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub instance: AlertInstance,
    /// State before this evaluation; `None` for a label set seen for the first time.
    pub previous: Option<AlertState>,
    /// Whether the externally visible state changed.
    pub changed: bool,
}

impl Transition {
    /// The instance stopped firing in this evaluation.
    pub fn is_resolved(&self) -> bool {
        self.previous == Some(AlertState::Alerting) && self.instance.state != AlertState::Alerting
    }
}

/// What the result asks for once the rule's policies have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Normal(&'static str),
    Alerting(&'static str),
    NoData,
    Error,
    KeepLastState,
}

fn target_for(rule: &AlertRule, result: &EvalResult) -> Target {
    match result.state {
        EvalState::Normal => Target::Normal(""),
        EvalState::Alerting => Target::Alerting(""),
        EvalState::NoData => match rule.no_data_state {
            NoDataState::Alerting => Target::Alerting(reason::NO_DATA),
            NoDataState::NoData => Target::NoData,
            NoDataState::Ok => Target::Normal(reason::NO_DATA),
            NoDataState::KeepLastState => Target::KeepLastState,
        },
        EvalState::Error => match rule.exec_err_state {
            ExecErrState::Alerting => Target::Alerting(reason::ERROR),
            ExecErrState::Error => Target::Error,
            ExecErrState::Ok => Target::Normal(reason::ERROR),
            ExecErrState::KeepLastState => Target::KeepLastState,
        },
    }
}

/// Labels of the instance a result belongs to. Rule labels win on conflict.
pub fn instance_labels(rule: &AlertRule, result_labels: &Labels) -> Labels {
    let mut labels = result_labels.clone();
    for (k, v) in &rule.labels {
        labels.insert(k.clone(), v.clone());
    }
    labels
}

/// Heartbeat end time for a firing instance.
fn heartbeat(rule: &AlertRule, now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono_duration(rule.interval()) * 2
}

fn enter_alerting(inst: &mut AlertInstance, rule: &AlertRule, why: &str, now: DateTime<Utc>) {
    inst.state = AlertState::Alerting;
    inst.state_since = now;
    inst.starts_at = now;
    inst.ends_at = heartbeat(rule, now);
    inst.reason = why.to_string();
}

fn to_alerting(inst: &mut AlertInstance, rule: &AlertRule, why: &str, now: DateTime<Utc>) {
    match inst.state {
        AlertState::Alerting => {
            inst.ends_at = heartbeat(rule, now);
            inst.reason = why.to_string();
        }
        AlertState::Pending => {
            if now - inst.state_since >= chrono_duration(rule.for_duration) {
                enter_alerting(inst, rule, why, now);
            } else {
                inst.reason = why.to_string();
            }
        }
        AlertState::Normal | AlertState::NoData | AlertState::Error => {
            if rule.for_duration.is_zero() {
                enter_alerting(inst, rule, why, now);
            } else {
                inst.state = AlertState::Pending;
                inst.state_since = now;
                inst.reason = why.to_string();
            }
        }
    }
}

fn to_state(inst: &mut AlertInstance, state: AlertState, why: &str, now: DateTime<Utc>) {
    if inst.state != state {
        let left_alerting = inst.state == AlertState::Alerting;
        inst.state = state;
        inst.state_since = now;
        inst.ends_at = now;
        // Leaving Alerting resolves the episode, which keeps its start.
        if state != AlertState::Normal && !left_alerting {
            inst.starts_at = now;
        }
    }
    inst.reason = why.to_string();
}

/// Folds `result` into the previous instance of its label set.
///
/// Pure: `prev` is never modified, the updated instance is returned inside
/// the [`Transition`].
pub fn next_state(
    prev: Option<&AlertInstance>,
    rule: &AlertRule,
    result: &EvalResult,
    now: DateTime<Utc>,
    max_history: usize,
) -> Transition {
    let labels = instance_labels(rule, &result.labels);
    let mut inst = match prev {
        Some(p) => p.clone(),
        None => AlertInstance::new(rule.key(), labels, now),
    };
    debug_assert_eq!(inst.labels_hash, labels_fingerprint(&inst.labels));

    let previous = prev.map(|p| p.state);
    inst.last_evaluated_at = now;
    inst.values = result.values.clone();
    inst.error = match result.state {
        EvalState::Error => result.error.clone(),
        _ => None,
    };

    match target_for(rule, result) {
        Target::KeepLastState => {
            if inst.state == AlertState::Alerting {
                inst.ends_at = heartbeat(rule, now);
            }
        }
        Target::Normal(why) => to_state(&mut inst, AlertState::Normal, why, now),
        Target::Alerting(why) => to_alerting(&mut inst, rule, why, now),
        Target::NoData => to_state(&mut inst, AlertState::NoData, "", now),
        Target::Error => to_state(&mut inst, AlertState::Error, "", now),
    }

    inst.history.push(
        HistoryEntry {
            evaluated_at: now,
            result: result.state,
            state: inst.state,
        },
        max_history,
    );

    let changed = match previous {
        Some(p) => p != inst.state,
        None => inst.state != AlertState::Normal,
    };

    Transition {
        instance: inst,
        previous,
        changed,
    }
}

/// Resolves an instance whose series stopped being reported.
pub fn resolve_missing(prev: &AlertInstance, now: DateTime<Utc>) -> Transition {
    resolve(prev, reason::MISSING_SERIES, now)
}

/// Moves an instance to `Normal` outside of an evaluation, e.g. because
/// its rule was deleted.
pub fn resolve(prev: &AlertInstance, why: &str, now: DateTime<Utc>) -> Transition {
    let mut inst = prev.clone();
    to_state(&mut inst, AlertState::Normal, why, now);
    Transition {
        previous: Some(prev.state),
        changed: prev.state != AlertState::Normal,
        instance: inst,
    }
}
