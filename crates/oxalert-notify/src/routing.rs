//! Routing tree with Alertmanager matching semantics.
//!
//! An alert enters at the root, which always matches. It descends into
//! every child whose matchers all hold, depth first, stopping after the
//! first matching child unless that child sets `continue`. When no child
//! matches, the current node is the match. Children inherit the grouping,
//! timing and receiver options they leave unset.

use oxalert_common::labels::Labels;
use oxalert_common::settings::{default_group_by, GROUP_BY_ALL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

/// A single `name op value` label condition. A missing label reads as "".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    #[serde(rename = "type")]
    pub op: MatchOp,
    pub value: String,
}

impl Matcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let actual = labels.get(&self.name).map(String::as_str).unwrap_or("");
        match self.op {
            MatchOp::Equal => actual == self.value,
            MatchOp::NotEqual => actual != self.value,
        }
    }
}

/// A node of the routing tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute_time_intervals: Vec<String>,
}

/// Effective options of a matched route after inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Position of the node in the tree, e.g. `0/2/1`. Stable for a given config.
    pub id: String,
    pub receiver: String,
    pub group_by: Vec<String>,
    pub group_wait: Duration,
    pub group_interval: Duration,
    pub repeat_interval: Duration,
    pub mute_time_intervals: Vec<String>,
}

impl ResolvedRoute {
    pub fn groups_by_all(&self) -> bool {
        self.group_by.iter().any(|l| l == GROUP_BY_ALL)
    }

    /// Values of the grouping labels of `labels`, which make up the group identity.
    pub fn group_labels(&self, labels: &Labels) -> Labels {
        if self.groups_by_all() {
            return labels.clone();
        }
        self.group_by
            .iter()
            .filter_map(|name| labels.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }
}

impl Route {
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matchers.iter().all(|m| m.matches(labels))
    }

    /// Options of the root with Alertmanager defaults for anything unset.
    fn resolve_root(&self) -> ResolvedRoute {
        ResolvedRoute {
            id: "0".to_string(),
            receiver: self.receiver.clone().unwrap_or_default(),
            group_by: self.group_by.clone().unwrap_or_else(default_group_by),
            group_wait: self.group_wait.unwrap_or(DEFAULT_GROUP_WAIT),
            group_interval: self.group_interval.unwrap_or(DEFAULT_GROUP_INTERVAL),
            repeat_interval: self.repeat_interval.unwrap_or(DEFAULT_REPEAT_INTERVAL),
            mute_time_intervals: self.mute_time_intervals.clone(),
        }
    }

    fn resolve_child(&self, parent: &ResolvedRoute, index: usize) -> ResolvedRoute {
        ResolvedRoute {
            id: format!("{}/{}", parent.id, index),
            receiver: self.receiver.clone().unwrap_or_else(|| parent.receiver.clone()),
            group_by: self.group_by.clone().unwrap_or_else(|| parent.group_by.clone()),
            group_wait: self.group_wait.unwrap_or(parent.group_wait),
            group_interval: self.group_interval.unwrap_or(parent.group_interval),
            repeat_interval: self.repeat_interval.unwrap_or(parent.repeat_interval),
            mute_time_intervals: self.mute_time_intervals.clone(),
        }
    }

    /// Routes `labels` through the tree rooted at `self`.
    pub fn match_labels(&self, labels: &Labels) -> Vec<ResolvedRoute> {
        let root = self.resolve_root();
        let mut out = Vec::new();
        self.descend(&root, labels, &mut out);
        out
    }

    fn descend(&self, resolved: &ResolvedRoute, labels: &Labels, out: &mut Vec<ResolvedRoute>) {
        let before = out.len();
        for (i, child) in self.routes.iter().enumerate() {
            if !child.matches(labels) {
                continue;
            }
            let child_resolved = child.resolve_child(resolved, i);
            child.descend(&child_resolved, labels, out);
            if !child.continue_matching {
                break;
            }
        }
        if out.len() == before {
            out.push(resolved.clone());
        }
    }

    /// Receiver names referenced anywhere in the tree.
    pub fn receivers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_receivers(&mut out);
        out
    }

    fn collect_receivers<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Some(r) = &self.receiver {
            out.push(r.as_str());
        }
        for child in &self.routes {
            child.collect_receivers(out);
        }
    }
}
