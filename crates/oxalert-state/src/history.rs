use crate::state::AlertState;
use crate::EvalState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of evaluations remembered per instance.
pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub evaluated_at: DateTime<Utc>,
    /// Raw outcome before the no-data / error policies were applied.
    pub result: EvalState,
    /// Instance state after the evaluation.
    pub state: AlertState,
}

/// Bounded ring of recent evaluations, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry` and drops the oldest entries beyond `max_len`.
    pub fn push(&mut self, entry: HistoryEntry, max_len: usize) {
        self.entries.push_back(entry);
        self.trim(max_len);
    }

    pub fn trim(&mut self, max_len: usize) {
        while self.entries.len() > max_len {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> &VecDeque<HistoryEntry> {
        &self.entries
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
