//! Alert state engine.
//!
//! Evaluation results for a rule are folded into per-label-set
//! [`state::AlertInstance`]s by the pure transition function in
//! [`engine`]. The [`manager::StateManager`] keeps the instances of every
//! rule between evaluations and decides which of them must be notified.

pub mod alerts;
pub mod engine;
pub mod error;
pub mod history;
pub mod manager;
pub mod state;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxalert_common::labels::Labels;
use oxalert_common::types::Condition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of the condition for one label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalState {
    Normal,
    Alerting,
    NoData,
    Error,
}

/// One per-label-set result returned by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    #[serde(default)]
    pub labels: Labels,
    pub state: EvalState,
    /// Execution error text when `state` is [`EvalState::Error`].
    #[serde(default)]
    pub error: Option<String>,
    /// Query values keyed by ref ID, kept for display.
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl EvalResult {
    pub fn new(labels: Labels, state: EvalState) -> Self {
        Self {
            labels,
            state,
            error: None,
            values: BTreeMap::new(),
        }
    }

    /// Result used when the evaluator returns nothing at all.
    pub fn no_data() -> Self {
        Self::new(Labels::new(), EvalState::NoData)
    }
}

/// The query backend that turns a rule's condition into results.
///
/// Implementations must be side-effect free from the scheduler's point of
/// view: the same call may be retried within one evaluation cycle.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluates `condition` as of `at`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend could not be reached or the query
    /// could not be executed at all. Per-series failures are reported as
    /// results with [`EvalState::Error`] instead.
    async fn evaluate(
        &self,
        condition: &Condition,
        at: DateTime<Utc>,
    ) -> error::Result<Vec<EvalResult>>;
}
