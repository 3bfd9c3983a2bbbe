//! Condition evaluation against a remote query service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxalert_common::types::Condition;
use oxalert_state::error::{EvalError, Result};
use oxalert_state::{EvalResult, Evaluator};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Path conditions are posted to, relative to the service base URL.
pub const EVAL_PATH: &str = "api/v1/eval";

#[derive(Serialize)]
struct EvalRequest<'a> {
    condition: &'a Condition,
    at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct EvalResponse {
    #[serde(default)]
    results: Vec<EvalResult>,
}

/// [`Evaluator`] that posts the condition and evaluation time as JSON and
/// reads back `{"results": [...]}`.
pub struct HttpEvaluator {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpEvaluator {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}/{}", base_url.trim_end_matches('/'), EVAL_PATH);
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_err(&self, e: reqwest::Error) -> EvalError {
        if e.is_timeout() {
            EvalError::Timeout(self.timeout.as_secs())
        } else if e.is_decode() {
            EvalError::UnexpectedResponse(e.to_string())
        } else {
            EvalError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, condition: &Condition, at: DateTime<Utc>) -> Result<Vec<EvalResult>> {
        if condition.condition.is_empty() {
            return Err(EvalError::InvalidCondition(
                "condition ref ID is empty".to_string(),
            ));
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&EvalRequest { condition, at })
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = resp.text().await.unwrap_or_default();
            return Err(EvalError::InvalidCondition(body));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EvalError::Unavailable(format!("status {status}: {body}")));
        }

        let body: EvalResponse = resp.json().await.map_err(|e| self.map_err(e))?;
        Ok(body.results)
    }
}
