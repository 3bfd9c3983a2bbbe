//! Forwarding of alerts to external Alertmanagers.

use crate::error::{NotifyError, Result};
use crate::metrics::NotifyMetrics;
use async_trait::async_trait;
use oxalert_common::types::{OrgId, PostableAlert};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use xxhash_rust::xxh3::Xxh3;

/// Maximum number of batches waiting to be posted per sender.
const QUEUE_CAPACITY: usize = 1024;

/// Path alert batches are posted to, relative to the Alertmanager base URL.
pub const ALERTS_PATH: &str = "api/v2/alerts";

/// Transport that posts one batch to one Alertmanager.
#[async_trait]
pub trait AlertsClient: Send + Sync {
    async fn post_alerts(&self, url: &Url, alerts: &[PostableAlert]) -> Result<()>;
}

/// [`AlertsClient`] over HTTP.
pub struct HttpAlertsClient {
    client: reqwest::Client,
}

impl HttpAlertsClient {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlertsClient for HttpAlertsClient {
    async fn post_alerts(&self, url: &Url, alerts: &[PostableAlert]) -> Result<()> {
        let resp = self.client.post(url.clone()).json(alerts).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(NotifyError::ApiError {
            service: url.to_string(),
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

/// Splits configured Alertmanager URLs into usable alert endpoints and the
/// raw strings that could not be parsed.
pub fn parse_alertmanager_urls(raw: &[String]) -> (Vec<Url>, Vec<String>) {
    let mut valid = Vec::new();
    let mut dropped = Vec::new();
    for s in raw {
        match alerts_endpoint(s) {
            Ok(url) => valid.push(url),
            Err(e) => {
                tracing::warn!(url = %s, error = %e, "Dropping invalid Alertmanager URL");
                dropped.push(s.clone());
            }
        }
    }
    valid.sort();
    valid.dedup();
    (valid, dropped)
}

fn alerts_endpoint(raw: &str) -> std::result::Result<Url, url::ParseError> {
    let mut base = Url::parse(raw)?;
    if base.cannot_be_a_base() {
        return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(ALERTS_PATH)
}

/// Hash of a target list; equal lists hash equally regardless of order.
pub fn targets_hash(urls: &[Url]) -> u64 {
    let mut sorted: Vec<&str> = urls.iter().map(Url::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Xxh3::new();
    for u in sorted {
        hasher.update(u.as_bytes());
        hasher.update(&[0xff]);
    }
    hasher.digest()
}

/// Queues alert batches of one tenant and posts each to every target.
pub struct ExternalSender {
    org_id: OrgId,
    urls: Vec<Url>,
    hash: u64,
    tx: mpsc::Sender<Vec<PostableAlert>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<PostableAlert>>>>,
    client: Arc<dyn AlertsClient>,
    metrics: NotifyMetrics,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalSender {
    pub fn new(
        org_id: OrgId,
        urls: Vec<Url>,
        client: Arc<dyn AlertsClient>,
        metrics: NotifyMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let hash = targets_hash(&urls);
        Self {
            org_id,
            urls,
            hash,
            tx,
            rx: Mutex::new(Some(rx)),
            client,
            metrics,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Queues one batch. A full queue drops the batch.
    pub fn send(&self, alerts: Vec<PostableAlert>) -> Result<()> {
        if alerts.is_empty() {
            return Ok(());
        }
        self.tx.try_send(alerts).map_err(|e| {
            NotifyError::Other(format!("external sender queue for org {}: {e}", self.org_id))
        })
    }

    /// Spawns the posting loop. Calling it twice has no effect.
    pub fn start(&self) {
        let Some(mut rx) = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return;
        };
        let org_id = self.org_id;
        let urls = self.urls.clone();
        let client = Arc::clone(&self.client);
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = rx.recv() => match batch {
                        Some(b) => b,
                        None => break,
                    },
                };
                for url in &urls {
                    match client.post_alerts(url, &batch).await {
                        Ok(()) => {
                            metrics.external_batches.with_label_values(&["success"]).inc();
                            tracing::debug!(org_id, url = %url, alerts = batch.len(), "Sent alerts to external Alertmanager");
                        }
                        Err(e) => {
                            metrics.external_batches.with_label_values(&["failure"]).inc();
                            tracing::error!(org_id, url = %url, error = %e, "Failed to send alerts to external Alertmanager");
                        }
                    }
                }
            }
        });
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(org_id = self.org_id, error = %e, "External sender task panicked");
            }
        }
    }
}
