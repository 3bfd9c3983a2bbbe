use crate::error::{NotifyError, Result};
use crate::plugin::ChannelPlugin;
use crate::{Notification, NotificationChannel};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

/// POSTs the notification as JSON to a fixed URL.
pub struct WebhookChannel {
    receiver: String,
    url: url::Url,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(receiver: &str, url: url::Url) -> Self {
        Self {
            receiver: receiver.to_string(),
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self
                .client
                .post(self.url.clone())
                .json(notification)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    tracing::warn!(
                        attempt = attempt + 1,
                        status,
                        "Webhook returned non-success status, retrying"
                    );
                    last_err = Some(NotifyError::ApiError {
                        service: self.url.to_string(),
                        status,
                        body,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Webhook send failed, retrying");
                    last_err = Some(e.into());
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| NotifyError::Other("webhook delivery failed".to_string())))
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn receiver(&self) -> &str {
        &self.receiver
    }
}

// Plugin

#[derive(Deserialize)]
struct WebhookConfig {
    url: String,
}

fn parse_config(config: &Value) -> Result<url::Url> {
    let cfg: WebhookConfig = serde_json::from_value(config.clone())
        .map_err(|e| NotifyError::InvalidConfig(format!("invalid webhook config: {e}")))?;
    url::Url::parse(&cfg.url)
        .map_err(|e| NotifyError::InvalidConfig(format!("invalid webhook url '{}': {e}", cfg.url)))
}

pub struct WebhookPlugin;

impl ChannelPlugin for WebhookPlugin {
    fn name(&self) -> &str {
        "webhook"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        parse_config(config).map(|_| ())
    }

    fn create_channel(&self, receiver: &str, config: &Value) -> Result<Arc<dyn NotificationChannel>> {
        Ok(Arc::new(WebhookChannel::new(receiver, parse_config(config)?)))
    }
}
