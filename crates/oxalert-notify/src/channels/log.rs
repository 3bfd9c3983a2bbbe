use crate::error::Result;
use crate::plugin::ChannelPlugin;
use crate::{Notification, NotificationChannel};
use async_trait::async_trait;
use oxalert_common::labels::format_labels;
use serde_json::Value;
use std::sync::Arc;

/// Writes each notification as a structured log line.
pub struct LogChannel {
    receiver: String,
}

impl LogChannel {
    pub fn new(receiver: &str) -> Self {
        Self {
            receiver: receiver.to_string(),
        }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            org_id = notification.org_id,
            receiver = %self.receiver,
            status = ?notification.status,
            group = %format_labels(&notification.group_labels),
            alerts = notification.alerts.len(),
            "Notification"
        );
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "log"
    }

    fn receiver(&self) -> &str {
        &self.receiver
    }
}

pub struct LogPlugin;

impl ChannelPlugin for LogPlugin {
    fn name(&self) -> &str {
        "log"
    }

    fn validate_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn create_channel(&self, receiver: &str, _config: &Value) -> Result<Arc<dyn NotificationChannel>> {
        Ok(Arc::new(LogChannel::new(receiver)))
    }
}
