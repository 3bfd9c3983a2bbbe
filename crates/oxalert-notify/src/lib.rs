//! Notification dispatch for the alerting engine.
//!
//! Every tenant gets its own [`backend::Alertmanager`], configured from
//! storage by the [`manager::MultiOrgAlertmanager`]. The backend routes
//! alerts through a [`routing::Route`] tree, into which the routes
//! generated by [`autogen`] are spliced, groups and deduplicates them and
//! delivers them through [`NotificationChannel`]s built by the
//! [`plugin::ChannelRegistry`]. Tenants may additionally forward alerts to
//! external Alertmanagers through [`sender::ExternalSender`]s.

pub mod autogen;
pub mod backend;
pub mod channels;
pub mod cluster;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod mute;
pub mod plugin;
pub mod routing;
pub mod sender;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use oxalert_common::labels::Labels;
use oxalert_common::types::{OrgId, PostableAlert};
use serde::Serialize;
use std::time::Duration;

/// Status of a notification as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// At least one alert in the group is still firing.
    Firing,
    Resolved,
}

/// One flush of an aggregation group, handed to the receiver's channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub org_id: OrgId,
    pub receiver: String,
    pub group_key: String,
    pub group_labels: Labels,
    pub status: GroupStatus,
    pub alerts: Vec<PostableAlert>,
    /// Fingerprint of which alerts were sent as firing and which as
    /// resolved. Equal content on two cluster members gives equal digests.
    #[serde(skip)]
    pub digest: u64,
    /// Repeat interval of the group's route.
    #[serde(skip)]
    pub repeat_interval: Duration,
}

/// A delivery sink for grouped notifications.
///
/// Implementations are created by the matching [`plugin::ChannelPlugin`]
/// from a receiver integration.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers one notification.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed after the channel's own retries.
    async fn send(&self, notification: &Notification) -> error::Result<()>;

    /// Plugin type name, e.g. `"webhook"`.
    fn channel_type(&self) -> &str;

    /// Receiver this channel belongs to.
    fn receiver(&self) -> &str;
}
