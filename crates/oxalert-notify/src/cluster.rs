//! Coordination between redundant instances of the server.
//!
//! Every instance evaluates the same rules and would deliver the same
//! notifications. Members agree on an order by sorting their advertise
//! addresses: the member at position `n` waits `n × peer_timeout` before
//! delivering, and skips a group that another member already delivered
//! with the same content. Deliveries are kept in a [`NotificationLog`] and
//! pushed to every member over line-delimited JSON on a plain TCP
//! connection.

use crate::error::{NotifyError, Result};
use crate::Notification;
use chrono::{DateTime, Utc};
use oxalert_common::chrono_duration;
use oxalert_common::types::OrgId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long delivered notifications are remembered.
const LOG_RETENTION: Duration = Duration::from_secs(120 * 3600);

/// Lower bound for a single exchange with a peer.
const MIN_EXCHANGE_TIMEOUT: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSettings {
    /// `host:port` of the other instances.
    pub peers: Vec<String>,
    /// Address this instance listens on and is known by; required to take
    /// part.
    pub advertise_address: Option<String>,
    pub peer_timeout: Duration,
    pub join_timeout: Duration,
}

/// Snapshot of this instance's place in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPeer {
    pub members: Vec<String>,
    pub position: usize,
    pub peer_timeout: Duration,
}

impl ClusterPeer {
    pub fn delivery_delay(&self) -> Duration {
        self.peer_timeout * self.position as u32
    }
}

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub org_id: OrgId,
    pub receiver: String,
    pub group_key: String,
    /// Fingerprint of the firing and resolved alerts that were sent.
    pub digest: u64,
    pub sent_at: DateTime<Utc>,
    /// Advertise address of the member that delivered, empty when
    /// standalone.
    pub peer: String,
}

type EntryKey = (OrgId, String, String);

/// Latest delivery per tenant, receiver and aggregation group, whichever
/// member made it.
#[derive(Debug, Default)]
pub struct NotificationLog {
    entries: Mutex<HashMap<EntryKey, NotificationEntry>>,
}

impl NotificationLog {
    /// Stores `entry` unless a newer one for the same group is known.
    pub fn record(&self, entry: NotificationEntry) -> bool {
        let key = (entry.org_id, entry.receiver.clone(), entry.group_key.clone());
        let mut entries = lock(&self.entries);
        match entries.get(&key) {
            Some(existing) if existing.sent_at >= entry.sent_at => false,
            _ => {
                entries.insert(key, entry);
                true
            }
        }
    }

    pub fn get(&self, org_id: OrgId, receiver: &str, group_key: &str) -> Option<NotificationEntry> {
        lock(&self.entries)
            .get(&(org_id, receiver.to_string(), group_key.to_string()))
            .cloned()
    }

    pub fn entries(&self) -> Vec<NotificationEntry> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries sent before `cutoff` and returns how many went.
    pub fn gc(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| e.sent_at >= cutoff);
        before - entries.len()
    }
}

/// Wire messages. Each connection carries one request line and one reply
/// line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message {
    /// A member announcing itself; answered with `State`.
    Join { from: String },
    State {
        members: Vec<String>,
        entries: Vec<NotificationEntry>,
    },
    /// Deliveries made by `from`; answered with `Ack`.
    Notified {
        from: String,
        entries: Vec<NotificationEntry>,
    },
    Ack,
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Message> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a message arrived",
        ));
    }
    Ok(serde_json::from_str(&line)?)
}

/// Sends `request` to `addr` and waits for the reply.
async fn exchange(addr: &str, request: &Message, timeout: Duration) -> Result<Message> {
    let round_trip = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_message(&mut stream, request).await?;
        read_message(&mut BufReader::new(stream)).await
    };
    let cluster_err = |reason: String| NotifyError::Cluster {
        peer: addr.to_string(),
        reason,
    };
    match tokio::time::timeout(timeout, round_trip).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(cluster_err(e.to_string())),
        Err(_) => Err(cluster_err(format!("no reply within {timeout:?}"))),
    }
}

#[derive(Debug)]
struct Membership {
    advertise: String,
    members: BTreeSet<String>,
}

/// This instance's view of the cluster and its notification log.
///
/// A `Cluster` exists even when clustering is off; it then never delays
/// and never suppresses a delivery.
#[derive(Debug)]
pub struct Cluster {
    settings: ClusterSettings,
    log: NotificationLog,
    membership: RwLock<Option<Membership>>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    pub fn new(settings: ClusterSettings) -> Self {
        Self {
            settings,
            log: NotificationLog::default(),
            membership: RwLock::new(None),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
        }
    }

    /// A cluster that never joins.
    pub fn standalone() -> Self {
        Self::new(ClusterSettings::default())
    }

    pub fn log(&self) -> &NotificationLog {
        &self.log
    }

    fn exchange_timeout(&self) -> Duration {
        self.settings.join_timeout.max(MIN_EXCHANGE_TIMEOUT)
    }

    /// Starts listening on the advertise address and announces this
    /// instance to the configured peers.
    ///
    /// Returns `None` when clustering is not configured or the address
    /// cannot be bound; the instance then runs on its own. Peers that do
    /// not answer may join later. Calling this again once joined only
    /// returns the current membership.
    pub async fn join(self: &Arc<Self>) -> Option<ClusterPeer> {
        if self.is_joined() {
            return self.peer();
        }
        if self.settings.peers.is_empty() {
            return None;
        }
        let Some(advertise) = self.settings.advertise_address.clone() else {
            tracing::warn!("Cluster peers configured without advertise_address, running standalone");
            return None;
        };

        let listener = match TcpListener::bind(advertise.as_str()).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(address = %advertise, error = %e, "Failed to listen for cluster peers, running standalone");
                return None;
            }
        };
        *self.membership_mut() = Some(Membership {
            advertise: advertise.clone(),
            members: BTreeSet::from([advertise.clone()]),
        });
        let handle = tokio::spawn(Arc::clone(self).serve(listener));
        *lock(&self.listener) = Some(handle);

        let mut reached = 0;
        let join = Message::Join {
            from: advertise.clone(),
        };
        for peer in self.settings.peers.iter().filter(|p| **p != advertise) {
            match exchange(peer, &join, self.exchange_timeout()).await {
                Ok(Message::State { members, entries }) => {
                    reached += 1;
                    self.add_member(peer);
                    for member in &members {
                        self.add_member(member);
                    }
                    for entry in entries {
                        self.log.record(entry);
                    }
                }
                Ok(other) => {
                    tracing::warn!(peer = %peer, reply = ?other, "Unexpected reply to cluster join")
                }
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Cluster peer unreachable"),
            }
        }
        if reached == 0 {
            tracing::warn!("No cluster peer reachable, waiting for peers to join");
        }

        let peer = self.peer();
        if let Some(p) = &peer {
            tracing::info!(
                address = %advertise,
                position = p.position,
                members = p.members.len(),
                "Joined notification cluster"
            );
        }
        peer
    }

    fn membership_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Membership>> {
        self.membership
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn membership(&self) -> std::sync::RwLockReadGuard<'_, Option<Membership>> {
        self.membership
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_joined(&self) -> bool {
        self.membership().is_some()
    }

    fn advertise(&self) -> String {
        self.membership()
            .as_ref()
            .map(|m| m.advertise.clone())
            .unwrap_or_default()
    }

    fn add_member(&self, member: &str) {
        if let Some(m) = self.membership_mut().as_mut() {
            if m.members.insert(member.to_string()) {
                tracing::info!(peer = %member, members = m.members.len(), "Cluster peer joined");
            }
        }
    }

    fn remove_member(&self, member: &str) {
        if let Some(m) = self.membership_mut().as_mut() {
            if member != m.advertise && m.members.remove(member) {
                tracing::warn!(peer = %member, members = m.members.len(), "Cluster peer dropped");
            }
        }
    }

    /// Current membership, `None` when not clustered.
    pub fn peer(&self) -> Option<ClusterPeer> {
        let membership = self.membership();
        let m = membership.as_ref()?;
        let members: Vec<String> = m.members.iter().cloned().collect();
        let position = members.iter().position(|p| *p == m.advertise).unwrap_or(0);
        Some(ClusterPeer {
            members,
            position,
            peer_timeout: self.settings.peer_timeout,
        })
    }

    /// Wait before a delivery, read at delivery time so membership changes
    /// apply to running backends.
    pub fn delivery_delay(&self) -> Duration {
        self.peer().map(|p| p.delivery_delay()).unwrap_or_default()
    }

    /// Whether another member delivered `n` with the same content within
    /// the group's repeat interval.
    pub fn delivered_by_peer(&self, n: &Notification, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.log.get(n.org_id, &n.receiver, &n.group_key) else {
            return false;
        };
        entry.peer != self.advertise()
            && entry.digest == n.digest
            && now - entry.sent_at < chrono_duration(n.repeat_interval)
    }

    /// Records the delivery of `n` and pushes it to the other members.
    /// Members that cannot be reached are dropped until they join again.
    pub async fn record_delivery(&self, n: &Notification, sent_at: DateTime<Utc>) {
        let advertise = self.advertise();
        let entry = NotificationEntry {
            org_id: n.org_id,
            receiver: n.receiver.clone(),
            group_key: n.group_key.clone(),
            digest: n.digest,
            sent_at,
            peer: advertise.clone(),
        };
        self.log.record(entry.clone());
        self.log.gc(sent_at - chrono_duration(LOG_RETENTION));

        let others: Vec<String> = self
            .membership()
            .as_ref()
            .map(|m| m.members.iter().filter(|p| **p != m.advertise).cloned().collect())
            .unwrap_or_default();
        if others.is_empty() {
            return;
        }
        let message = Message::Notified {
            from: advertise,
            entries: vec![entry],
        };
        for peer in others {
            match exchange(&peer, &message, self.exchange_timeout()).await {
                Ok(Message::Ack) => {}
                Ok(other) => {
                    tracing::warn!(peer = %peer, reply = ?other, "Unexpected reply to cluster update")
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Failed to share notification with cluster peer");
                    self.remove_member(&peer);
                }
            }
        }
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept cluster connection");
                        continue;
                    }
                },
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream).await {
                    tracing::debug!(remote = %remote, error = %e, "Cluster connection failed");
                }
            });
        }
        tracing::debug!("Cluster listener stopped");
    }

    async fn handle(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut stream = BufReader::new(stream);
        let request = tokio::time::timeout(self.exchange_timeout(), read_message(&mut stream))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no request received"))??;
        let reply = match request {
            Message::Join { from } => {
                self.add_member(&from);
                Message::State {
                    members: self.peer().map(|p| p.members).unwrap_or_default(),
                    entries: self.log.entries(),
                }
            }
            Message::Notified { from, entries } => {
                self.add_member(&from);
                for entry in entries {
                    self.log.record(entry);
                }
                Message::Ack
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected cluster request: {other:?}"),
                ))
            }
        };
        write_message(stream.get_mut(), &reply).await
    }

    /// Stops listening. Membership is kept for the remaining deliveries.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = lock(&self.listener).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Cluster listener panicked");
            }
        }
    }
}
