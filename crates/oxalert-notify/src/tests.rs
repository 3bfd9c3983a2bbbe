use crate::autogen::{apply_autogenerated_routes, generate_routes, is_autogenerated_root};
use crate::backend::{Alertmanager, BackendOptions};
use crate::cluster::{Cluster, ClusterPeer, ClusterSettings, NotificationEntry, NotificationLog};
use crate::config::AlertmanagerConfig;
use crate::error::{NotifyError, Result};
use crate::manager::{MultiOrgAlertmanager, NotifierSettings};
use crate::metrics::NotifyMetrics;
use crate::plugin::{ChannelPlugin, ChannelRegistry};
use crate::sender::{parse_alertmanager_urls, targets_hash, AlertsClient};
use crate::{GroupStatus, Notification, NotificationChannel};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use oxalert_common::labels::{
    Labels, ALERTNAME_LABEL, AUTOGENERATED_LABEL, FOLDER_TITLE_LABEL, RECEIVER_LABEL,
    SETTINGS_HASH_LABEL,
};
use oxalert_common::settings::{default_group_by, NotificationSettings};
use oxalert_common::types::{AlertRule, Condition, ExecErrState, NoDataState, PostableAlert, RuleKey};
use oxalert_storage::memory::{MemoryConfigStore, MemoryRuleStore};
use oxalert_storage::{AdminConfig, SendAlertsTo};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

// ── Fakes ──

type Sink = Arc<Mutex<Vec<Notification>>>;

struct RecordingChannel {
    receiver: String,
    sink: Sink,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sink.lock().unwrap().push(notification.clone());
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "record"
    }

    fn receiver(&self) -> &str {
        &self.receiver
    }
}

struct RecordingPlugin {
    sink: Sink,
}

impl ChannelPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        "record"
    }

    fn validate_config(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn create_channel(&self, receiver: &str, _config: &Value) -> Result<Arc<dyn NotificationChannel>> {
        Ok(Arc::new(RecordingChannel {
            receiver: receiver.to_string(),
            sink: Arc::clone(&self.sink),
        }))
    }
}

fn recording_registry() -> (Arc<ChannelRegistry>, Sink) {
    let sink: Sink = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ChannelRegistry::default();
    registry.register(Box::new(RecordingPlugin {
        sink: Arc::clone(&sink),
    }));
    (Arc::new(registry), sink)
}

#[derive(Default)]
struct FakeAlertsClient {
    posted: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl AlertsClient for FakeAlertsClient {
    async fn post_alerts(&self, url: &Url, alerts: &[PostableAlert]) -> Result<()> {
        self.posted
            .lock()
            .unwrap()
            .push((url.to_string(), alerts.len()));
        Ok(())
    }
}

// ── Helpers ──

const CONFIG: &str = r#"{
    "route": {
        "receiver": "A",
        "group_wait": "10s",
        "group_interval": "1m",
        "repeat_interval": "1h",
        "routes": [
            {"receiver": "B", "matchers": [{"name": "team", "type": "=", "value": "ops"}],
             "mute_time_intervals": ["always"]}
        ]
    },
    "receivers": [
        {"name": "A", "integrations": [{"type": "record"}]},
        {"name": "B", "integrations": [{"type": "record"}]}
    ],
    "mute_time_intervals": [{"name": "always"}]
}"#;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

fn alert(name: &str, host: &str, starts: i64, ends: i64) -> PostableAlert {
    let mut labels = Labels::new();
    labels.insert(ALERTNAME_LABEL.into(), name.into());
    labels.insert(FOLDER_TITLE_LABEL.into(), "Infra".into());
    labels.insert("instance".into(), host.into());
    PostableAlert {
        labels,
        annotations: Labels::new(),
        starts_at: t(starts),
        ends_at: t(ends),
        generator_url: String::new(),
    }
}

fn metrics() -> NotifyMetrics {
    NotifyMetrics::unregistered().unwrap()
}

fn two_receivers() -> AlertmanagerConfig {
    AlertmanagerConfig::parse(CONFIG).unwrap()
}

fn make_rule(org_id: i64, uid: &str, settings: Vec<NotificationSettings>) -> AlertRule {
    AlertRule {
        org_id,
        uid: uid.into(),
        title: uid.into(),
        folder_title: "Infra".into(),
        version: 1,
        interval_seconds: 10,
        condition: Condition::default(),
        no_data_state: NoDataState::NoData,
        exec_err_state: ExecErrState::Error,
        for_duration: Duration::ZERO,
        labels: Labels::new(),
        annotations: Labels::new(),
        notification_settings: settings,
        is_paused: false,
    }
}

// ── Route generation ──

#[test]
fn receivers_without_custom_settings_get_default_routes_only() {
    let config = two_receivers();
    let root = generate_routes(&config, Vec::new(), false).unwrap();

    assert!(is_autogenerated_root(&root));
    assert!(!root.continue_matching);
    assert_eq!(root.routes.len(), 2);
    for (route, name) in root.routes.iter().zip(["A", "B"]) {
        assert_eq!(route.receiver.as_deref(), Some(name));
        assert_eq!(route.matchers[0].name, RECEIVER_LABEL);
        assert_eq!(route.matchers[0].value, name);
        assert_eq!(route.group_by, Some(default_group_by()));
        assert!(route.routes.is_empty());
    }
}

#[test]
fn custom_settings_share_one_route_per_fingerprint() {
    let config = two_receivers();
    let mut custom = NotificationSettings::new("B");
    custom.group_by = vec!["instance".into()];
    custom.repeat_interval = Some(Duration::from_secs(600));

    let root = generate_routes(
        &config,
        vec![custom.clone(), custom.clone(), NotificationSettings::new("A")],
        false,
    )
    .unwrap();

    let b = &root.routes[1];
    assert_eq!(b.routes.len(), 1);
    let level3 = &b.routes[0];
    assert_eq!(level3.matchers[0].name, SETTINGS_HASH_LABEL);
    assert_eq!(level3.matchers[0].value, custom.fingerprint().to_string());
    assert_eq!(
        level3.group_by,
        Some(vec![ALERTNAME_LABEL.into(), FOLDER_TITLE_LABEL.into(), "instance".into()])
    );
    assert_eq!(level3.repeat_interval, Some(Duration::from_secs(600)));
    assert!(root.routes[0].routes.is_empty());
}

#[test]
fn splicing_is_idempotent_and_keeps_user_routes() {
    let mut custom = NotificationSettings::new("A");
    custom.group_by = vec!["...".into()];

    let mut once = two_receivers();
    apply_autogenerated_routes(&mut once, vec![custom.clone()], false).unwrap();
    let mut twice = once.clone();
    apply_autogenerated_routes(&mut twice, vec![custom], false).unwrap();

    assert_eq!(once, twice);
    assert_eq!(once.hash().unwrap(), twice.hash().unwrap());
    assert_eq!(twice.route.routes.len(), 2);
    assert!(is_autogenerated_root(&twice.route.routes[0]));
    assert_eq!(twice.route.routes[1].receiver.as_deref(), Some("B"));
    assert_eq!(
        twice.route.routes[0].routes[0].routes[0].group_by,
        Some(vec!["...".to_string()])
    );
}

#[test]
fn invalid_settings_are_skipped_or_rejected() {
    let config = two_receivers();
    let unknown_receiver = NotificationSettings::new("nobody");
    let mut unknown_mute = NotificationSettings::new("A");
    unknown_mute.mute_time_intervals = vec!["weekends".into()];

    let err = generate_routes(&config, vec![unknown_receiver.clone()], false).unwrap_err();
    assert!(matches!(err, NotifyError::InvalidSettings(_)));
    let err = generate_routes(&config, vec![unknown_mute.clone()], false).unwrap_err();
    assert!(err.to_string().contains("weekends"));

    let root = generate_routes(&config, vec![unknown_receiver, unknown_mute], true).unwrap();
    assert_eq!(root.routes.len(), 2);
    assert!(root.routes.iter().all(|r| r.routes.is_empty()));
}

// ── Routing ──

#[test]
fn tagged_alerts_reach_their_settings_route() {
    let mut custom = NotificationSettings::new("B");
    custom.group_by = vec!["instance".into()];
    custom.group_wait = Some(Duration::from_secs(1));
    let mut config = two_receivers();
    apply_autogenerated_routes(&mut config, vec![custom.clone()], false).unwrap();

    let mut labels = alert("cpu", "web-01", 0, 20).labels;
    labels.insert(AUTOGENERATED_LABEL.into(), "true".into());
    labels.insert(RECEIVER_LABEL.into(), "B".into());
    labels.insert(SETTINGS_HASH_LABEL.into(), custom.fingerprint().to_string());

    let matched = config.route.match_labels(&labels);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].receiver, "B");
    assert_eq!(matched[0].group_wait, Duration::from_secs(1));
    // inherited from the user's root
    assert_eq!(matched[0].repeat_interval, Duration::from_secs(3600));
    assert_eq!(
        matched[0].group_labels(&labels).get("instance").map(String::as_str),
        Some("web-01")
    );

    labels.remove(SETTINGS_HASH_LABEL);
    let matched = config.route.match_labels(&labels);
    assert_eq!(matched[0].receiver, "B");
    assert_eq!(matched[0].group_by, default_group_by());

    let plain = alert("cpu", "web-01", 0, 20).labels;
    let matched = config.route.match_labels(&plain);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].receiver, "A");
    assert_eq!(matched[0].id, "0");
}

#[test]
fn continue_matches_later_siblings() {
    let config = AlertmanagerConfig::parse(
        r#"{
        "route": {"receiver": "A", "routes": [
            {"receiver": "B", "continue": true, "matchers": [{"name": "team", "type": "=", "value": "ops"}]},
            {"receiver": "A", "matchers": [{"name": "severity", "type": "!=", "value": "info"}]}
        ]},
        "receivers": [{"name": "A"}, {"name": "B"}]
    }"#,
    )
    .unwrap();
    let mut labels = Labels::new();
    labels.insert("team".into(), "ops".into());
    let matched = config.route.match_labels(&labels);
    assert_eq!(matched.len(), 2);
    assert_eq!(matched[0].id, "0/0");
    assert_eq!(matched[1].id, "0/1");

    labels.insert("severity".into(), "info".into());
    assert_eq!(config.route.match_labels(&labels).len(), 1);
}

#[test]
fn config_rejects_undefined_receiver() {
    let err = AlertmanagerConfig::parse(r#"{"route":{"receiver":"x"},"receivers":[]}"#).unwrap_err();
    assert!(matches!(err, NotifyError::InvalidConfig(_)));
    assert!(AlertmanagerConfig::default().validate().is_ok());
}

// ── Backend ──

fn backend() -> (Alertmanager, Sink) {
    let (registry, sink) = recording_registry();
    let am = Alertmanager::new(1, registry, BackendOptions::default(), metrics());
    (am, sink)
}

#[test]
fn backend_is_not_ready_before_config() {
    let (am, _) = backend();
    assert!(!am.is_ready());
    let err = am.put_alerts(&[alert("cpu", "web-01", 0, 20)], t(0)).unwrap_err();
    assert!(matches!(err, NotifyError::NotReady(1)));
}

#[tokio::test]
async fn backend_groups_dedups_and_resolves() {
    let (am, sink) = backend();
    am.apply_config(two_receivers(), 7).unwrap();
    assert_eq!(am.config_hash(), Some(7));

    am.put_alerts(&[alert("cpu", "web-01", 0, 20)], t(0)).unwrap();
    am.put_alerts(&[alert("cpu", "web-02", 0, 20)], t(1)).unwrap();
    assert_eq!(am.group_count(), 1);

    assert!(am.collect_due(t(5)).is_empty(), "group_wait not elapsed");

    let due = am.collect_due(t(10));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].status, GroupStatus::Firing);
    assert_eq!(due[0].alerts.len(), 2);
    assert_eq!(due[0].receiver, "A");
    am.deliver(due).await;
    assert_eq!(sink.lock().unwrap().len(), 1);

    // heartbeats only: nothing new before repeat_interval
    for at in (15..=60).step_by(15) {
        am.put_alerts(
            &[alert("cpu", "web-01", 0, at + 20), alert("cpu", "web-02", 0, at + 20)],
            t(at),
        )
        .unwrap();
    }
    assert!(am.collect_due(t(70)).is_empty());

    am.put_alerts(
        &[alert("cpu", "web-01", 0, 75), alert("cpu", "web-02", 0, 95)],
        t(75),
    )
    .unwrap();
    for at in [90, 105, 120] {
        am.put_alerts(&[alert("cpu", "web-02", 0, at + 20)], t(at)).unwrap();
    }
    let due = am.collect_due(t(130));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].status, GroupStatus::Firing);
    assert_eq!(due[0].alerts.len(), 2);
    assert_eq!(am.group_count(), 1, "resolved alert purged, firing kept");

    am.put_alerts(&[alert("cpu", "web-02", 0, 150)], t(150)).unwrap();
    let due = am.collect_due(t(190));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].status, GroupStatus::Resolved);
    assert_eq!(am.group_count(), 0);
}

#[test]
fn backend_repeats_firing_groups() {
    let (am, _) = backend();
    am.apply_config(two_receivers(), 1).unwrap();
    am.put_alerts(&[alert("cpu", "web-01", 0, 5000)], t(0)).unwrap();
    assert_eq!(am.collect_due(t(10)).len(), 1);
    assert!(am.collect_due(t(70)).is_empty());
    assert_eq!(am.collect_due(t(3610)).len(), 1);
}

#[test]
fn backend_mute_time_suppresses_delivery() {
    let (am, _) = backend();
    am.apply_config(two_receivers(), 1).unwrap();
    let mut muted = alert("disk", "db-01", 0, 5000);
    muted.labels.insert("team".into(), "ops".into());
    am.put_alerts(&[muted], t(0)).unwrap();

    assert!(am.collect_due(t(10)).is_empty());
    assert_eq!(am.group_count(), 1);
}

#[test]
fn backend_reapply_keeps_unchanged_groups() {
    let (am, _) = backend();
    am.apply_config(two_receivers(), 1).unwrap();
    am.put_alerts(&[alert("cpu", "web-01", 0, 5000)], t(0)).unwrap();
    assert_eq!(am.collect_due(t(10)).len(), 1);

    am.apply_config(two_receivers(), 2).unwrap();
    assert_eq!(am.group_count(), 1);
    assert!(am.collect_due(t(70)).is_empty(), "notification state carried over");
}

#[test]
fn backend_rejects_unknown_integration() {
    let (am, _) = backend();
    let config = AlertmanagerConfig::parse(
        r#"{"route":{"receiver":"A"},"receivers":[{"name":"A","integrations":[{"type":"pager"}]}]}"#,
    )
    .unwrap();
    let err = am.apply_config(config, 1).unwrap_err();
    assert!(matches!(err, NotifyError::UnknownChannelType(_)));
    assert!(!am.is_ready());
}

// ── External senders ──

#[test]
fn alertmanager_urls_are_parsed_and_dropped() {
    let (urls, dropped) = parse_alertmanager_urls(&[
        "http://am:9093".to_string(),
        "https://am.example.com/prefix".to_string(),
        "not a url".to_string(),
    ]);
    let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
    assert_eq!(
        urls,
        vec![
            "http://am:9093/api/v2/alerts".to_string(),
            "https://am.example.com/prefix/api/v2/alerts".to_string(),
        ]
    );
    assert_eq!(dropped, vec!["not a url".to_string()]);
}

#[test]
fn targets_hash_ignores_order() {
    let a = Url::parse("http://a:9093/api/v2/alerts").unwrap();
    let b = Url::parse("http://b:9093/api/v2/alerts").unwrap();
    assert_eq!(
        targets_hash(&[a.clone(), b.clone()]),
        targets_hash(&[b.clone(), a.clone()])
    );
    assert_ne!(targets_hash(&[a]), targets_hash(&[b]));
}

// ── Cluster ──

const PEER_TIMEOUT: Duration = Duration::from_millis(300);

/// A loopback address nothing listens on yet.
fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn entry(receiver: &str, digest: u64, sent_at: DateTime<Utc>, peer: &str) -> NotificationEntry {
    NotificationEntry {
        org_id: 1,
        receiver: receiver.into(),
        group_key: "0:abc".into(),
        digest,
        sent_at,
        peer: peer.into(),
    }
}

fn notification(digest: u64) -> Notification {
    Notification {
        org_id: 1,
        receiver: "A".into(),
        group_key: "0:abc".into(),
        group_labels: Labels::new(),
        status: GroupStatus::Firing,
        alerts: vec![alert("cpu", "web-01", 0, 20)],
        digest,
        repeat_interval: Duration::from_secs(3600),
    }
}

#[tokio::test]
async fn cluster_without_peers_runs_standalone() {
    let standalone = Arc::new(Cluster::standalone());
    assert!(standalone.join().await.is_none());
    assert!(!standalone.is_joined());
    assert_eq!(standalone.delivery_delay(), Duration::ZERO);

    let no_address = Arc::new(Cluster::new(ClusterSettings {
        peers: vec!["127.0.0.1:1".into()],
        advertise_address: None,
        peer_timeout: Duration::from_secs(15),
        join_timeout: Duration::from_millis(100),
    }));
    assert!(no_address.join().await.is_none());
}

#[tokio::test]
async fn standalone_cluster_never_suppresses_its_own_deliveries() {
    let cluster = Cluster::standalone();
    let n = notification(42);
    cluster.record_delivery(&n, Utc::now()).await;
    assert_eq!(cluster.log().len(), 1);
    assert!(!cluster.delivered_by_peer(&n, Utc::now()));
}

#[test]
fn cluster_delay_scales_with_position() {
    let peer = ClusterPeer {
        members: vec!["a:9094".into(), "b:9094".into(), "c:9094".into()],
        position: 2,
        peer_timeout: Duration::from_secs(15),
    };
    assert_eq!(peer.delivery_delay(), Duration::from_secs(30));
}

#[test]
fn notification_log_keeps_latest_delivery_per_group() {
    let log = NotificationLog::default();
    assert!(log.record(entry("A", 1, t(100), "a:9094")));
    assert!(!log.record(entry("A", 2, t(50), "b:9094")), "older entry ignored");
    assert!(log.record(entry("A", 3, t(200), "b:9094")));
    assert!(log.record(entry("B", 1, t(10), "a:9094")));

    assert_eq!(log.len(), 2);
    let latest = log.get(1, "A", "0:abc").unwrap();
    assert_eq!(latest.digest, 3);
    assert_eq!(latest.peer, "b:9094");
    assert!(log.get(2, "A", "0:abc").is_none());

    assert_eq!(log.gc(t(100)), 1);
    assert!(log.get(1, "B", "0:abc").is_none());
}

fn clustered_manager(advertise: &str, peer: &str) -> (MultiOrgAlertmanager, Sink) {
    let configs = Arc::new(MemoryConfigStore::with_orgs([1]));
    configs.save_config(1, CONFIG);
    let (registry, sink) = recording_registry();
    let settings = NotifierSettings {
        poll_interval: Duration::from_secs(3600),
        flush_interval: Duration::from_secs(3600),
        cluster: ClusterSettings {
            peers: vec![peer.to_string()],
            advertise_address: Some(advertise.to_string()),
            peer_timeout: PEER_TIMEOUT,
            join_timeout: Duration::from_secs(1),
        },
    };
    let manager = MultiOrgAlertmanager::new(
        settings,
        configs,
        Arc::new(MemoryRuleStore::new()),
        registry,
        Arc::new(FakeAlertsClient::default()),
        metrics(),
    );
    (manager, sink)
}

#[tokio::test]
async fn cluster_members_share_deliveries() {
    let a_addr = free_addr();
    let b_addr = free_addr();
    let (a, a_sink) = clustered_manager(&a_addr, &b_addr);
    let (b, b_sink) = clustered_manager(&b_addr, &a_addr);

    // backends are created before the cluster is joined
    a.load_and_sync().await;
    b.load_and_sync().await;

    let joined = a.join_cluster().await.unwrap();
    assert_eq!(joined.members, vec![a_addr.clone()], "other member not up yet");
    let joined = b.join_cluster().await.unwrap();
    assert_eq!(joined.members.len(), 2);
    assert_eq!(a.cluster_peer().unwrap().members.len(), 2, "learned from the join");
    assert_eq!(a.join_cluster().await, a.cluster_peer(), "second join is a no-op");

    let (first, first_sink, second, second_sink) = if a.cluster_peer().unwrap().position == 0 {
        (&a, &a_sink, &b, &b_sink)
    } else {
        (&b, &b_sink, &a, &a_sink)
    };
    assert_eq!(second.cluster_peer().unwrap().position, 1);
    assert_eq!(second.cluster().delivery_delay(), PEER_TIMEOUT);

    let first_am = first.alertmanager_for(1).unwrap();
    let second_am = second.alertmanager_for(1).unwrap();
    for am in [&first_am, &second_am] {
        am.put_alerts(&[alert("cpu", "web-01", 0, 5000)], t(0)).unwrap();
    }
    let first_due = first_am.collect_due(t(10));
    let second_due = second_am.collect_due(t(10));
    assert_eq!(first_due.len(), 1);
    assert_eq!(first_due[0].digest, second_due[0].digest);

    let started = std::time::Instant::now();
    tokio::join!(first_am.deliver(first_due), second_am.deliver(second_due));
    assert!(started.elapsed() >= PEER_TIMEOUT);
    assert_eq!(first_sink.lock().unwrap().len(), 1);
    assert!(second_sink.lock().unwrap().is_empty(), "already delivered by the first member");
    assert_eq!(second.cluster().log().len(), 1);

    // the first member goes away; new content is delivered by the second
    first.stop_all().await;
    second_am.put_alerts(&[alert("cpu", "web-02", 0, 5000)], t(20)).unwrap();
    let due = second_am.collect_due(t(70));
    assert_eq!(due.len(), 1);
    second_am.deliver(due).await;
    assert_eq!(second_sink.lock().unwrap().len(), 1);
    let peer = second.cluster_peer().unwrap();
    assert_eq!(peer.members.len(), 1, "unreachable member dropped");
    assert_eq!(peer.delivery_delay(), Duration::ZERO);

    second.stop_all().await;
}

// ── Multi-tenant manager ──

struct Fixture {
    manager: MultiOrgAlertmanager,
    configs: Arc<MemoryConfigStore>,
    rules: Arc<MemoryRuleStore>,
    client: Arc<FakeAlertsClient>,
    metrics: NotifyMetrics,
}

fn fixture() -> Fixture {
    let configs = Arc::new(MemoryConfigStore::with_orgs([1, 2]));
    configs.save_config(1, CONFIG);
    let rules = Arc::new(MemoryRuleStore::with_rules([make_rule(
        1,
        "cpu",
        vec![NotificationSettings::new("B")],
    )]));
    let (registry, _) = recording_registry();
    let client = Arc::new(FakeAlertsClient::default());
    let metrics = metrics();
    let manager = MultiOrgAlertmanager::new(
        NotifierSettings::default(),
        configs.clone(),
        rules.clone(),
        registry,
        client.clone(),
        metrics.clone(),
    );
    Fixture {
        manager,
        configs,
        rules,
        client,
        metrics,
    }
}

#[tokio::test]
async fn manager_syncs_backends_with_storage() {
    let f = fixture();
    f.manager.load_and_sync().await;

    assert_eq!(f.manager.org_ids(), vec![1, 2]);
    assert!(f.manager.alertmanager_for(1).is_ok());
    assert!(f.manager.alertmanager_for(2).is_ok(), "default config applied");
    assert!(matches!(
        f.manager.alertmanager_for(3),
        Err(NotifyError::NotFound(3))
    ));

    let applied = || f.metrics.configs_applied.with_label_values(&["1"]).get();
    assert_eq!(applied(), 1);
    f.manager.load_and_sync().await;
    assert_eq!(applied(), 1, "unchanged config is not re-applied");

    let mut custom = NotificationSettings::new("B");
    custom.group_by = vec!["instance".into()];
    f.rules
        .update(&RuleKey::new(1, "cpu"), |r| r.notification_settings = vec![custom])
        .unwrap();
    f.manager.load_and_sync().await;
    assert_eq!(applied(), 2, "rule settings change the generated routes");

    f.configs.remove_org(2);
    f.manager.load_and_sync().await;
    assert!(matches!(
        f.manager.alertmanager_for(2),
        Err(NotifyError::NotFound(2))
    ));

    f.manager.stop_all().await;
    assert!(f.manager.org_ids().is_empty());
}

#[tokio::test]
async fn manager_routes_alerts_by_admin_config() {
    let f = fixture();
    f.manager.load_and_sync().await;
    f.manager.send(1, vec![alert("cpu", "web-01", 0, 20)]).unwrap();
    assert_eq!(f.manager.alertmanager_for(1).unwrap().group_count(), 1);

    f.configs.set_admin_config(
        1,
        AdminConfig {
            alertmanagers: vec!["http://am:9093".into(), "::bad".into()],
            send_alerts_to: SendAlertsTo::External,
        },
    );
    f.manager.load_and_sync().await;
    assert_eq!(
        f.manager.alertmanagers_for(1),
        vec!["http://am:9093/api/v2/alerts".to_string()]
    );
    assert_eq!(f.manager.dropped_alertmanagers_for(1), vec!["::bad".to_string()]);

    f.manager.send(1, vec![alert("cpu", "web-02", 0, 20)]).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while f.client.posted.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        f.client.posted.lock().unwrap()[0],
        ("http://am:9093/api/v2/alerts".to_string(), 1)
    );
    assert_eq!(
        f.manager.alertmanager_for(1).unwrap().group_count(),
        1,
        "external only: local backend untouched"
    );

    f.configs.set_admin_config(
        1,
        AdminConfig {
            alertmanagers: Vec::new(),
            send_alerts_to: SendAlertsTo::External,
        },
    );
    f.manager.load_and_sync().await;
    assert!(f.manager.alertmanagers_for(1).is_empty());
    let err = f.manager.send(1, vec![alert("cpu", "web-03", 0, 20)]).unwrap_err();
    assert!(matches!(err, NotifyError::NoDestination(1)));

    f.manager.stop_all().await;
}
