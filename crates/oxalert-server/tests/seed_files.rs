use oxalert_notify::config::AlertmanagerConfig;
use oxalert_server::config::ServerConfig;
use oxalert_server::rule_seed::{check_seed, read_seed_file};
use std::path::PathBuf;

fn repo_file(rel: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../..");
    path.push(rel);
    path.to_string_lossy().into_owned()
}

#[test]
fn shipped_config_loads() {
    let config = ServerConfig::load(&repo_file("config/server.toml")).unwrap();
    assert_eq!(config.scheduler.base_interval_secs, 10);
    assert!(config.evaluator.url.is_some());
    assert_eq!(config.rules_seed.as_deref(), Some("config/rules.seed.json"));
}

#[test]
fn shipped_seed_is_valid() {
    let config = ServerConfig::load(&repo_file("config/server.toml")).unwrap();
    let mut seed = read_seed_file(&repo_file("config/rules.seed.json")).unwrap();
    let report = check_seed(&mut seed, &config.scheduler);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.unschedulable, 0);
    assert_eq!(report.accepted, 3);

    for am in &seed.alertmanager_configs {
        let parsed = AlertmanagerConfig::parse(&am.config.to_string()).unwrap();
        assert!(parsed.receiver_names().contains(&"ops-webhook".to_string()));
    }
}
