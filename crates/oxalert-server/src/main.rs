use anyhow::{Context, Result};
use oxalert_notify::manager::MultiOrgAlertmanager;
use oxalert_notify::metrics::NotifyMetrics;
use oxalert_notify::plugin::ChannelRegistry;
use oxalert_notify::sender::HttpAlertsClient;
use oxalert_state::manager::StateManager;
use oxalert_storage::memory::{MemoryConfigStore, MemoryRuleStore};
use oxalert_storage::sqlite::SqliteInstanceStore;
use oxalert_storage::RuleStore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oxalert_server::config::{self, RulesSeedFile};
use oxalert_server::evaluator::HttpEvaluator;
use oxalert_server::http;
use oxalert_server::rule_seed;
use oxalert_server::scheduler::metrics::SchedulerMetrics;
use oxalert_server::scheduler::{Scheduler, SchedulerSettings};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxalert-server [config.toml]                         Start the server");
    eprintln!("  oxalert-server init-rules <config.toml> <seed.json>  Validate a rules seed file");
}

fn init_tracing(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("oxalert={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("init-rules") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("init-rules requires <seed.json> argument")
            })?;
            init_tracing("info")?;
            run_init_rules(config_path, seed_path)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

/// Checks a rules seed file against the scheduler settings of a config.
#[allow(clippy::print_stdout)]
fn run_init_rules(config_path: &str, seed_path: &str) -> Result<()> {
    let config = config::ServerConfig::load(config_path)
        .with_context(|| format!("Failed to load config '{config_path}'"))?;
    let mut seed = rule_seed::read_seed_file(seed_path)?;
    let report = rule_seed::check_seed(&mut seed, &config.scheduler);

    tracing::info!(
        accepted = report.accepted,
        skipped = report.skipped,
        unschedulable = report.unschedulable,
        "init-rules completed"
    );
    println!("{}", report.accepted);
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = config::ServerConfig::load(config_path)
        .with_context(|| format!("Failed to load config '{config_path}'"))?;
    init_tracing(&config.log_level)?;
    tracing::info!(config = %config_path, "Configuration loaded");

    let rule_store = Arc::new(MemoryRuleStore::new());
    let config_store = Arc::new(MemoryConfigStore::new());
    let mut seed = match &config.rules_seed {
        Some(path) => rule_seed::read_seed_file(path)?,
        None => {
            tracing::warn!("No rules_seed configured, starting without alert rules");
            RulesSeedFile::default()
        }
    };
    let report = rule_seed::check_seed(&mut seed, &config.scheduler);
    rule_seed::apply_seed(seed, &rule_store, &config_store);
    tracing::info!(
        rules = rule_store.count(None).await?,
        skipped = report.skipped,
        "Alert rules loaded"
    );

    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("Failed to create data dir '{}'", config.storage.data_dir))?;
    let instance_store = Arc::new(SqliteInstanceStore::new(Path::new(&config.storage.data_dir))?);
    tracing::info!(path = %instance_store.path().display(), "Instance store opened");

    let evaluator_url = config
        .evaluator
        .url
        .as_deref()
        .context("evaluator.url must be set")?;
    let evaluator = Arc::new(HttpEvaluator::new(
        evaluator_url,
        Duration::from_secs(config.evaluator.timeout_secs),
    )?);
    tracing::info!(endpoint = %evaluator.endpoint(), "Evaluator configured");

    let registry = prometheus::Registry::new();
    let notify_metrics = NotifyMetrics::new(&registry)?;
    let scheduler_metrics = SchedulerMetrics::new(&registry)?;

    let alerts_client = Arc::new(HttpAlertsClient::new(Duration::from_secs(30))?);
    let manager = Arc::new(MultiOrgAlertmanager::new(
        config.notifier.to_settings(),
        config_store,
        rule_store.clone(),
        Arc::new(ChannelRegistry::default()),
        alerts_client,
        notify_metrics,
    ));
    // Backends also pick up membership changes made after this.
    manager.join_cluster().await;
    manager.load_and_sync().await;

    let state_manager = Arc::new(StateManager::new(
        config.scheduler.max_state_history,
        Duration::from_secs(config.scheduler.resend_delay_secs),
    ));
    let scheduler = Arc::new(Scheduler::new(
        SchedulerSettings::from(&config.scheduler),
        rule_store,
        instance_store,
        evaluator,
        state_manager,
        manager.clone(),
        scheduler_metrics,
    ));
    scheduler.warm_up().await;

    let shutdown = CancellationToken::new();
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_handle = {
        let app = http::build_http_app(registry);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { http::serve(http_addr, app, shutdown).await })
    };
    let manager_handle = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    tracing::info!("oxalert server running");
    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    shutdown.cancel();

    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Scheduler task failed");
    }
    if let Err(e) = manager_handle.await {
        tracing::error!(error = %e, "Alertmanager task failed");
    }
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Metrics endpoint failed"),
        Err(e) => tracing::error!(error = %e, "Metrics endpoint task failed"),
    }
    tracing::info!("oxalert server stopped");
    Ok(())
}
