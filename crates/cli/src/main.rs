use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use rulesync_controller::{Controller, ControllerConfig};
use rulesync_core::{Event, LabelSelector, PromDuration};
use rulesync_kubehub::KubeLister;
use rulesync_queue::{Backoff, WorkQueue};
use rulesync_ruler::{HttpRulerClient, RulerConfig};
use tokio::signal;
use tracing::{error, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "rulesyncd", version, about = "Sync PrometheusRule resources to a Loki ruler")]
struct Cli {
    /// Base URL of the Loki ruler, e.g. http://loki:3100
    #[arg(long, env = "RULESYNC_ADDRESS")]
    address: Url,

    /// Tenant sent as X-Scope-OrgID
    #[arg(long, env = "RULESYNC_TENANT_ID")]
    tenant_id: Option<String>,

    #[arg(long, env = "RULESYNC_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Use /api/prom/rules instead of /loki/api/v1/rules
    #[arg(long, env = "RULESYNC_USE_LEGACY_ROUTES", action = ArgAction::SetTrue)]
    use_legacy_routes: bool,

    /// Prefix of every ruler namespace this daemon manages
    #[arg(long, env = "RULESYNC_PREFIX", default_value = "rulesync")]
    prefix: String,

    /// Label selector for PrometheusRule resources (k=v, k!=v, k in (a,b), k, !k)
    #[arg(long, env = "RULESYNC_RULE_SELECTOR", default_value = "", value_parser = parse_selector)]
    rule_selector: LabelSelector,

    /// Label selector for namespaces to read rules from
    #[arg(long, env = "RULESYNC_NAMESPACE_SELECTOR", default_value = "", value_parser = parse_selector)]
    namespace_selector: LabelSelector,

    /// How often to resync from the ruler to repair drift
    #[arg(long, env = "RULESYNC_SYNC_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    sync_interval: Duration,

    /// Deadline for one reconciliation pass
    #[arg(long, env = "RULESYNC_DEADLINE", default_value = "5s", value_parser = parse_duration)]
    deadline: Duration,

    /// Failures an event may accumulate before it is dropped
    #[arg(long, env = "RULESYNC_RETRY_BUDGET", default_value_t = 5)]
    retry_budget: u32,

    #[arg(long, env = "RULESYNC_BACKOFF_BASE", default_value = "5ms", value_parser = parse_duration)]
    backoff_base: Duration,

    #[arg(long, env = "RULESYNC_BACKOFF_MAX", default_value = "1000s", value_parser = parse_duration)]
    backoff_max: Duration,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    s.parse::<PromDuration>().map(Duration::from).map_err(|e| e.to_string())
}

fn parse_selector(s: &str) -> Result<LabelSelector, String> { s.parse().map_err(|e: rulesync_core::Error| e.to_string()) }

fn init_tracing() {
    let env = std::env::var("RULESYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RULESYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RULESYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn ruler_client(cli: &Cli) -> Result<HttpRulerClient> {
    let mut cfg = RulerConfig::new(cli.address.clone());
    cfg.tenant_id = cli.tenant_id.clone();
    cfg.bearer_token = cli.bearer_token.clone();
    cfg.use_legacy_routes = cli.use_legacy_routes;
    HttpRulerClient::new(cfg).context("building ruler client")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    info!(address = %cli.address, prefix = %cli.prefix, rule_selector = %cli.rule_selector, namespace_selector = %cli.namespace_selector, "rulesyncd starting");

    let client = rulesync_kubehub::get_kube_client().await?;
    let ruler = ruler_client(&cli)?;
    let queue: WorkQueue<Event> = WorkQueue::with_backoff(Backoff { base: cli.backoff_base, max: cli.backoff_max });

    let cfg = ControllerConfig {
        prefix: cli.prefix.clone(),
        namespace_selector: cli.namespace_selector.clone(),
        rule_selector: cli.rule_selector.clone(),
        deadline: cli.deadline,
        retry_budget: cli.retry_budget,
    };
    let (ns_store, ns_writer) = rulesync_kubehub::namespace_store();
    let (rule_store, rule_writer) = rulesync_kubehub::rule_store();
    let controller = Controller::new(cfg, Arc::new(KubeLister::new(ns_store, rule_store)), Arc::new(ruler), queue.clone());
    let handle = controller.handle();

    let rules_watch = tokio::spawn({
        let client = client.clone();
        let selector = cli.rule_selector.clone();
        let queue = queue.clone();
        async move {
            if let Err(e) = rulesync_kubehub::watch_rules(client, &selector, rule_writer, queue).await {
                error!(error = ?e, "rule watcher failed");
            }
        }
    });
    let ns_watch = tokio::spawn({
        let selector = cli.namespace_selector.clone();
        let queue = queue.clone();
        async move {
            if let Err(e) = rulesync_kubehub::watch_namespaces(client, &selector, ns_writer, queue).await {
                error!(error = ?e, "namespace watcher failed");
            }
        }
    });
    // First tick fires immediately, which also performs the startup sync.
    let ticker = tokio::spawn({
        let queue = queue.clone();
        let every = cli.sync_interval;
        async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if queue.is_shutting_down() {
                    break;
                }
                queue.add(Event::sync_ruler());
            }
        }
    });

    let mut run = tokio::spawn(controller.run());
    tokio::select! {
        res = &mut run => {
            if let Err(e) = res {
                error!(error = %e, "controller task panicked");
            }
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            handle.shutdown();
            if let Err(e) = run.await {
                error!(error = %e, "controller task panicked");
            }
        }
    }

    ticker.abort();
    rules_watch.abort();
    ns_watch.abort();
    let health = handle.health();
    info!(state = health.state.as_str(), message = %health.message, "rulesyncd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_durations_and_selectors() {
        let cli = Cli::try_parse_from([
            "rulesyncd",
            "--address",
            "http://loki:3100/",
            "--rule-selector",
            "team=obs,tier in (a,b)",
            "--sync-interval",
            "1m30s",
        ])
        .unwrap();
        assert_eq!(cli.sync_interval, Duration::from_secs(90));
        assert_eq!(cli.deadline, Duration::from_secs(5));
        assert_eq!(cli.backoff_base, Duration::from_millis(5));
        assert_eq!(cli.prefix, "rulesync");
        assert!(cli.namespace_selector.is_empty());
        assert_eq!(cli.rule_selector.to_string(), "team=obs,tier in (a,b)");
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = Cli::try_parse_from(["rulesyncd", "--address", "http://loki:3100", "--deadline", "5 seconds"]);
        assert!(err.is_err());
    }
}
