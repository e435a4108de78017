//! absence-watch - camera zone absence alerting
//!
//! Subscribes to per-zone person counts from cameras over MQTT and emails or
//! texts a zone's recipients, with a camera snapshot, when nobody has been seen
//! in the zone for longer than its threshold.
//!
//! Module structure:
//! - `domain/` - Core types (zones, detection events, alerts, errors)
//! - `io/` - External interfaces (MQTT, snapshot API, SMTP, Prometheus)
//! - `services/` - Business logic (ZoneRegistry, AbsenceTracker, Dispatcher)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use absence_watch::infra::{Config, Metrics};
use absence_watch::io::{MerakiSnapshotClient, SmtpMailer};
use absence_watch::services::{create_dispatch_worker, AbsenceTracker, Dispatcher, SnapshotSource};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Detection events buffered between MQTT ingress and the tracker
const EVENT_QUEUE_SIZE: usize = 1000;

/// absence-watch - alert when nobody is seen in a camera zone
#[derive(Parser, Debug)]
#[command(name = "absence-watch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/absence.toml")]
    config: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line, for log shippers
    Json,
}

fn init_tracing(format: LogFormat) {
    // RUST_LOG controls the level, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), build = env!("ABSENCE_WATCH_BUILD"), "absence_watch_starting");

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    if config.broker_enabled() {
        absence_watch::infra::broker::start_embedded_broker(&config)
            .context("failed to start embedded broker")?;
    }

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        zones = %config.zones().len(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        topic_prefix = %config.mqtt_topic_prefix(),
        min_event_interval_ms = %config.mqtt_min_event_interval_ms(),
        snapshots = %config.snapshot().enabled,
        smtp_host = %config.smtp_host(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Delivery side: snapshot source, SMTP sender, dispatch worker
    let snapshots: Option<Arc<dyn SnapshotSource>> = if config.snapshot().enabled {
        let client: Arc<dyn SnapshotSource> =
            Arc::new(MerakiSnapshotClient::new(&config).context("failed to build snapshot client")?);
        Some(client)
    } else {
        None
    };
    let mailer = Arc::new(SmtpMailer::new(&config).context("failed to configure SMTP")?);
    let dispatcher = Arc::new(Dispatcher::new(&config, snapshots, mailer, metrics.clone()));
    let (alert_tx, dispatch_worker) = create_dispatch_worker(dispatcher, config.dispatch_queue_size());
    tokio::spawn(dispatch_worker.run());

    // Ingress side: bounded channel into the tracker
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            absence_watch::io::mqtt::start_mqtt_client(&mqtt_config, event_tx, mqtt_metrics, mqtt_shutdown).await
        {
            error!(error = %e, "mqtt_client_error");
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = absence_watch::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Periodic metrics log line
    let report_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            report_metrics.report().log();
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let mut tracker = AbsenceTracker::new(config.zones().clone(), metrics);
    tracker.run(event_rx, alert_tx, shutdown_rx).await;

    info!("absence_watch_shutdown_complete");
    Ok(())
}
