//! Zone guard - BLE tracker zone-exit monitor
//!
//! Estimates tracker positions from beacon signal strengths and raises an
//! alert when a tracker leaves its assigned room.
//!
//! Module structure:
//! - `domain/` - Core types (rooms, beacons, estimates, alerts, errors)
//! - `io/` - External interfaces (MQTT ingest and egress, store, Prometheus)
//! - `services/` - Logic (estimator, exit detector, alerts, acquisition, monitor)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use zone_guard::infra::{Config, Metrics};
use zone_guard::io::mqtt::{start_mqtt_ingest, UplinkIngest};
use zone_guard::io::store::{CalibrationStore, JsonFileStore};
use zone_guard::io::{create_egress_channel, FeedHub, MqttPublisher};
use zone_guard::services::Monitor;

/// Zone guard - alerts when a tracked device leaves its room
#[derive(Parser, Debug)]
#[command(name = "zone-guard", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-record decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "zone-guard starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        store = %config.store_path(),
        store_reload_secs = ?config.store_reload_interval().map(|d| d.as_secs()),
        devices = %config.assignments().len(),
        trilateration_fallback = %config.trilateration_fallback(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let store: Arc<dyn CalibrationStore> = Arc::new(JsonFileStore::new(config.store_path()));
    let doc = store.load().await.context("loading calibration store")?;
    info!(
        rooms = %doc.rooms.len(),
        beacons = %doc.beacons.len(),
        devices = %doc.devices.len(),
        "store_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let hub = FeedHub::new();

    // Uplinks -> hub
    let ingest = UplinkIngest::new(
        hub.clone(),
        UplinkIngest::resolver_from(&doc.devices),
        config.dedup_capacity(),
        metrics.clone(),
    );
    let mqtt_config = config.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_mqtt_ingest(&mqtt_config, ingest, mqtt_shutdown).await {
            error!(error = %e, "mqtt_ingest_failed");
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = zone_guard::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_failed");
            }
        });
    }

    // Periodic metrics log
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // MQTT egress channel and publisher (if enabled)
    let egress_sender = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());

        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });

        let metrics_egress = egress_sender.clone();
        let metrics_for_egress = metrics.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                metrics_egress.send_metrics(metrics_for_egress.report());
            }
        });

        Some(egress_sender)
    } else {
        None
    };

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let mut monitor = Monitor::new(config, doc, metrics, egress_sender).with_store(store);
    monitor.run(&hub, shutdown_rx).await;

    info!("zone-guard shutdown complete");
    Ok(())
}
