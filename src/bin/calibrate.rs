//! Zone calibration tool
//!
//! Drives one calibration step at a time against the JSON store.
//!
//! Usage:
//!   zone-calibrate add-point --room living --label "sofa" --x 0.2 --y 0.7
//!   zone-calibrate add-point --room living --label "door out" --x 0.5 --y 1.2 --tag door-outside
//!   zone-calibrate measure --room living --point <point-id> --device tag-1
//!   zone-calibrate set-door --room living --beacon door-1
//!   zone-calibrate estimate --room living --reading C3:00:00:00:00:01=-62 --reading ...
//!
//! `measure` connects to the uplink broker and waits for one fresh sample
//! from the device; Ctrl+C cancels the acquisition.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use zone_guard::domain::types::{BeaconAddress, Point, PointTag, Snapshot};
use zone_guard::domain::DoorGeometry;
use zone_guard::infra::{Config, Metrics};
use zone_guard::io::mqtt::{start_mqtt_ingest, UplinkIngest};
use zone_guard::io::store::{CalibrationStore, JsonFileStore};
use zone_guard::io::FeedHub;
use zone_guard::services::exit_detector::{ExitRoster, ZoneView};
use zone_guard::services::{Acquirer, CalibrationSession, ExitDetector, PositionEstimator};

#[derive(Parser, Debug)]
#[command(name = "zone-calibrate", version, about = "Zone guard calibration tool")]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a calibration point at a normalized position
    AddPoint {
        #[arg(long)]
        room: String,
        #[arg(long)]
        label: String,
        #[arg(long, allow_negative_numbers = true)]
        x: f64,
        #[arg(long, allow_negative_numbers = true)]
        y: f64,
        /// Door role of the point
        #[arg(long, value_enum)]
        tag: Option<DoorTag>,
    },
    /// Record one fresh measurement from a device at a point
    Measure {
        #[arg(long)]
        room: String,
        #[arg(long)]
        point: String,
        #[arg(long)]
        device: String,
        /// Acquisition timeout in milliseconds (capped by config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Set the room's door beacons (registry ids); none clears them
    SetDoor {
        #[arg(long)]
        room: String,
        #[arg(long = "beacon")]
        beacons: Vec<String>,
    },
    /// Estimate a position from readings against the stored calibration
    Estimate {
        #[arg(long)]
        room: String,
        /// ADDRESS=RSSI pair, repeatable
        #[arg(long = "reading", required = true, allow_hyphen_values = true)]
        readings: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DoorTag {
    DoorInside,
    DoorOutside,
}

impl From<DoorTag> for PointTag {
    fn from(tag: DoorTag) -> Self {
        match tag {
            DoorTag::DoorInside => PointTag::DoorInside,
            DoorTag::DoorOutside => PointTag::DoorOutside,
        }
    }
}

fn parse_readings(raw: &[String]) -> anyhow::Result<Snapshot> {
    raw.iter()
        .map(|pair| {
            let (addr, rssi) =
                pair.split_once('=').with_context(|| format!("expected ADDRESS=RSSI, got {pair}"))?;
            let rssi: f64 = rssi.trim().parse().with_context(|| format!("invalid rssi in {pair}"))?;
            Ok((BeaconAddress::new(addr), rssi))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let store: Arc<dyn CalibrationStore> = Arc::new(JsonFileStore::new(config.store_path()));
    let metrics = Arc::new(Metrics::new());
    let hub = FeedHub::new();
    let acquirer = Acquirer::new(hub.clone(), config.acquisition_max_timeout(), metrics.clone());

    match args.command {
        Command::AddPoint { room, label, x, y, tag } => {
            let session =
                CalibrationSession::new(store, acquirer, &room, config.acquisition_timeout());
            let point = session.add_point(&label, Point::new(x, y), tag.map(Into::into)).await?;
            println!("{}", serde_json::to_string_pretty(&point)?);
        }
        Command::Measure { room, point, device, timeout_ms } => {
            let timeout = timeout_ms.map_or(config.acquisition_timeout(), Duration::from_millis);
            let session = CalibrationSession::new(store.clone(), acquirer, &room, timeout);

            let doc = store.load().await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let ingest = UplinkIngest::new(
                hub.clone(),
                UplinkIngest::resolver_from(&doc.devices),
                config.dedup_capacity(),
                metrics.clone(),
            );
            let mqtt_config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = start_mqtt_ingest(&mqtt_config, ingest, shutdown_rx).await {
                    warn!(error = %e, "mqtt_ingest_failed");
                }
            });

            let acquisition = session.start_measurement(&point, &device).await?;
            info!(device = %device, point = %point, timeout_ms = %timeout.as_millis(), "waiting_for_sample");

            let cancel = acquisition.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() && cancel.cancel() {
                    info!("measurement_cancel_requested");
                }
            });

            let result = session.finish_measurement(&point, acquisition).await;
            let _ = shutdown_tx.send(true);
            let measurement = result?;
            println!("{}", serde_json::to_string_pretty(&measurement)?);
        }
        Command::SetDoor { room, beacons } => {
            let session =
                CalibrationSession::new(store, acquirer, &room, config.acquisition_timeout());
            session.set_door_beacons(&beacons).await?;
            match session.door_geometry().await {
                Ok(door) => info!(midpoint = ?door.midpoint, normal = ?door.normal, "door_geometry"),
                Err(e) => warn!(error = %e, "door_geometry_unavailable"),
            }
        }
        Command::Estimate { room, readings } => {
            let snapshot = parse_readings(&readings)?;
            let doc = store.load().await?;
            let profile = doc.require_room(&room)?;

            let beacons = doc.room_beacons(profile);
            let fixed: Vec<_> = if config.trilateration_fallback() {
                beacons.iter().filter(|b| b.position.is_some()).cloned().collect()
            } else {
                Vec::new()
            };
            let estimator = PositionEstimator::new(config.estimator_config());
            let estimate = estimator.estimate(&snapshot, &profile.calibration_points, &fixed);

            let room_addresses: Vec<BeaconAddress> =
                beacons.iter().map(|b| b.address.clone()).collect();
            let door_addresses = doc.door_addresses(profile);
            let zone = ZoneView {
                outline: profile.outline,
                room_beacons: &room_addresses,
                door_beacons: &door_addresses,
                door: DoorGeometry::from_points(&profile.calibration_points, profile.outline).ok(),
            };
            let detector = ExitDetector::new(config.exit_config());
            let Some(decision) =
                detector.decide("cli", estimate.as_ref(), &zone, &snapshot, &ExitRoster::new())
            else {
                bail!("no estimate and no signal override for these readings");
            };

            let out = serde_json::json!({ "estimate": estimate, "decision": decision });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}
