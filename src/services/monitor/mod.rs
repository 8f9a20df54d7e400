//! Live zone monitoring
//!
//! The Monitor is the run-time path of the data flow:
//! - Subscribes to the feed of every assigned device
//! - Estimates each device's position from its latest snapshot
//! - Decides inside/outside and keeps the per-room exit roster
//! - Raises and dismisses alerts, and expires them on a tick
//! - Streams positions, device status and alert changes to egress
//! - Re-reads the store periodically so calibration edits take effect

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::geometry::DoorGeometry;
use crate::domain::types::{
    Beacon, BeaconAddress, DeviceEvents, ExitDecision, FeedRecord, PositionEstimate, RoomProfile,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress::Egress;
use crate::io::egress_channel::{AlertPayload, EgressSender};
use crate::io::feed_hub::{FeedHub, Subscription};
use crate::io::store::{CalibrationStore, StoreDocument};
use crate::services::alerts::AlertCenter;
use crate::services::estimator::PositionEstimator;
use crate::services::exit_detector::{ExitDetector, ExitRoster, ZoneView};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Precomputed room data plus the room's exit roster
pub(crate) struct RoomState {
    pub(crate) room: RoomProfile,
    /// Registry beacons with a fixed coordinate, for trilateration
    pub(crate) fixed_beacons: Vec<Beacon>,
    pub(crate) room_addresses: Vec<BeaconAddress>,
    pub(crate) door_addresses: Vec<BeaconAddress>,
    pub(crate) door: Option<DoorGeometry>,
    pub(crate) roster: ExitRoster,
}

impl RoomState {
    fn build(doc: &StoreDocument, room: &RoomProfile) -> Self {
        let beacons = doc.room_beacons(room);
        let door = match DoorGeometry::from_points(&room.calibration_points, room.outline) {
            Ok(door) => Some(door),
            Err(e) => {
                debug!(room_id = %room.id, reason = %e, "room_without_door_geometry");
                None
            }
        };
        Self {
            room: room.clone(),
            fixed_beacons: beacons.iter().filter(|b| b.position.is_some()).cloned().collect(),
            room_addresses: beacons.iter().map(|b| b.address.clone()).collect(),
            door_addresses: doc.door_addresses(room),
            door,
            roster: ExitRoster::new(),
        }
    }

    pub(crate) fn view(&self) -> ZoneView<'_> {
        ZoneView {
            outline: self.room.outline,
            room_beacons: &self.room_addresses,
            door_beacons: &self.door_addresses,
            door: self.door,
        }
    }
}

/// Last known position of a device (last write wins)
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPosition {
    pub room_id: String,
    pub estimate: Option<PositionEstimate>,
    pub decision: ExitDecision,
    pub sampled_at: DateTime<Utc>,
}

/// Last reported telemetry of a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub last_seen: DateTime<Utc>,
    pub battery_pct: Option<u8>,
    pub motion: bool,
    pub last_event: Option<&'static str>,
    pub events: DeviceEvents,
}

/// Live tracking loop over all assigned devices
pub struct Monitor {
    pub(crate) config: Config,
    /// Device registry and room profiles as loaded at startup
    pub(crate) doc: StoreDocument,
    pub(crate) rooms: HashMap<String, RoomState>,
    pub(crate) estimator: PositionEstimator,
    pub(crate) detector: ExitDetector,
    pub(crate) alerts: AlertCenter,
    pub(crate) positions: FxHashMap<String, TrackedPosition>,
    pub(crate) devices: FxHashMap<String, DeviceState>,
    /// Writes alert history to file
    pub(crate) egress: Egress,
    pub(crate) metrics: Arc<Metrics>,
    /// MQTT egress sender (optional)
    pub(crate) egress_sender: Option<EgressSender>,
    /// Source for periodic reloads (optional)
    pub(crate) store: Option<Arc<dyn CalibrationStore>>,
}

impl Monitor {
    pub fn new(
        config: Config,
        doc: StoreDocument,
        metrics: Arc<Metrics>,
        egress_sender: Option<EgressSender>,
    ) -> Self {
        let rooms = doc.rooms.iter().map(|r| (r.id.clone(), RoomState::build(&doc, r))).collect();
        for (device_id, room_id) in config.assignments() {
            if doc.room(room_id).is_none() {
                warn!(device_id = %device_id, room_id = %room_id, "assigned_room_not_in_store");
            }
        }
        Self {
            estimator: PositionEstimator::new(config.estimator_config()),
            detector: ExitDetector::new(config.exit_config()),
            alerts: AlertCenter::new(config.auto_dismiss()),
            egress: Egress::new(config.egress_file()),
            rooms,
            positions: FxHashMap::default(),
            devices: FxHashMap::default(),
            config,
            doc,
            metrics,
            egress_sender,
            store: None,
        }
    }

    /// Re-read rooms, beacons and devices from this store while running
    pub fn with_store(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load the store and apply it if it changed; returns whether it did
    pub async fn refresh_from_store(&mut self) -> bool {
        let Some(store) = self.store.clone() else {
            return false;
        };
        match store.load().await {
            Ok(doc) if doc != self.doc => {
                self.reload(doc);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "store_reload_failed");
                false
            }
        }
    }

    /// Swap in a freshly loaded document, keeping exit rosters
    pub fn reload(&mut self, doc: StoreDocument) {
        let mut rooms: HashMap<String, RoomState> =
            doc.rooms.iter().map(|r| (r.id.clone(), RoomState::build(&doc, r))).collect();
        for (room_id, state) in rooms.iter_mut() {
            if let Some(old) = self.rooms.remove(room_id) {
                state.roster = old.roster;
            }
        }
        info!(rooms = %rooms.len(), "monitor_store_reloaded");
        self.rooms = rooms;
        self.doc = doc;
        self.update_gauges();
    }

    pub fn position(&self, device_id: &str) -> Option<&TrackedPosition> {
        self.positions.get(device_id)
    }

    pub fn device_state(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    pub fn alerts(&self) -> &AlertCenter {
        &self.alerts
    }

    /// Devices currently outside a room, in exit order
    pub fn exited(&self, room_id: &str) -> &[String] {
        self.rooms.get(room_id).map(|s| s.roster.devices()).unwrap_or(&[])
    }

    /// Run the monitor until shutdown
    ///
    /// Each assigned device gets a forwarder task that moves its hub
    /// subscription into one bounded queue; a full queue drops records.
    /// Forwarders are aborted on exit, which releases their subscriptions.
    pub async fn run(&mut self, hub: &FeedHub, mut shutdown: watch::Receiver<bool>) {
        let (record_tx, mut record_rx) = mpsc::channel(self.config.queue_capacity());

        let mut device_ids: Vec<&String> = self.config.assignments().keys().collect();
        device_ids.sort();
        let forwarders: Vec<JoinHandle<()>> = device_ids
            .into_iter()
            .map(|device_id| {
                spawn_forwarder(hub.subscribe(device_id), record_tx.clone(), self.metrics.clone())
            })
            .collect();
        drop(record_tx);

        info!(devices = %forwarders.len(), rooms = %self.rooms.len(), "monitor_started");

        let mut tick_interval = interval(self.config.alert_tick());

        let reload_period = self.config.store_reload_interval().filter(|_| self.store.is_some());
        let reload_every = reload_period.unwrap_or(Duration::from_secs(3600));
        let mut reload_interval =
            interval_at(tokio::time::Instant::now() + reload_every, reload_every);
        reload_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("monitor_shutdown");
                        break;
                    }
                }
                record = record_rx.recv() => {
                    match record {
                        Some(record) => {
                            self.metrics.set_feed_queue_depth(record_rx.len() as u64);
                            self.process_record(record, tokio::time::Instant::now().into_std());
                        }
                        None => break,
                    }
                }
                _ = tick_interval.tick() => {
                    self.tick(tokio::time::Instant::now().into_std());
                }
                _ = reload_interval.tick(), if reload_period.is_some() => {
                    self.refresh_from_store().await;
                }
            }
        }

        for forwarder in forwarders {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }

    /// Process one feed record; returns the exit decision if one was made
    pub fn process_record(&mut self, record: FeedRecord, now: Instant) -> Option<ExitDecision> {
        let snapshot = record.snapshot();
        let dropped = record.readings.len().saturating_sub(snapshot.len());
        self.metrics.record_feed_record(dropped as u64);

        self.handle_status(&record, now);
        let decision = self.handle_position(&record, &snapshot, now);

        self.flush_alert_changes();
        self.update_gauges();
        decision
    }

    /// Expire alerts whose auto-dismiss deadline has passed
    pub fn tick(&mut self, now: Instant) {
        let expired = self.alerts.expire_due(now);
        if !expired.is_empty() {
            self.flush_alert_changes();
            self.update_gauges();
        }
    }

    /// Drain alert changes into metrics, the history file and MQTT
    fn flush_alert_changes(&mut self) {
        use crate::services::alerts::AlertChange;

        for change in self.alerts.take_changes() {
            match change {
                AlertChange::Raised(_) => self.metrics.record_alert_raised(),
                AlertChange::Dismissed(_) => self.metrics.record_alert_dismissed(),
                AlertChange::Expired(_) => self.metrics.record_alert_expired(),
            }
            self.egress.write_alert_change(&change);
            if let Some(ref sender) = self.egress_sender {
                sender.send_alert(AlertPayload::from_change(&change));
            }
        }
    }

    fn update_gauges(&self) {
        self.metrics.set_active_alerts(self.alerts.active_count() as u64);
        let exited: usize = self.rooms.values().map(|s| s.roster.len()).sum();
        self.metrics.set_exited_devices(exited as u64);
    }
}

fn spawn_forwarder(
    mut sub: Subscription,
    record_tx: mpsc::Sender<FeedRecord>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = sub.recv().await {
            match record_tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    metrics.record_feed_record_dropped();
                    warn!(device_id = %dropped.device_id, "feed_record_dropped: queue full");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        sub.close();
    })
}
